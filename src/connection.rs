//! Connection builder and request/reply plumbing.
//!
//! The [`ConnectionBuilder`] configures deadlines and limits; the
//! [`Connection`] owns the socket and:
//! 1. Allocates request ids
//! 2. Encodes and sends insert/update/remove/query messages
//! 3. Reads replies on demand and routes each one to the cursor waiting on
//!    its `responseTo`
//! 4. Latches the first fatal error and refuses all I/O afterwards
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use mongowire::{Connection, FindOptions};
//!
//! #[tokio::main]
//! async fn main() -> mongowire::Result<()> {
//!     let conn = Connection::dial("localhost").await?;
//!     conn.insert("test.items", &[doc! { "name": "bolt" }]).await?;
//!
//!     let mut cursor = conn
//!         .find("test.items", &doc! {}, FindOptions::new().limit(10))
//!         .await?;
//!     while cursor.has_next().await {
//!         let item: bson::Document = cursor.next().await?;
//!         println!("{}", item);
//!     }
//!     if let Some(err) = cursor.error() {
//!         return Err(err);
//!     }
//!     conn.close().await
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

use crate::cursor::{Cursor, CursorState, ResponseBatch};
use crate::error::{DriverError, Result};
use crate::options::{FindOptions, RemoveOptions, UpdateOptions};
use crate::protocol::{
    build_delete, build_get_more, build_insert, build_kill_cursors, build_query, build_update,
    query_flags, has_flag, OpCode, ReplyHeader, DEFAULT_MAX_MESSAGE_SIZE, REPLY_HEADER_SIZE,
};
use crate::transport::{connect, Transport};

/// Local handle for a cursor's slot in the connection's cursor table.
pub(crate) type CursorKey = u64;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for reading one reply. `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    /// Deadline for writing one message. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
    /// Largest reply accepted before the connection is declared corrupt.
    pub max_message_size: u32,
    /// Set `TCP_NODELAY` when dialing.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            nodelay: true,
        }
    }
}

/// Builder for configuring and opening a [`Connection`].
pub struct ConnectionBuilder {
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Create a new connection builder.
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
        }
    }

    /// Set the read deadline.
    ///
    /// Default: none
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Set the write deadline.
    ///
    /// Default: none
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    /// Set the maximum accepted reply size.
    ///
    /// Default: 48 MB
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set `TCP_NODELAY`.
    ///
    /// Default: true
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.config.nodelay = nodelay;
        self
    }

    /// Dial the server at `addr` (default port 27017).
    pub async fn dial(self, addr: &str) -> Result<Connection> {
        let stream = connect(addr, self.config.nodelay).await?;
        Ok(Connection::from_stream(stream, self.config))
    }

    /// Run the connection over an already-established stream.
    pub fn connect_stream<S: Transport>(self, stream: S) -> Connection {
        Connection::from_stream(stream, self.config)
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection state plus the keys of cursors dropped without `close()`.
pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    dropped: StdMutex<Vec<CursorKey>>,
}

impl Shared {
    /// Lock the connection state, reaping cursors dropped since the last lock.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        let mut state = self.state.lock().await;
        if state.io_in_flight {
            state.io_in_flight = false;
            state.fatal(DriverError::Interrupted);
        }
        let dropped = {
            let mut dropped = self.dropped.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *dropped)
        };
        for key in dropped {
            state.reap(key);
        }
        state
    }

    /// Record a cursor handle dropped while still open.
    ///
    /// Runs from `Drop`, so it must not wait on the async state lock.
    pub(crate) fn release(&self, key: CursorKey) {
        let mut dropped = self.dropped.lock().unwrap_or_else(|e| e.into_inner());
        dropped.push(key);
    }
}

/// An open connection to a database server.
///
/// Operations take `&self` and are serialized internally. Cursors returned by
/// [`find`](Connection::find) hold only a weak reference back, so dropping the
/// connection closes the socket and invalidates them.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Dial `addr` with the default configuration.
    pub async fn dial(addr: &str) -> Result<Self> {
        ConnectionBuilder::new().dial(addr).await
    }

    /// Run a connection over `stream`.
    pub fn from_stream<S: Transport>(stream: S, config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::new(Box::new(stream), config)),
                dropped: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Insert one or more documents. No reply is expected.
    pub async fn insert<T: Serialize>(&self, namespace: &str, documents: &[T]) -> Result<()> {
        let mut state = self.shared.lock().await;
        state.check()?;
        let request_id = state.next_request_id();
        let msg = build_insert(request_id, namespace, documents)?;
        state.send(OpCode::Insert, request_id, &msg).await
    }

    /// Update documents matching `selector` with `document`.
    pub async fn update<U, S>(
        &self,
        namespace: &str,
        document: &U,
        selector: &S,
        options: UpdateOptions,
    ) -> Result<()>
    where
        U: Serialize,
        S: Serialize,
    {
        let mut state = self.shared.lock().await;
        state.check()?;
        let request_id = state.next_request_id();
        let msg = build_update(request_id, namespace, options.flags(), selector, document)?;
        state.send(OpCode::Update, request_id, &msg).await
    }

    /// Remove documents matching `selector`.
    pub async fn remove<S: Serialize>(
        &self,
        namespace: &str,
        selector: &S,
        options: RemoveOptions,
    ) -> Result<()> {
        let mut state = self.shared.lock().await;
        state.check()?;
        let request_id = state.next_request_id();
        let msg = build_delete(request_id, namespace, options.flags(), selector)?;
        state.send(OpCode::Delete, request_id, &msg).await
    }

    /// Send a query and return a cursor over its results.
    ///
    /// Nothing is read here; the first reply is read when the cursor is first
    /// used.
    pub async fn find<Q: Serialize>(
        &self,
        namespace: &str,
        query: &Q,
        options: FindOptions,
    ) -> Result<Cursor> {
        let mut state = self.shared.lock().await;
        state.check()?;
        let request_id = state.next_request_id();
        let skip = i32::try_from(options.skip).unwrap_or(i32::MAX);
        let msg = build_query(
            request_id,
            namespace,
            options.flags(),
            skip,
            options.initial_number_to_return(),
            query,
            options.projection.as_ref(),
        )?;
        state.send(OpCode::Query, request_id, &msg).await?;

        let key = state.register_cursor(request_id, CursorState::new(namespace, &options));
        Ok(Cursor::new(Arc::downgrade(&self.shared), key, namespace))
    }

    /// The latched fatal error, if any.
    pub async fn error(&self) -> Option<DriverError> {
        self.shared.lock().await.error.clone()
    }

    /// Check if the connection can no longer be used.
    pub async fn is_closed(&self) -> bool {
        self.shared.lock().await.error.is_some()
    }

    /// Close the socket.
    ///
    /// Live server cursors are killed first, best effort. Every later
    /// operation, on the connection or its cursors, fails with
    /// `ConnectionClosed` unless an earlier fatal error was latched.
    pub async fn close(&self) -> Result<()> {
        self.shared.lock().await.close().await
    }
}

/// Everything the connection owns: socket, id counter, registries, error.
pub(crate) struct ConnectionState {
    stream: Option<Box<dyn Transport>>,
    config: ConnectionConfig,
    last_request_id: u32,
    /// Outstanding request id -> cursor awaiting its reply.
    pub(crate) pending: HashMap<u32, CursorKey>,
    /// Cursor table.
    pub(crate) cursors: HashMap<CursorKey, CursorState>,
    next_cursor_key: CursorKey,
    /// Server cursor ids abandoned by dropped handles, killed on next send.
    orphaned: Vec<i64>,
    /// Set while a message is partly read or written. Still set on the next
    /// lock means the operation was cancelled mid-frame.
    io_in_flight: bool,
    pub(crate) error: Option<DriverError>,
}

impl ConnectionState {
    fn new(stream: Box<dyn Transport>, config: ConnectionConfig) -> Self {
        Self {
            stream: Some(stream),
            config,
            last_request_id: 0,
            pending: HashMap::new(),
            cursors: HashMap::new(),
            next_cursor_key: 1,
            orphaned: Vec::new(),
            io_in_flight: false,
            error: None,
        }
    }

    /// Return the latched error, if any.
    #[inline]
    pub(crate) fn check(&self) -> Result<()> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Next request id. Wraps around, skipping 0.
    pub(crate) fn next_request_id(&mut self) -> u32 {
        self.last_request_id = self.last_request_id.wrapping_add(1);
        if self.last_request_id == 0 {
            self.last_request_id = 1;
        }
        self.last_request_id
    }

    fn register_cursor(&mut self, request_id: u32, mut cursor: CursorState) -> CursorKey {
        let key = self.next_cursor_key;
        self.next_cursor_key += 1;
        cursor.request_id = Some(request_id);
        self.cursors.insert(key, cursor);
        self.pending.insert(request_id, key);
        key
    }

    /// Latch `err` (first one wins), drop the socket and the registries.
    pub(crate) fn fatal(&mut self, err: DriverError) -> DriverError {
        if self.error.is_none() {
            tracing::warn!("Connection failed: {}", err);
            self.stream = None;
            self.pending.clear();
            self.cursors.clear();
            self.orphaned.clear();
            self.error = Some(err.clone());
        }
        err
    }

    async fn close(&mut self) -> Result<()> {
        if self.error.is_some() {
            return Ok(());
        }

        let live: Vec<i64> = self
            .cursors
            .values()
            .map(|c| c.cursor_id)
            .filter(|&id| id != 0)
            .chain(self.orphaned.drain(..))
            .collect();
        self.kill_cursors(&live).await;

        let result = match self.stream.take() {
            Some(mut stream) => stream.shutdown().await.map_err(DriverError::from),
            None => Ok(()),
        };
        self.pending.clear();
        self.cursors.clear();
        if self.error.is_none() {
            self.error = Some(DriverError::ConnectionClosed);
        }
        tracing::debug!("Connection closed");
        result
    }

    /// Write one complete message. Any failure is fatal.
    async fn write_message(&mut self, msg: &[u8]) -> Result<()> {
        self.check()?;
        let deadline = self.config.write_timeout;
        self.io_in_flight = true;
        let result = match self.stream.as_mut() {
            Some(stream) => {
                with_deadline(deadline, async {
                    stream.write_all(msg).await?;
                    stream.flush().await
                })
                .await
            }
            None => Err(DriverError::ConnectionClosed),
        };
        self.io_in_flight = false;
        result.map_err(|e| self.fatal(e))
    }

    /// Send a request, preceded by a kill for any orphaned server cursors.
    pub(crate) async fn send(&mut self, op: OpCode, request_id: u32, msg: &[u8]) -> Result<()> {
        if !self.orphaned.is_empty() {
            let ids = std::mem::take(&mut self.orphaned);
            tracing::debug!("Killing {} orphaned cursor(s)", ids.len());
            self.kill_cursors(&ids).await;
        }
        tracing::debug!(
            "Sending {:?} request {} ({} bytes)",
            op,
            request_id,
            msg.len()
        );
        self.write_message(msg).await
    }

    /// Ask for the next batch of an open server cursor. Returns the request id.
    pub(crate) async fn get_more(
        &mut self,
        namespace: &str,
        number_to_return: i32,
        cursor_id: i64,
    ) -> Result<u32> {
        self.check()?;
        let request_id = self.next_request_id();
        let msg = build_get_more(request_id, namespace, number_to_return, cursor_id)?;
        self.send(OpCode::GetMore, request_id, &msg).await?;
        Ok(request_id)
    }

    /// Release server cursors. Failures are logged, never surfaced.
    pub(crate) async fn kill_cursors(&mut self, cursor_ids: &[i64]) {
        if cursor_ids.is_empty() || self.error.is_some() {
            return;
        }
        let request_id = self.next_request_id();
        let msg = match build_kill_cursors(request_id, cursor_ids) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Failed to build kill cursors: {}", e);
                return;
            }
        };
        tracing::debug!("Killing cursors {:?}", cursor_ids);
        if let Err(e) = self.write_message(&msg).await {
            tracing::debug!("Kill cursors failed: {}", e);
        }
    }

    /// Read exactly one reply and hand it to the cursor waiting for it.
    pub(crate) async fn receive(&mut self) -> Result<()> {
        self.check()?;

        self.io_in_flight = true;
        let result = self.read_reply().await;
        self.io_in_flight = false;
        let (reply, body) = match result {
            Ok(r) => r,
            Err(e) => return Err(self.fatal(e)),
        };

        let response_to = reply.header.response_to;
        tracing::trace!(
            "Reply {} to request {}: {} document(s), cursor {}",
            reply.header.request_id,
            response_to,
            reply.number_returned,
            reply.cursor_id
        );

        let waiting = self
            .pending
            .remove(&response_to)
            .filter(|key| self.cursors.contains_key(key));
        let Some(key) = waiting else {
            if reply.cursor_id != 0 {
                tracing::warn!(
                    "No cursor waiting on request {}, killing server cursor {}",
                    response_to,
                    reply.cursor_id
                );
                self.kill_cursors(&[reply.cursor_id]).await;
            }
            return Ok(());
        };
        let Some(cursor) = self.cursors.get_mut(&key) else {
            return Ok(());
        };

        cursor.request_id = None;
        cursor.cursor_id = reply.cursor_id;
        if has_flag(cursor.flags, query_flags::EXHAUST) && reply.cursor_id != 0 {
            // Exhaust replies chain: the next one answers this reply's id.
            cursor.request_id = Some(reply.header.request_id);
            self.pending.insert(reply.header.request_id, key);
        }
        if let Some(remaining) = cursor.remaining.as_mut() {
            *remaining -= i64::from(reply.number_returned);
        }
        cursor.batches.push_back(ResponseBatch {
            flags: reply.response_flags,
            count: reply.number_returned,
            data: body,
        });
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<(ReplyHeader, Bytes)> {
        let deadline = self.config.read_timeout;
        let max_message_size = self.config.max_message_size;
        let stream = self.stream.as_mut().ok_or(DriverError::ConnectionClosed)?;

        let mut head = [0u8; REPLY_HEADER_SIZE];
        with_deadline(deadline, stream.read_exact(&mut head)).await?;
        let reply = ReplyHeader::decode(&head)
            .ok_or_else(|| DriverError::Protocol("short reply header".to_string()))?;

        if reply.header.op_code != OpCode::Reply.as_i32() {
            return Err(DriverError::Protocol(format!(
                "unknown response opcode {}",
                reply.header.op_code
            )));
        }
        reply.validate(max_message_size)?;

        let mut body = vec![0u8; reply.body_len()];
        with_deadline(deadline, stream.read_exact(&mut body)).await?;
        Ok((reply, Bytes::from(body)))
    }

    /// Forget a cursor whose handle was dropped without `close()`.
    fn reap(&mut self, key: CursorKey) {
        let Some(cursor) = self.cursors.remove(&key) else {
            return;
        };
        if let Some(request_id) = cursor.request_id {
            self.pending.remove(&request_id);
        }
        if cursor.cursor_id != 0 {
            self.orphaned.push(cursor.cursor_id);
        }
    }

    /// Remove a cursor and release its server cursor, best effort.
    pub(crate) async fn close_cursor(&mut self, key: CursorKey) {
        let Some(cursor) = self.cursors.remove(&key) else {
            return;
        };
        if let Some(request_id) = cursor.request_id {
            self.pending.remove(&request_id);
        }
        if cursor.cursor_id != 0 {
            self.kill_cursors(&[cursor.cursor_id]).await;
        }
    }
}

/// Run an I/O future under an optional deadline.
async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DriverError::Timeout(limit)),
        },
        None => Ok(fut.await?),
    }
}
