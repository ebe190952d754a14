//! Query cursors and result paging.
//!
//! A [`Cursor`] mirrors one server-side result stream. Its batches live in
//! the connection's cursor table so that a reply read on behalf of one cursor
//! can be delivered to another; the handle only holds a key and a weak
//! reference to the connection.
//!
//! ```text
//! Created ──► Filled ◄──► AwaitingMore ──► Done ──► Closed
//!    │           │              │            ▲
//!    └───────────┴──── fatal ───┴────────────┘ (error retained)
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bson::Document;
use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::codec::BsonCodec;
use crate::connection::{ConnectionState, CursorKey, Shared};
use crate::error::{DriverError, Result};
use crate::options::{number_to_return, FindOptions};
use crate::protocol::{has_flag, query_flags, reply_flags};

/// One OP_REPLY body, consumed front to back.
#[derive(Debug)]
pub(crate) struct ResponseBatch {
    /// Reply flags.
    pub(crate) flags: u32,
    /// Documents not yet handed out.
    pub(crate) count: i32,
    /// Undecoded documents, back to back.
    pub(crate) data: Bytes,
}

/// Per-cursor paging state, owned by the connection.
#[derive(Debug)]
pub(crate) struct CursorState {
    pub(crate) namespace: String,
    /// Request whose reply this cursor is waiting on.
    pub(crate) request_id: Option<u32>,
    /// Server cursor id; 0 once the server has nothing more.
    pub(crate) cursor_id: i64,
    /// Documents still wanted; `None` without a limit.
    pub(crate) remaining: Option<i64>,
    pub(crate) batch_size: u32,
    pub(crate) flags: u32,
    pub(crate) batches: VecDeque<ResponseBatch>,
}

impl CursorState {
    pub(crate) fn new(namespace: &str, options: &FindOptions) -> Self {
        Self {
            namespace: namespace.to_string(),
            request_id: None,
            cursor_id: 0,
            remaining: (options.limit > 0).then(|| i64::from(options.limit)),
            batch_size: options.batch_size,
            flags: options.flags(),
            batches: VecDeque::new(),
        }
    }

    #[inline]
    fn is_exhaust(&self) -> bool {
        has_flag(self.flags, query_flags::EXHAUST)
    }

    /// No buffered data and nothing left to ask for.
    #[inline]
    fn is_exhausted(&self) -> bool {
        self.cursor_id == 0 || self.remaining.is_some_and(|r| r <= 0)
    }
}

impl ConnectionState {
    /// Make sure the front batch of `key` has a document to hand out.
    ///
    /// Drains replies for other cursors while waiting. Returns `EndOfResults`
    /// once the stream is exhausted.
    pub(crate) async fn fill(&mut self, key: CursorKey) -> Result<()> {
        loop {
            self.check()?;
            let cursor = self
                .cursors
                .get_mut(&key)
                .ok_or(DriverError::ConnectionClosed)?;

            while let Some(front) = cursor.batches.front() {
                if has_flag(front.flags, reply_flags::CURSOR_NOT_FOUND) {
                    return Err(DriverError::CursorNotFound);
                }
                if has_flag(front.flags, reply_flags::QUERY_FAILURE) {
                    return Err(query_failure(&front.data));
                }
                if front.count > 0 {
                    return Ok(());
                }
                cursor.batches.pop_front();
            }

            if cursor.request_id.is_none() {
                if cursor.is_exhausted() {
                    return Err(DriverError::EndOfResults);
                }
                if !cursor.is_exhaust() {
                    let namespace = cursor.namespace.clone();
                    let wanted = number_to_return(cursor.remaining, cursor.batch_size);
                    let cursor_id = cursor.cursor_id;

                    let request_id = self.get_more(&namespace, wanted, cursor_id).await?;
                    if let Some(cursor) = self.cursors.get_mut(&key) {
                        cursor.request_id = Some(request_id);
                    }
                    self.pending.insert(request_id, key);
                }
            }

            while self
                .cursors
                .get(&key)
                .is_some_and(|cursor| cursor.batches.is_empty())
            {
                self.receive().await?;
            }
        }
    }

    /// Take the next raw document of `key`.
    pub(crate) async fn next_document(&mut self, key: CursorKey) -> Result<Bytes> {
        self.fill(key).await?;

        let taken = match self
            .cursors
            .get_mut(&key)
            .and_then(|cursor| cursor.batches.front_mut())
        {
            Some(front) => BsonCodec::document_len(&front.data).map(|len| {
                front.count -= 1;
                front.data.split_to(len)
            }),
            None => return Err(DriverError::ConnectionClosed),
        };
        taken.map_err(|e| self.fatal(e))
    }

    /// Current server cursor id of `key`, 0 if unknown.
    pub(crate) fn server_cursor_id(&self, key: CursorKey) -> i64 {
        self.cursors.get(&key).map_or(0, |cursor| cursor.cursor_id)
    }
}

/// Turn a QueryFailure reply body into an error, using `$err` when present.
fn query_failure(data: &[u8]) -> DriverError {
    let message = BsonCodec::document_len(data)
        .and_then(|len| BsonCodec::decode::<Document>(&data[..len]))
        .ok()
        .and_then(|doc| doc.get_str("$err").ok().map(str::to_string));
    DriverError::QueryFailure(message.unwrap_or_else(|| "unknown error".to_string()))
}

/// Client side of one query's result stream.
///
/// Iterate with [`has_next`](Cursor::has_next) and [`next`](Cursor::next),
/// then check [`error`](Cursor::error). Dropping an open cursor releases its
/// server cursor on the connection's next send.
pub struct Cursor {
    conn: Weak<Shared>,
    key: CursorKey,
    namespace: String,
    /// Latched terminal error; `EndOfResults` once drained.
    error: Option<DriverError>,
}

impl Cursor {
    pub(crate) fn new(conn: Weak<Shared>, key: CursorKey, namespace: &str) -> Self {
        Self {
            conn,
            key,
            namespace: namespace.to_string(),
            error: None,
        }
    }

    /// Namespace this cursor reads from.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Check if another document is available, fetching if needed.
    ///
    /// Returns `false` only at the end of results. Any other failure still
    /// returns `true`; the following `next()` returns it and
    /// [`error`](Cursor::error) reports it.
    pub async fn has_next(&mut self) -> bool {
        !matches!(self.fill().await, Err(DriverError::EndOfResults))
    }

    /// Decode the next document.
    ///
    /// Returns `EndOfResults` when no documents remain, on every call. A
    /// decode error is returned without closing the cursor.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<T> {
        let document = {
            let shared = self.connection()?;
            let mut state = shared.lock().await;
            match state.next_document(self.key).await {
                Ok(document) => document,
                Err(err) => {
                    state.close_cursor(self.key).await;
                    return Err(self.latch(err));
                }
            }
        };
        BsonCodec::decode(&document)
    }

    /// Like [`next`](Cursor::next), with the end of results as `None`.
    pub async fn try_next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.next().await {
            Ok(value) => Ok(Some(value)),
            Err(DriverError::EndOfResults) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Close the cursor, killing its server cursor if one is live.
    ///
    /// Closing twice, or after the end of results, does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.error.is_some() {
            return Ok(());
        }
        if let Some(shared) = self.conn.upgrade() {
            shared.lock().await.close_cursor(self.key).await;
        }
        self.error = Some(DriverError::CursorClosed);
        tracing::debug!("Closed cursor on {}", self.namespace);
        Ok(())
    }

    /// The error that stopped this cursor, if any.
    ///
    /// The end of results is not an error and reports `None`.
    pub fn error(&self) -> Option<DriverError> {
        match &self.error {
            Some(DriverError::EndOfResults) | None => None,
            Some(err) => Some(err.clone()),
        }
    }

    /// Server cursor id last reported, 0 if none is live.
    pub async fn server_cursor_id(&self) -> i64 {
        if self.error.is_some() {
            return 0;
        }
        match self.conn.upgrade() {
            Some(shared) => shared.lock().await.server_cursor_id(self.key),
            None => 0,
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let shared = self.connection()?;
        let mut state = shared.lock().await;
        match state.fill(self.key).await {
            Ok(()) => Ok(()),
            Err(err) => {
                state.close_cursor(self.key).await;
                Err(self.latch(err))
            }
        }
    }

    /// Upgrade to the connection, or fail with the latched error.
    fn connection(&mut self) -> Result<Arc<Shared>> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        match self.conn.upgrade() {
            Some(shared) => Ok(shared),
            None => Err(self.latch(DriverError::ConnectionClosed)),
        }
    }

    fn latch(&mut self, err: DriverError) -> DriverError {
        if !err.is_end_of_results() {
            tracing::debug!("Cursor on {} failed: {}", self.namespace, err);
        }
        self.error = Some(err.clone());
        err
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.error.is_none() {
            if let Some(shared) = self.conn.upgrade() {
                shared.release(self.key);
            }
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.namespace)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_reply, OpCode};
    use std::time::Duration;
    use crate::test_support::{pair, Peer};
    use crate::{Connection, FindOptions};
    use bson::doc;

    async fn find(conn: &Connection, peer: &mut Peer, options: FindOptions) -> (Cursor, u32) {
        let cursor = conn.find("db.c", &doc! {}, options).await.unwrap();
        let (header, _) = peer.read_message().await;
        assert_eq!(header.op().unwrap(), OpCode::Query);
        (cursor, header.request_id)
    }

    #[tokio::test]
    async fn test_single_batch_then_end_of_results() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;

        peer.reply(request_id, 0, 0, &[doc! { "n": 1 }, doc! { "n": 2 }]).await;

        assert!(cursor.has_next().await);
        let first: Document = cursor.next().await.unwrap();
        let second: Document = cursor.next().await.unwrap();
        assert_eq!(first, doc! { "n": 1 });
        assert_eq!(second, doc! { "n": 2 });

        assert!(!cursor.has_next().await);
        for _ in 0..3 {
            let err = cursor.next::<Document>().await.unwrap_err();
            assert!(err.is_end_of_results());
        }
        assert!(cursor.error().is_none());
        cursor.close().await.unwrap();
        assert!(cursor.next::<Document>().await.unwrap_err().is_end_of_results());
    }

    #[tokio::test]
    async fn test_get_more_requests_remaining_limit() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new().limit(3)).await;

        peer.reply(request_id, 0, 42, &[doc! { "n": 1 }, doc! { "n": 2 }]).await;
        let _: Document = cursor.next().await.unwrap();
        let _: Document = cursor.next().await.unwrap();

        let client = async { cursor.next::<Document>().await };
        let server = async {
            let (header, bytes) = peer.read_message().await;
            assert_eq!(header.op().unwrap(), OpCode::GetMore);
            assert_eq!(Peer::get_more_fields(&bytes), (1, 42));
            peer.reply(header.request_id, 0, 42, &[doc! { "n": 3 }]).await;
        };
        let (third, ()) = tokio::join!(client, server);
        assert_eq!(third.unwrap(), doc! { "n": 3 });

        // Limit reached with the server cursor still open: it gets killed.
        assert!(!cursor.has_next().await);
        let (header, bytes) = peer.read_message().await;
        assert_eq!(header.op().unwrap(), OpCode::KillCursors);
        assert_eq!(Peer::kill_cursor_ids(&bytes), vec![42]);
    }

    #[tokio::test]
    async fn test_replies_routed_by_response_to() {
        let (conn, mut peer) = pair();
        let (mut a, a_id) = find(&conn, &mut peer, FindOptions::new()).await;
        let (mut b, b_id) = find(&conn, &mut peer, FindOptions::new()).await;

        // B's reply arrives first.
        peer.reply(b_id, 0, 0, &[doc! { "for": "b" }]).await;
        peer.reply(a_id, 0, 0, &[doc! { "for": "a" }]).await;

        let from_a: Document = a.next().await.unwrap();
        assert_eq!(from_a, doc! { "for": "a" });

        // Already delivered while A was waiting; no further reads needed.
        drop(peer);
        let from_b: Document = b.next().await.unwrap();
        assert_eq!(from_b, doc! { "for": "b" });
    }

    #[tokio::test]
    async fn test_query_failure_surfaces_err_text() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;

        peer.reply(
            request_id,
            reply_flags::QUERY_FAILURE,
            0,
            &[doc! { "$err": "bad query", "code": 2 }],
        )
        .await;

        assert!(cursor.has_next().await);
        let err = cursor.next::<Document>().await.unwrap_err();
        assert!(matches!(&err, DriverError::QueryFailure(msg) if msg == "bad query"));
        assert!(matches!(cursor.error(), Some(DriverError::QueryFailure(_))));

        // Cursor errors leave the connection usable.
        assert!(conn.error().await.is_none());
        conn.insert("db.c", &[doc! {}]).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_failure_without_err_is_generic() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;

        peer.reply(request_id, reply_flags::QUERY_FAILURE, 0, &[doc! { "code": 2 }]).await;

        let err = cursor.next::<Document>().await.unwrap_err();
        assert!(matches!(&err, DriverError::QueryFailure(msg) if msg == "unknown error"));
    }

    #[tokio::test]
    async fn test_cursor_not_found() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;

        peer.reply(request_id, reply_flags::CURSOR_NOT_FOUND, 0, &[] as &[Document]).await;

        let err = cursor.next::<Document>().await.unwrap_err();
        assert!(matches!(err, DriverError::CursorNotFound));
        assert!(conn.error().await.is_none());
    }

    #[tokio::test]
    async fn test_close_kills_live_server_cursor() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;

        peer.reply(request_id, 0, 9001, &[doc! { "n": 1 }]).await;
        let _: Document = cursor.next().await.unwrap();
        assert_eq!(cursor.server_cursor_id().await, 9001);

        cursor.close().await.unwrap();
        cursor.close().await.unwrap();

        let (header, bytes) = peer.read_message().await;
        assert_eq!(header.op().unwrap(), OpCode::KillCursors);
        assert_eq!(Peer::kill_cursor_ids(&bytes), vec![9001]);

        let err = cursor.next::<Document>().await.unwrap_err();
        assert!(matches!(err, DriverError::CursorClosed));
        assert!(matches!(cursor.error(), Some(DriverError::CursorClosed)));
    }

    #[tokio::test]
    async fn test_close_before_reply_deregisters() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;
        cursor.close().await.unwrap();

        // The late reply has no owner and its server cursor is killed.
        peer.reply(request_id, 0, 31, &[doc! { "n": 1 }]).await;
        let (mut other, other_id) = find(&conn, &mut peer, FindOptions::new()).await;
        peer.reply(other_id, 0, 0, &[doc! { "n": 2 }]).await;

        let value: Document = other.next().await.unwrap();
        assert_eq!(value, doc! { "n": 2 });
        let (header, bytes) = peer.read_message().await;
        assert_eq!(header.op().unwrap(), OpCode::KillCursors);
        assert_eq!(Peer::kill_cursor_ids(&bytes), vec![31]);
    }

    #[tokio::test]
    async fn test_dropped_cursor_is_killed_on_next_send() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;
        peer.reply(request_id, 0, 64, &[doc! { "n": 1 }, doc! { "n": 2 }]).await;
        let _: Document = cursor.next().await.unwrap();
        drop(cursor);

        conn.insert("db.c", &[doc! {}]).await.unwrap();

        let (kill, bytes) = peer.read_message().await;
        assert_eq!(kill.op().unwrap(), OpCode::KillCursors);
        assert_eq!(Peer::kill_cursor_ids(&bytes), vec![64]);
        let (insert, _) = peer.read_message().await;
        assert_eq!(insert.op().unwrap(), OpCode::Insert);
    }

    #[tokio::test]
    async fn test_exhaust_follows_reply_chain() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) =
            find(&conn, &mut peer, FindOptions::new().exhaust(true)).await;

        let first = peer.reply(request_id, 0, 5, &[doc! { "n": 1 }]).await;
        let second = peer.reply(first, 0, 5, &[doc! { "n": 2 }]).await;
        peer.reply(second, 0, 0, &[doc! { "n": 3 }]).await;

        let mut seen = Vec::new();
        while let Some(doc) = cursor.try_next::<Document>().await.unwrap() {
            seen.push(doc.get_i32("n").unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);

        // No getMore was ever sent.
        conn.insert("db.c", &[doc! {}]).await.unwrap();
        let (header, _) = peer.read_message().await;
        assert_eq!(header.op().unwrap(), OpCode::Insert);
    }

    #[tokio::test]
    async fn test_empty_batch_with_live_cursor_fetches_more() {
        let (conn, mut peer) = pair();
        let options = FindOptions::new().tailable(true).await_data(true);
        let (mut cursor, request_id) = find(&conn, &mut peer, options).await;

        peer.reply(request_id, reply_flags::AWAIT_CAPABLE, 5, &[] as &[Document]).await;

        let client = async { cursor.next::<Document>().await };
        let server = async {
            let (header, bytes) = peer.read_message().await;
            assert_eq!(header.op().unwrap(), OpCode::GetMore);
            assert_eq!(Peer::get_more_fields(&bytes), (0, 5));
            peer.reply(header.request_id, 0, 5, &[doc! { "n": 1 }]).await;
        };
        let (first, ()) = tokio::join!(client, server);
        assert_eq!(first.unwrap(), doc! { "n": 1 });
        assert_eq!(cursor.server_cursor_id().await, 5);
    }

    #[tokio::test]
    async fn test_cancelled_read_latches_interrupted() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;

        let document = BsonCodec::encode(&doc! { "n": 1 }).unwrap();
        let reply = build_reply(1000, request_id, 0, 0, 0, &[document]).unwrap();
        peer.write_raw(&reply[..40]).await;

        let waited = tokio::time::timeout(Duration::from_millis(20), cursor.next::<Document>()).await;
        assert!(waited.is_err());

        // The rest of the frame arrives, but the stream is no longer trusted.
        peer.write_raw(&reply[40..]).await;

        assert!(matches!(conn.error().await, Some(DriverError::Interrupted)));
        assert!(matches!(
            cursor.next::<Document>().await,
            Err(DriverError::Interrupted)
        ));
        assert!(matches!(cursor.error(), Some(DriverError::Interrupted)));
        assert!(matches!(
            conn.insert("db.c", &[doc! {}]).await,
            Err(DriverError::Interrupted)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_write_latches_interrupted() {
        let (client, _server) = tokio::io::duplex(64);
        let conn = Connection::from_stream(client, crate::ConnectionConfig::default());

        // Larger than the pipe buffer with nobody reading: the write stalls.
        let big = doc! { "padding": "x".repeat(1024) };
        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            conn.insert("db.c", &[big]),
        )
        .await;
        assert!(waited.is_err());

        assert!(matches!(conn.error().await, Some(DriverError::Interrupted)));
        assert!(conn.is_closed().await);
    }

    #[tokio::test]
    async fn test_corrupted_document_length_is_fatal() {
        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;

        let mut bogus = BsonCodec::encode(&doc! { "n": 1 }).unwrap();
        bogus[0] = 0xFF; // declared length far beyond the body
        peer.reply_raw(request_id, 0, 0, &[bogus]).await;

        let err = cursor.next::<Document>().await.unwrap_err();
        assert!(err.to_string().contains("response data corrupted"));
        assert!(matches!(conn.error().await, Some(DriverError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_decode_error_keeps_cursor_open() {
        #[derive(serde::Deserialize, Debug)]
        #[allow(dead_code)]
        struct Strict {
            n: String,
        }

        let (conn, mut peer) = pair();
        let (mut cursor, request_id) = find(&conn, &mut peer, FindOptions::new()).await;
        peer.reply(request_id, 0, 0, &[doc! { "n": 1 }, doc! { "n": 2 }]).await;

        assert!(matches!(
            cursor.next::<Strict>().await,
            Err(DriverError::Decode(_))
        ));
        let second: Document = cursor.next().await.unwrap();
        assert_eq!(second, doc! { "n": 2 });
    }

    #[tokio::test]
    async fn test_connection_error_reaches_cursor() {
        let (conn, mut peer) = pair();
        let (mut cursor, _) = find(&conn, &mut peer, FindOptions::new()).await;
        drop(peer);

        let err = cursor.next::<Document>().await.unwrap_err();
        let latched = conn.error().await.unwrap();
        match (&err, &latched) {
            (DriverError::Io(a), DriverError::Io(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected latched Io error, got {:?}", err),
        }
        assert!(cursor.has_next().await);
        assert!(matches!(cursor.error(), Some(DriverError::Io(_))));
    }

    #[tokio::test]
    async fn test_cursor_outliving_connection() {
        let (conn, mut peer) = pair();
        let (mut cursor, _) = find(&conn, &mut peer, FindOptions::new()).await;
        drop(conn);

        let err = cursor.next::<Document>().await.unwrap_err();
        assert!(matches!(err, DriverError::ConnectionClosed));
    }
}
