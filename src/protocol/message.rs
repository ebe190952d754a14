//! Request message construction.
//!
//! [`MessageWriter`] reserves the leading length slot, appends the body with
//! typed helpers and patches the real length in [`MessageWriter::finish`].
//! The `build_*` functions lay out one message per opcode.
//!
//! # Example
//!
//! ```
//! use mongowire::protocol::{build_get_more, MessageHeader, OpCode};
//!
//! let msg = build_get_more(3, "db.items", 10, 42).unwrap();
//! let header = MessageHeader::decode(&msg).unwrap();
//! assert_eq!(header.message_length as usize, msg.len());
//! assert_eq!(header.op().unwrap(), OpCode::GetMore);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::wire_format::{MessageHeader, OpCode, ReplyHeader, HEADER_SIZE, REPLY_HEADER_SIZE};
use crate::codec::BsonCodec;
use crate::error::{DriverError, Result};

/// Initial capacity for request buffers.
const DEFAULT_CAPACITY: usize = 512;

/// Growable little-endian message buffer.
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    /// Start a message: length placeholder, ids and opcode.
    pub fn new(request_id: u32, response_to: u32, op_code: OpCode) -> Self {
        Self::with_capacity(request_id, response_to, op_code, DEFAULT_CAPACITY)
    }

    /// Start a message with a custom initial capacity.
    pub fn with_capacity(
        request_id: u32,
        response_to: u32,
        op_code: OpCode,
        capacity: usize,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(capacity.max(HEADER_SIZE));
        buf.put_i32_le(0); // placeholder for message length
        buf.put_u32_le(request_id);
        buf.put_u32_le(response_to);
        buf.put_i32_le(op_code.as_i32());
        Self { buf }
    }

    #[inline]
    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    #[inline]
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    #[inline]
    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64_le(value);
        self
    }

    /// Append a NUL-terminated string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the string contains a NUL byte.
    pub fn put_cstring(&mut self, value: &str) -> Result<&mut Self> {
        if value.as_bytes().contains(&0) {
            return Err(DriverError::InvalidArgument(format!(
                "cstring contains NUL byte: {:?}",
                value
            )));
        }
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        Ok(self)
    }

    /// Append one encoded document.
    pub fn put_document<T: Serialize>(&mut self, value: &T) -> Result<&mut Self> {
        BsonCodec::encode_into(&mut self.buf, value)?;
        Ok(self)
    }

    /// Current length in bytes, header included.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Patch the length slot and freeze the message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the message does not fit an int32 length.
    pub fn finish(mut self) -> Result<Bytes> {
        let length = i32::try_from(self.buf.len()).map_err(|_| {
            DriverError::InvalidArgument(format!("message of {} bytes is too large", self.buf.len()))
        })?;
        self.buf[0..4].copy_from_slice(&length.to_le_bytes());
        Ok(self.buf.freeze())
    }
}

/// OP_INSERT: reserved, namespace, one or more documents.
pub fn build_insert<T: Serialize>(request_id: u32, namespace: &str, documents: &[T]) -> Result<Bytes> {
    if documents.is_empty() {
        return Err(DriverError::InvalidArgument(
            "insert requires at least one document".to_string(),
        ));
    }
    let mut msg = MessageWriter::new(request_id, 0, OpCode::Insert);
    msg.put_i32(0); // reserved
    msg.put_cstring(namespace)?;
    for document in documents {
        msg.put_document(document)?;
    }
    msg.finish()
}

/// OP_UPDATE: reserved, namespace, flags, selector, update.
pub fn build_update<U, S>(
    request_id: u32,
    namespace: &str,
    flags: u32,
    selector: &S,
    update: &U,
) -> Result<Bytes>
where
    U: Serialize,
    S: Serialize,
{
    let mut msg = MessageWriter::new(request_id, 0, OpCode::Update);
    msg.put_i32(0); // reserved
    msg.put_cstring(namespace)?;
    msg.put_u32(flags);
    msg.put_document(selector)?;
    msg.put_document(update)?;
    msg.finish()
}

/// OP_DELETE: reserved, namespace, flags, selector.
pub fn build_delete<S: Serialize>(
    request_id: u32,
    namespace: &str,
    flags: u32,
    selector: &S,
) -> Result<Bytes> {
    let mut msg = MessageWriter::new(request_id, 0, OpCode::Delete);
    msg.put_i32(0); // reserved
    msg.put_cstring(namespace)?;
    msg.put_u32(flags);
    msg.put_document(selector)?;
    msg.finish()
}

/// OP_QUERY: flags, namespace, skip, numberToReturn, query, optional projection.
pub fn build_query<Q, P>(
    request_id: u32,
    namespace: &str,
    flags: u32,
    number_to_skip: i32,
    number_to_return: i32,
    query: &Q,
    projection: Option<&P>,
) -> Result<Bytes>
where
    Q: Serialize,
    P: Serialize,
{
    let mut msg = MessageWriter::new(request_id, 0, OpCode::Query);
    msg.put_u32(flags);
    msg.put_cstring(namespace)?;
    msg.put_i32(number_to_skip);
    msg.put_i32(number_to_return);
    msg.put_document(query)?;
    if let Some(projection) = projection {
        msg.put_document(projection)?;
    }
    msg.finish()
}

/// OP_GET_MORE: reserved, namespace, numberToReturn, cursor id.
pub fn build_get_more(
    request_id: u32,
    namespace: &str,
    number_to_return: i32,
    cursor_id: i64,
) -> Result<Bytes> {
    let capacity = HEADER_SIZE + 4 + namespace.len() + 1 + 4 + 8;
    let mut msg = MessageWriter::with_capacity(request_id, 0, OpCode::GetMore, capacity);
    msg.put_i32(0); // reserved
    msg.put_cstring(namespace)?;
    msg.put_i32(number_to_return);
    msg.put_i64(cursor_id);
    msg.finish()
}

/// OP_KILL_CURSORS: reserved, id count, ids.
pub fn build_kill_cursors(request_id: u32, cursor_ids: &[i64]) -> Result<Bytes> {
    let count = i32::try_from(cursor_ids.len())
        .map_err(|_| DriverError::InvalidArgument("too many cursor ids".to_string()))?;
    let capacity = HEADER_SIZE + 8 + cursor_ids.len() * 8;
    let mut msg = MessageWriter::with_capacity(request_id, 0, OpCode::KillCursors, capacity);
    msg.put_i32(0); // reserved
    msg.put_i32(count);
    for &cursor_id in cursor_ids {
        msg.put_i64(cursor_id);
    }
    msg.finish()
}

/// Build a complete OP_REPLY from already-encoded documents.
///
/// This is the server side of the exchange; it exists for test doubles and
/// mock servers.
///
/// # Errors
///
/// Returns `InvalidArgument` if the document count or the total length does
/// not fit an int32.
///
/// # Example
///
/// ```
/// use mongowire::codec::BsonCodec;
/// use mongowire::protocol::{build_reply, ReplyHeader};
///
/// let doc = BsonCodec::encode(&bson::doc! { "n": 1 }).unwrap();
/// let msg = build_reply(10, 3, 0, 0, 0, &[doc]).unwrap();
/// let header = ReplyHeader::decode(&msg).unwrap();
/// assert_eq!(header.header.response_to, 3);
/// assert_eq!(header.number_returned, 1);
/// ```
pub fn build_reply<D: AsRef<[u8]>>(
    request_id: u32,
    response_to: u32,
    response_flags: u32,
    cursor_id: i64,
    starting_from: i32,
    documents: &[D],
) -> Result<Vec<u8>> {
    let number_returned = i32::try_from(documents.len()).map_err(|_| {
        DriverError::InvalidArgument(format!("{} documents do not fit one reply", documents.len()))
    })?;
    let body_len: usize = documents.iter().map(|d| d.as_ref().len()).sum();
    let total = REPLY_HEADER_SIZE + body_len;
    let message_length = i32::try_from(total).map_err(|_| {
        DriverError::InvalidArgument(format!("reply of {} bytes is too large", total))
    })?;
    let header = ReplyHeader {
        header: MessageHeader::new(
            message_length,
            request_id,
            response_to,
            OpCode::Reply,
        ),
        response_flags,
        cursor_id,
        starting_from,
        number_returned,
    };
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&header.encode());
    for document in documents {
        buf.extend_from_slice(document.as_ref());
    }
    Ok(buf)
}
