//! Wire format encoding and decoding.
//!
//! Every message starts with a 16-byte header:
//! ```text
//! ┌──────────────┬────────────┬────────────┬──────────┐
//! │ messageLength│ requestId  │ responseTo │ opCode   │
//! │ int32 LE     │ uint32 LE  │ uint32 LE  │ int32 LE │
//! └──────────────┴────────────┴────────────┴──────────┘
//! ```
//!
//! Replies extend it to 36 bytes:
//! ```text
//! ┌──────────────┬──────────┬──────────────┬───────────────┐
//! │ responseFlags│ cursorId │ startingFrom │ numberReturned│
//! │ uint32 LE    │ int64 LE │ int32 LE     │ int32 LE      │
//! └──────────────┴──────────┴──────────────┴───────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian.

use crate::error::{DriverError, Result};

/// Generic message header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Reply header size in bytes (generic header + reply fields).
pub const REPLY_HEADER_SIZE: usize = 36;

/// Default maximum accepted reply size (48 MB, the server's own message cap).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 48_000_000;

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    /// Numeric value as written on the wire.
    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for OpCode {
    type Error = DriverError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(DriverError::Protocol(format!("unknown opcode {}", other))),
        }
    }
}

/// Check if a specific flag is set.
#[inline]
pub fn has_flag(flags: u32, flag: u32) -> bool {
    flags & flag != 0
}

/// OP_UPDATE flags.
pub mod update_flags {
    /// Insert the update document if nothing matches the selector.
    pub const UPSERT: u32 = 1 << 0;
    /// Update every matching document, not just the first.
    pub const MULTI: u32 = 1 << 1;
}

/// OP_DELETE flags.
pub mod delete_flags {
    /// Remove only the first matching document.
    pub const SINGLE_REMOVE: u32 = 1 << 0;
}

/// OP_QUERY flags.
pub mod query_flags {
    /// Cursor is not closed when the last data is retrieved.
    pub const TAILABLE: u32 = 1 << 1;
    /// Allow query of a replica secondary.
    pub const SLAVE_OK: u32 = 1 << 2;
    /// Server does not time out idle cursors.
    pub const NO_CURSOR_TIMEOUT: u32 = 1 << 4;
    /// Block at the end of a tailable cursor instead of returning no data.
    pub const AWAIT_DATA: u32 = 1 << 5;
    /// Server streams all batches without waiting for getMore.
    pub const EXHAUST: u32 = 1 << 6;
}

/// OP_REPLY response flags.
pub mod reply_flags {
    /// getMore named a cursor the server does not know.
    pub const CURSOR_NOT_FOUND: u32 = 1 << 0;
    /// Query failed; the body holds one document with `$err`.
    pub const QUERY_FAILURE: u32 = 1 << 1;
    /// Shard configuration is stale.
    pub const SHARD_CONFIG_STALE: u32 = 1 << 2;
    /// Server supports the AwaitData query flag.
    pub const AWAIT_CAPABLE: u32 = 1 << 3;
}

/// The 16-byte header common to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length in bytes, including this header.
    pub message_length: i32,
    /// Identifier of this message.
    pub request_id: u32,
    /// Request this message answers (0 for requests).
    pub response_to: u32,
    /// Raw operation code.
    pub op_code: i32,
}

impl MessageHeader {
    /// Create a new header.
    pub fn new(message_length: i32, request_id: u32, response_to: u32, op_code: OpCode) -> Self {
        Self {
            message_length,
            request_id,
            response_to,
            op_code: op_code.as_i32(),
        }
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        buf[12..16].copy_from_slice(&self.op_code.to_le_bytes());
    }

    /// Encode header to bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use mongowire::protocol::{MessageHeader, OpCode};
    ///
    /// let bytes = MessageHeader::new(16, 7, 0, OpCode::Query).encode();
    /// let header = MessageHeader::decode(&bytes).unwrap();
    /// assert_eq!(header.request_id, 7);
    /// assert_eq!(header.op_code, 2004);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            message_length: read_i32(buf, 0),
            request_id: read_u32(buf, 4),
            response_to: read_u32(buf, 8),
            op_code: read_i32(buf, 12),
        })
    }

    /// Typed opcode, if known.
    pub fn op(&self) -> Result<OpCode> {
        OpCode::try_from(self.op_code)
    }
}

/// The fixed 36-byte header of an OP_REPLY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub header: MessageHeader,
    /// Response flags (see `reply_flags`).
    pub response_flags: u32,
    /// Server cursor id (0 = no more batches).
    pub cursor_id: i64,
    /// Position of the first document in the whole result.
    pub starting_from: i32,
    /// Number of documents in this batch.
    pub number_returned: i32,
}

impl ReplyHeader {
    /// Decode a reply header from its 36 raw bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < REPLY_HEADER_SIZE {
            return None;
        }
        Some(Self {
            header: MessageHeader::decode(buf)?,
            response_flags: read_u32(buf, 16),
            cursor_id: read_i64(buf, 20),
            starting_from: read_i32(buf, 28),
            number_returned: read_i32(buf, 32),
        })
    }

    /// Encode into 36 bytes.
    pub fn encode(&self) -> [u8; REPLY_HEADER_SIZE] {
        let mut buf = [0u8; REPLY_HEADER_SIZE];
        self.header.encode_into(&mut buf[..HEADER_SIZE]);
        buf[16..20].copy_from_slice(&self.response_flags.to_le_bytes());
        buf[20..28].copy_from_slice(&self.cursor_id.to_le_bytes());
        buf[28..32].copy_from_slice(&self.starting_from.to_le_bytes());
        buf[32..36].copy_from_slice(&self.number_returned.to_le_bytes());
        buf
    }

    /// Validate the framing fields against protocol limits.
    ///
    /// Checks:
    /// - Declared length covers at least the reply header
    /// - Declared length doesn't exceed max
    /// - Document count is not negative
    pub fn validate(&self, max_message_size: u32) -> Result<()> {
        let length = self.header.message_length;
        if length < REPLY_HEADER_SIZE as i32 {
            return Err(DriverError::Protocol(format!(
                "reply length {} shorter than reply header",
                length
            )));
        }
        if length as u32 > max_message_size {
            return Err(DriverError::Protocol(format!(
                "reply length {} exceeds maximum {}",
                length, max_message_size
            )));
        }
        if self.number_returned < 0 {
            return Err(DriverError::Protocol(format!(
                "negative document count {}",
                self.number_returned
            )));
        }
        Ok(())
    }

    /// Bytes that follow the 36-byte header.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.header.message_length as usize).saturating_sub(REPLY_HEADER_SIZE)
    }

    #[inline]
    pub fn is_cursor_not_found(&self) -> bool {
        has_flag(self.response_flags, reply_flags::CURSOR_NOT_FOUND)
    }

    #[inline]
    pub fn is_query_failure(&self) -> bool {
        has_flag(self.response_flags, reply_flags::QUERY_FAILURE)
    }
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(raw)
}
