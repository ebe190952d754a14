//! Protocol module - wire format and request messages.
//!
//! This module implements the binary wire protocol:
//! - 16-byte message header and 36-byte reply header
//! - Opcodes and per-opcode flag bits
//! - Request builders for every client opcode

mod message;
mod wire_format;

pub use message::{
    build_delete, build_get_more, build_insert, build_kill_cursors, build_query, build_reply,
    build_update, MessageWriter,
};
pub use wire_format::{
    delete_flags, has_flag, query_flags, reply_flags, update_flags, MessageHeader, OpCode,
    ReplyHeader, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, REPLY_HEADER_SIZE,
};
