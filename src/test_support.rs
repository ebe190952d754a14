//! In-memory server side for unit tests.

use bson::Document;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::codec::BsonCodec;
use crate::connection::{Connection, ConnectionConfig};
use crate::protocol::{build_reply, MessageHeader, HEADER_SIZE};

/// Connection over an in-memory pipe, with the server end.
pub(crate) fn pair() -> (Connection, Peer) {
    pair_with(ConnectionConfig::default())
}

pub(crate) fn pair_with(config: ConnectionConfig) -> (Connection, Peer) {
    let (client, server) = tokio::io::duplex(1 << 16);
    let conn = Connection::from_stream(client, config);
    let peer = Peer {
        stream: server,
        next_request_id: 1000,
    };
    (conn, peer)
}

/// Scripted server end of a [`pair`].
pub(crate) struct Peer {
    stream: DuplexStream,
    next_request_id: u32,
}

impl Peer {
    /// Read one whole client message.
    pub(crate) async fn read_message(&mut self) -> (MessageHeader, Vec<u8>) {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await.unwrap();
        let total = i32::from_le_bytes(len) as usize;
        assert!(total >= HEADER_SIZE, "message length {} too short", total);

        let mut bytes = vec![0u8; total];
        bytes[..4].copy_from_slice(&len);
        self.stream.read_exact(&mut bytes[4..]).await.unwrap();
        let header = MessageHeader::decode(&bytes).unwrap();
        (header, bytes)
    }

    /// Send a reply with `documents`. Returns the reply's own request id.
    pub(crate) async fn reply(
        &mut self,
        response_to: u32,
        flags: u32,
        cursor_id: i64,
        documents: &[Document],
    ) -> u32 {
        let encoded: Vec<Vec<u8>> = documents
            .iter()
            .map(|d| BsonCodec::encode(d).unwrap())
            .collect();
        self.reply_raw(response_to, flags, cursor_id, &encoded).await
    }

    /// Send a reply whose documents are given as raw bytes.
    pub(crate) async fn reply_raw(
        &mut self,
        response_to: u32,
        flags: u32,
        cursor_id: i64,
        documents: &[Vec<u8>],
    ) -> u32 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let msg = build_reply(request_id, response_to, flags, cursor_id, 0, documents).unwrap();
        self.write_raw(&msg).await;
        request_id
    }

    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Cursor ids listed in an OP_KILL_CURSORS message.
    pub(crate) fn kill_cursor_ids(msg: &[u8]) -> Vec<i64> {
        let count = read_i32(msg, HEADER_SIZE + 4) as usize;
        (0..count)
            .map(|i| read_i64(msg, HEADER_SIZE + 8 + i * 8))
            .collect()
    }

    /// `(numberToReturn, cursorId)` of an OP_GET_MORE message.
    pub(crate) fn get_more_fields(msg: &[u8]) -> (i32, i64) {
        let ns_start = HEADER_SIZE + 4;
        let ns_len = msg[ns_start..].iter().position(|&b| b == 0).unwrap();
        let offset = ns_start + ns_len + 1;
        (read_i32(msg, offset), read_i64(msg, offset + 4))
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}
