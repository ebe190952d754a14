//! # mongowire
//!
//! Async client for the legacy document-database wire protocol.
//!
//! A [`Connection`] sends OP_INSERT, OP_UPDATE, OP_DELETE and OP_QUERY
//! messages over one socket. Queries return a [`Cursor`] that pages through
//! results with OP_GET_MORE and releases the server cursor with
//! OP_KILL_CURSORS.
//!
//! ## Architecture
//!
//! - **Protocol**: little-endian headers, opcodes and request builders
//! - **Codec**: BSON documents via the `bson` crate
//! - **Connection**: request ids, reply routing and the latched fatal error
//! - **Cursor**: per-query batches, limit accounting and cleanup
//!
//! ## Example
//!
//! ```ignore
//! use bson::doc;
//! use mongowire::{Connection, FindOptions};
//!
//! #[tokio::main]
//! async fn main() -> mongowire::Result<()> {
//!     let conn = Connection::builder()
//!         .read_timeout(std::time::Duration::from_secs(5))
//!         .dial("localhost:27017")
//!         .await?;
//!
//!     let mut cursor = conn
//!         .find("test.items", &doc! { "kind": "bolt" }, FindOptions::new().batch_size(100))
//!         .await?;
//!     while let Some(item) = cursor.try_next::<bson::Document>().await? {
//!         println!("{}", item);
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;

mod connection;
mod cursor;
mod options;

#[cfg(test)]
mod test_support;

pub use connection::{Connection, ConnectionBuilder, ConnectionConfig};
pub use cursor::Cursor;
pub use error::{DriverError, ErrorKind, Result};
pub use options::{FindOptions, RemoveOptions, UpdateOptions};
