//! BSON document codec using the `bson` crate.
//!
//! Every value handed to the wire must serialize to a top-level document;
//! scalars and arrays are rejected by the encoder.
//!
//! # Example
//!
//! ```
//! use mongowire::codec::BsonCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Item {
//!     name: String,
//!     qty: i32,
//! }
//!
//! let item = Item { name: "bolt".to_string(), qty: 3 };
//! let encoded = BsonCodec::encode(&item).unwrap();
//! let decoded: Item = BsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, item);
//! ```

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DriverError, Result};

/// Smallest valid document: int32 length plus the trailing NUL.
pub const MIN_DOCUMENT_SIZE: usize = 5;

/// Codec for the database's document format.
pub struct BsonCodec;

impl BsonCodec {
    /// Encode a value to document bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a document or cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(bson::to_vec(value)?)
    }

    /// Append an encoded value to a message buffer.
    pub fn encode_into<T: Serialize>(buf: &mut BytesMut, value: &T) -> Result<()> {
        let bytes = Self::encode(value)?;
        buf.put_slice(&bytes);
        Ok(())
    }

    /// Decode document bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(bson::from_slice(bytes)?)
    }

    /// Read the embedded length prefix of the document at the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the prefix is missing, smaller than an empty
    /// document, or larger than `buf`.
    pub fn document_len(buf: &[u8]) -> Result<usize> {
        if buf.len() < 4 {
            return Err(DriverError::Protocol("response data corrupted".to_string()));
        }
        let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len < MIN_DOCUMENT_SIZE as i32 || len as usize > buf.len() {
            return Err(DriverError::Protocol("response data corrupted".to_string()));
        }
        Ok(len as usize)
    }
}
