//! Codec module - document serialization for message bodies.
//!
//! - [`BsonCodec`] - documents via the `bson` crate
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather than trait objects.
//! The connection and cursor only need two primitives from the codec: encode a
//! value into a message buffer, and decode one document from raw reply bytes.

mod bson;

pub use self::bson::{BsonCodec, MIN_DOCUMENT_SIZE};
