//! Transport module - socket handling.
//!
//! Provides:
//! - Address normalization (default port)
//! - TCP dialing
//! - The [`Transport`] bound a connection runs over

mod tcp;

pub use tcp::{connect, normalize_address, Transport, DEFAULT_PORT};
