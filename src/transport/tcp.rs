//! TCP transport.
//!
//! # Example
//!
//! ```ignore
//! use mongowire::transport::connect;
//!
//! let stream = connect("localhost", true).await?;
//! ```

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Result;

/// Port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 27017;

/// A byte stream a connection can run over.
///
/// Implemented for anything readable and writable, so tests can drive a
/// connection through `tokio::io::duplex` instead of a socket.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Append the default port when the address does not carry one.
///
/// A `:` inside brackets belongs to an IPv6 literal, not to a port.
///
/// # Example
///
/// ```
/// use mongowire::transport::normalize_address;
///
/// assert_eq!(normalize_address("localhost"), "localhost:27017");
/// assert_eq!(normalize_address("db:4000"), "db:4000");
/// assert_eq!(normalize_address("[::1]"), "[::1]:27017");
/// ```
pub fn normalize_address(addr: &str) -> String {
    let has_port = match (addr.rfind(':'), addr.rfind(']')) {
        (Some(colon), Some(bracket)) => colon > bracket,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    }
}

/// Dial `addr` (normalized first) over TCP.
pub async fn connect(addr: &str, nodelay: bool) -> Result<TcpStream> {
    let addr = normalize_address(addr);
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(nodelay)?;
    tracing::debug!("Connected to {}", addr);
    Ok(stream)
}
