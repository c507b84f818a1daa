use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use super::StreamTransport;
use crate::error::{ConnectionError, Result};

/// Transport over a TCP socket.
pub type TcpTransport = StreamTransport<TcpStream>;

/// Open a TCP transport to `address`.
///
/// # Arguments
/// * `address` - `host:port` to connect to
/// * `connect_timeout` - Upper bound on connection establishment
/// * `max_message_size` - Largest frame accepted from the server
///
/// # Returns
/// * `Result<TcpTransport>` - Connected transport or connection error
pub async fn connect(
    address: &str,
    connect_timeout: Duration,
    max_message_size: usize,
) -> Result<TcpTransport> {
    debug!("Connecting to {}", address);

    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::ConnectionFailed(format!("{address}: {e}")))?;
    stream.set_nodelay(true)?;

    Ok(StreamTransport::new(stream, address).with_max_message_size(max_message_size))
}
