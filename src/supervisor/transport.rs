//! Loopback connection to a listening adapter

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::common::{Error, Result};

/// Delay between connection attempts
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Connect to an adapter on 127.0.0.1
///
/// Some adapters print the handshake line just before they start
/// accepting, so refused connections are retried until `timeout`.
pub async fn connect(port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());

        match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!(%addr, attempts, "Connected to debug adapter");
                return Ok(stream);
            }
            Ok(Err(e)) if Instant::now() + RETRY_INTERVAL < deadline => {
                tracing::trace!(%addr, error = %e, "Adapter not accepting yet");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Ok(Err(e)) => {
                return Err(Error::SessionTerminated(format!(
                    "could not connect to {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                return Err(Error::timeout(
                    &format!("connect to {}", addr),
                    timeout.as_millis() as u64,
                ));
            }
        }
    }
}
