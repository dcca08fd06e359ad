use std::io;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Opens new sockets to the pool's endpoint.
///
/// The pool calls `dial` from foreground `get`s, from min-idle replenishment
/// and from the circuit breaker's recovery probe, so implementations must be
/// cheap to share and hold no per-dial state.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `endpoint`, giving up after `dial_timeout`.
    ///
    /// # Errors
    ///
    /// Returns the connect error, or `io::ErrorKind::TimedOut` when the
    /// timeout expires.
    async fn dial(&self, endpoint: &str, dial_timeout: Duration) -> io::Result<TcpStream>;
}

/// Plain TCP dialer with `TCP_NODELAY` and keepalive enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
        let stream = match timeout(dial_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Dial to {} failed: {}", endpoint, e);
                return Err(e);
            }
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "Connection to {} timed out after {:?}",
                        endpoint, dial_timeout
                    ),
                ))
            }
        };

        configure_socket(&stream)?;
        trace!("Dialed {} (local {:?})", endpoint, stream.local_addr().ok());
        Ok(stream)
    }
}

fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}
