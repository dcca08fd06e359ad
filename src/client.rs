use std::io;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::config::PoolOptions;
use crate::pool::{Connection, ConnectionPool, Dialer, StatsSnapshot, TcpDialer};
use crate::utils::error::{Result, RpcPoolError};

/// Thin RPC helper over a [`ConnectionPool`].
///
/// Every call checks out one connection, runs exactly one request/response
/// exchange on it and hands it back: `put` when the exchange succeeded,
/// `remove` when it failed with an I/O error.
#[derive(Debug, Clone)]
pub struct RpcClient<D: Dialer = TcpDialer> {
    pool: ConnectionPool<D>,
    max_retries: u32,
}

impl RpcClient<TcpDialer> {
    pub fn from_options(options: PoolOptions) -> Self {
        let max_retries = options.max_retries;
        Self::new(ConnectionPool::new(options), max_retries)
    }
}

impl<D: Dialer> RpcClient<D> {
    pub fn new(pool: ConnectionPool<D>, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    pub fn pool(&self) -> &ConnectionPool<D> {
        &self.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pool.stats()
    }

    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }

    /// Run one exchange on a pooled connection.
    ///
    /// An I/O failure discards the connection and, up to `max_retries`
    /// times, repeats the exchange on another one. Pool errors (closed,
    /// timeout, dial failure, open circuit) are returned as-is.
    pub async fn call<T, F>(&self, mut op: F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut Connection) -> BoxFuture<'c, io::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let mut conn = self.pool.get().await?;

            match op(&mut *conn).await {
                Ok(value) => {
                    if let Err(e) = self.pool.put(conn) {
                        debug!("Connection not returned to pool: {}", e);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    conn.mark_broken();
                    self.pool.remove(conn, &e);

                    let err = RpcPoolError::from(e);
                    if !err.is_retryable() || attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    debug!(
                        "Retrying call to {} ({}/{}) after: {}",
                        self.pool.endpoint(),
                        attempt,
                        self.max_retries,
                        err
                    );
                }
            }
        }
    }

    /// Send `payload` and read back the same number of bytes.
    pub async fn echo(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let payload = payload.to_vec();
        let reply = self
            .call(|conn| {
                let payload = payload.clone();
                async move {
                    conn.write_all(&payload).await?;
                    conn.flush().await?;
                    let mut reply = vec![0u8; payload.len()];
                    conn.read_exact(&mut reply).await?;
                    trace!("Echo of {} bytes on connection {}", reply.len(), conn.id());
                    Ok(reply)
                }
                .boxed()
            })
            .await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn client(addr: &str, max_retries: u32) -> RpcClient {
        RpcClient::from_options(
            PoolOptions::new(addr)
                .with_capacity(2)
                .with_pool_timeout(Duration::from_millis(200))
                .with_idle_check_interval(None)
                .with_max_retries(max_retries),
        )
    }

    #[tokio::test]
    async fn echo_reuses_connection() {
        let addr = echo_server().await;
        let client = client(&addr, 0);

        assert_eq!(client.echo(b"hello").await.unwrap(), b"hello");
        assert_eq!(client.echo(b"again").await.unwrap(), b"again");

        let stats = client.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.idle_conns, 1);
    }

    #[tokio::test]
    async fn io_error_removes_connection() {
        let addr = echo_server().await;
        let client = client(&addr, 0);

        let result: Result<()> = client
            .call(|_conn| {
                async { Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")) }.boxed()
            })
            .await;

        assert!(matches!(result, Err(RpcPoolError::Io(_))));
        let stats = client.stats();
        assert_eq!(stats.total_conns, 0);
        assert_eq!(stats.idle_conns, 0);
        assert_eq!(client.pool().available_permits(), 2);
    }

    #[tokio::test]
    async fn retries_io_errors_up_to_limit() {
        let addr = echo_server().await;
        let client = client(&addr, 2);
        let mut attempts = 0;

        let result: Result<u32> = client
            .call(|_conn| {
                attempts += 1;
                let n = attempts;
                async move {
                    if n < 3 {
                        Err(io::Error::from(io::ErrorKind::ConnectionReset))
                    } else {
                        Ok(n)
                    }
                }
                .boxed()
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(client.stats().misses, 3);
    }

    #[tokio::test]
    async fn pool_errors_are_not_retried() {
        let addr = echo_server().await;
        let client = client(&addr, 5);
        client.close().await.unwrap();

        let result = client.echo(b"x").await;
        assert!(matches!(result, Err(RpcPoolError::Closed)));
    }
}
