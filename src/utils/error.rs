use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcPoolError {
    #[error("connection pool is closed")]
    Closed,

    #[error("timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),

    #[error("failed to dial {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("dialing {endpoint} suspended after {failures} consecutive failures: {source}")]
    CircuitOpen {
        endpoint: String,
        failures: u32,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcPoolError {
    /// True for failures of the exchange itself (the socket broke mid-call).
    /// Pool-level failures are never worth retrying on another connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcPoolError::Io(_))
    }

    /// The underlying dial error for `Dial` and `CircuitOpen`.
    pub fn dial_error(&self) -> Option<&Arc<std::io::Error>> {
        match self {
            RpcPoolError::Dial { source, .. } | RpcPoolError::CircuitOpen { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcPoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn only_io_errors_are_retryable() {
        let io_err = RpcPoolError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io_err.is_retryable());

        assert!(!RpcPoolError::Closed.is_retryable());
        assert!(!RpcPoolError::Timeout(Duration::from_millis(10)).is_retryable());

        let dial = RpcPoolError::Dial {
            endpoint: "127.0.0.1:1".to_string(),
            source: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
        };
        assert!(!dial.is_retryable());
    }

    #[test]
    fn circuit_open_exposes_cached_dial_error() {
        let cached = Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused));
        let err = RpcPoolError::CircuitOpen {
            endpoint: "db:9090".to_string(),
            failures: 3,
            source: cached.clone(),
        };

        assert!(Arc::ptr_eq(err.dial_error().unwrap(), &cached));
        assert!(err.to_string().contains("3 consecutive failures"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
