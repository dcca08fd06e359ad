//! Dial circuit breaker.
//!
//! After `threshold` consecutive dial failures the endpoint is presumed down:
//! foreground dials fail fast with the cached error and a single background
//! probe keeps trying until one dial succeeds.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::utils::error::RpcPoolError;

#[derive(Debug)]
pub(crate) struct DialBreaker {
    endpoint: String,
    threshold: u32,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<Arc<io::Error>>>,
    probing: AtomicBool,
}

impl DialBreaker {
    pub(crate) fn new(endpoint: &str, threshold: usize) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            threshold: u32::try_from(threshold.max(1)).unwrap_or(u32::MAX),
            consecutive_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
            probing: AtomicBool::new(false),
        }
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.consecutive_failures() >= self.threshold
    }

    /// Fail fast with the cached dial error while the breaker is open.
    pub(crate) fn check(&self) -> Result<(), RpcPoolError> {
        if !self.is_open() {
            return Ok(());
        }

        Err(RpcPoolError::CircuitOpen {
            endpoint: self.endpoint.clone(),
            failures: self.consecutive_failures(),
            source: self.last_error().unwrap_or_else(|| {
                Arc::new(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "endpoint presumed down",
                ))
            }),
        })
    }

    pub(crate) fn last_error(&self) -> Option<Arc<io::Error>> {
        self.last_error.lock().clone()
    }

    pub(crate) fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::AcqRel);
        if previous >= self.threshold {
            info!(endpoint = %self.endpoint, "Dial succeeded, circuit closed");
        }
    }

    /// Cache the error and count the failure. Returns `true` when the caller
    /// must start the recovery probe: this failure tripped the breaker and no
    /// probe is running yet.
    pub(crate) fn record_failure(&self, err: Arc<io::Error>) -> bool {
        *self.last_error.lock() = Some(err);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures != self.threshold {
            return false;
        }

        warn!(
            endpoint = %self.endpoint,
            failures,
            "Circuit opened after consecutive dial failures"
        );
        self.probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Probe finished (recovered or pool closed).
    pub(crate) fn probe_done(&self) {
        self.probing.store(false, Ordering::Release);
    }

    /// Refresh the cached error without counting another failure.
    pub(crate) fn record_probe_failure(&self, err: Arc<io::Error>) {
        *self.last_error.lock() = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> Arc<io::Error> {
        Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    #[test]
    fn trips_exactly_at_threshold() {
        let breaker = DialBreaker::new("db:9090", 3);

        assert!(!breaker.record_failure(refused()));
        assert!(!breaker.record_failure(refused()));
        assert!(breaker.check().is_ok());

        assert!(breaker.record_failure(refused()));
        assert!(breaker.is_open());

        // Later failures neither restart the probe nor close the circuit.
        assert!(!breaker.record_failure(refused()));
        assert!(breaker.is_open());
    }

    #[test]
    fn open_breaker_returns_cached_error() {
        let breaker = DialBreaker::new("db:9090", 1);
        let err = refused();
        assert!(breaker.record_failure(err.clone()));

        match breaker.check() {
            Err(RpcPoolError::CircuitOpen {
                failures, source, ..
            }) => {
                assert_eq!(failures, 1);
                assert!(Arc::ptr_eq(&source, &err));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[test]
    fn success_resets() {
        let breaker = DialBreaker::new("db:9090", 2);
        breaker.record_failure(refused());
        breaker.record_failure(refused());
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn only_one_probe_until_done() {
        let breaker = DialBreaker::new("db:9090", 1);
        assert!(breaker.record_failure(refused()));

        breaker.record_success();
        // Probe still flagged as running: tripping again must not start another.
        assert!(!breaker.record_failure(refused()));

        breaker.probe_done();
        breaker.record_success();
        assert!(breaker.record_failure(refused()));
    }
}
