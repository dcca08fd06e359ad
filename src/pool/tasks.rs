//! Background work owned by a pool: the idle reaper, min-idle replenishment
//! and the dial recovery probe.
//!
//! Tasks hold only a weak reference to the pool and exit on its shutdown
//! token, so neither closing nor dropping the pool leaves them running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::connection_pool::PoolInner;
use super::dialer::Dialer;

impl<D: Dialer> PoolInner<D> {
    /// Periodically evict stale connections from the least recently used end
    /// of the idle set.
    pub(super) fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(inner) = pool.upgrade() else { break };
                let reaped = inner.reap_stale();
                if reaped > 0 {
                    debug!(
                        "Periodic cleanup removed {} expired connections to {}",
                        reaped, inner.opts.endpoint
                    );
                    inner.check_min_idle();
                }
            }

            trace!("Reaper stopped");
        })
    }

    /// One reaper pass. Each eviction briefly takes a free admission slot, so
    /// a pass never competes with callers for more than one slot and stops as
    /// soon as none is free. Returns the number of connections evicted.
    pub(super) fn reap_stale(&self) -> usize {
        let mut reaped = 0;

        while !self.is_closed() {
            let Ok(permit) = Arc::clone(&self.gate).try_acquire_owned() else {
                break;
            };

            let victim = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let stale = state
                    .idle
                    .front()
                    .is_some_and(|conn| conn.is_stale(self.opts.idle_timeout, now));
                match stale.then(|| state.idle.pop_front()).flatten() {
                    Some(conn) => {
                        state.forget(conn.id(), true);
                        Some(conn)
                    }
                    None => None,
                }
            };
            drop(permit);

            match victim {
                Some(mut conn) => {
                    trace!("Reaping idle connection {} (idle {:?})", conn.id(), conn.idle_for(Instant::now()));
                    conn.close_now();
                    reaped += 1;
                }
                None => break,
            }
        }

        self.stats.record_stale(reaped as u64);
        reaped
    }

    /// Reserve capacity for and dial however many connections it takes to
    /// keep `min_idle` idle or on their way.
    pub(super) fn check_min_idle(self: &Arc<Self>) {
        if self.opts.min_idle == 0 || self.is_closed() {
            return;
        }

        let reserved = {
            let mut state = self.state.lock();
            let mut reserved = 0;
            while state.pool_size < self.opts.capacity
                && state.idle.len() + state.pending_idle < self.opts.min_idle
            {
                state.pool_size += 1;
                state.pending_idle += 1;
                reserved += 1;
            }
            reserved
        };

        for _ in 0..reserved {
            let pool = Arc::downgrade(self);
            self.runtime.spawn(async move {
                if let Some(inner) = pool.upgrade() {
                    inner.add_idle_conn().await;
                }
            });
        }
    }

    async fn add_idle_conn(self: &Arc<Self>) {
        let result = self.new_connection().await;

        {
            let mut state = self.state.lock();
            if self.is_closed() {
                // Close already zeroed the counters; the socket drops here.
                return;
            }
            state.pending_idle = state.pending_idle.saturating_sub(1);

            match result {
                Ok(stream) => {
                    let conn = self.make_connection(stream, true);
                    trace!("Pre-dialed idle connection {} to {}", conn.id(), self.opts.endpoint);
                    state.all.insert(conn.id(), conn.closed_flag());
                    state.idle.push_back(conn);
                }
                Err(e) => {
                    state.pool_size = state.pool_size.saturating_sub(1);
                    debug!("Min-idle dial to {} failed: {}", self.opts.endpoint, e);
                }
            }
        }
        // Getters parked on this dial retry the idle set, or dial themselves
        // if it failed.
        self.idle_ready.notify_waiters();
    }

    /// Keep dialing every `recovery_backoff` until the endpoint answers, then
    /// close the circuit. Only started by the failure that tripped the
    /// breaker.
    pub(super) fn spawn_recovery_probe(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let backoff = self.opts.recovery_backoff;
        let endpoint = self.opts.endpoint.clone();
        let dial_timeout = self.opts.dial_timeout;

        debug!("Starting recovery probe for {} every {:?}", endpoint, backoff);

        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }

                let Some(inner) = pool.upgrade() else { break };
                match inner.dialer.dial(&endpoint, dial_timeout).await {
                    Ok(stream) => {
                        // The probe socket only proves reachability.
                        drop(stream);
                        inner.stats.record_dial(true);
                        inner.breaker.probe_done();
                        inner.breaker.record_success();
                        info!(endpoint = %endpoint, "Endpoint reachable again");
                        inner.check_min_idle();
                        return;
                    }
                    Err(e) => {
                        inner.stats.record_dial(false);
                        trace!("Recovery probe to {} failed: {}", endpoint, e);
                        inner.breaker.record_probe_failure(Arc::new(e));
                    }
                }
            }

            if let Some(inner) = pool.upgrade() {
                inner.breaker.probe_done();
            }
            trace!("Recovery probe for {} stopped", endpoint);
        });
    }
}
