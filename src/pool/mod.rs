//! Client-side connection pool for a single RPC endpoint.

mod breaker;
pub mod connection;
pub mod connection_pool;
pub mod dialer;
pub mod stats;
mod tasks;

pub use connection::Connection;
pub use connection_pool::{ConnectionPool, PooledConnection};
pub use dialer::{Dialer, TcpDialer};
pub use stats::{PoolStats, StatsSnapshot};
