// rpcpool - Bounded connection pool for long-lived RPC client connections

pub mod client;
pub mod config;
pub mod pool;
pub mod utils;

// Re-export commonly used types
pub use client::RpcClient;
pub use config::{Config, PoolOptions};
pub use pool::{Connection, ConnectionPool, Dialer, PooledConnection, StatsSnapshot, TcpDialer};
pub use utils::error::{Result, RpcPoolError};
