// connpool - Bounded per-endpoint connection pool

pub mod config;
pub mod pool;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use pool::{ConnectionPool, EndpointPool, LeaseState, PooledConnection};
pub use transport::{CloseMethod, Connection, ConnectionFactory, Endpoint};
pub use utils::error::{ConnPoolError, Result};
