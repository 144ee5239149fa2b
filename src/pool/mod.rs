//! Bounded connection pooling keyed by endpoint.
//!
//! A [`ConnectionPool`] routes each request to the [`EndpointPool`] of its
//! destination. Every endpoint pool admits at most `max_connections` live
//! connections: idle connections are reused first (most recently released first),
//! then new ones are opened while capacity remains, and everything beyond that
//! waits in FIFO order for a released connection or a freed slot.

pub mod connection_pool;
pub mod endpoint;
pub mod pooled;
pub mod stats;
pub mod waiter;

#[cfg(test)]
pub(crate) mod testing;

pub use connection_pool::ConnectionPool;
pub use endpoint::EndpointPool;
pub use pooled::{LeaseState, PooledConnection};
pub use stats::{EndpointStats, PoolStats};
pub use waiter::LeaseId;

use crate::transport::{CloseMethod, Connection};
use crate::utils::error::{ConnPoolError, Result};
use futures::future::join_all;
use tracing::{debug, warn};

/// Close a connection the pool is destroying, logging instead of failing.
pub(crate) async fn close_quietly<C: Connection>(mut conn: C, method: CloseMethod) {
    if let Err(e) = conn.close(method).await {
        debug!("Failed to close discarded connection: {}", e);
    }
}

/// Close a connection from synchronous code. The close runs on the current
/// runtime; without one the transport is just dropped.
pub(crate) fn close_detached<C: Connection>(conn: C, method: CloseMethod) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(close_quietly(conn, method));
        }
        Err(_) => drop(conn),
    }
}

/// Gracefully close every connection concurrently, collecting the failures.
pub(crate) async fn close_all<C: Connection>(conns: Vec<C>) -> Result<()> {
    let results = join_all(
        conns
            .into_iter()
            .map(|mut conn| async move { conn.close(CloseMethod::Graceful).await }),
    )
    .await;

    let failures: Vec<_> = results.into_iter().filter_map(|r| r.err()).collect();
    if failures.is_empty() {
        return Ok(());
    }

    warn!(
        "{} connection(s) failed to close during dispose",
        failures.len()
    );
    Err(ConnPoolError::DisposeFailed { failures })
}
