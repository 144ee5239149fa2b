use super::endpoint::EndpointPool;
use super::pooled::PooledConnection;
use super::stats::{EndpointStats, PoolStats};
use super::{close_all, close_quietly};
use crate::config::PoolConfig;
use crate::transport::{CloseMethod, ConnectionFactory, Endpoint};
use crate::utils::error::{ConnPoolError, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type EndpointMap<F> = DashMap<<F as ConnectionFactory>::Endpoint, Arc<EndpointPool<F>>>;

/// Connection pool for outbound connections
///
/// Keeps one [`EndpointPool`] per destination, created on first use and kept
/// for the lifetime of the pool. Endpoints never contend with each other: each
/// endpoint pool has its own lock.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    endpoints: Arc<EndpointMap<F>>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a new connection pool with the given configuration
    ///
    /// When an idle timeout is configured and a Tokio runtime is available, a
    /// background task sweeps expired idle connections until the pool is disposed
    /// or dropped.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let pool = Self {
            factory: Arc::new(factory),
            config,
            endpoints: Arc::new(DashMap::new()),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        };

        if let Some(interval) = pool.config.cleanup_interval() {
            pool.start_cleanup_task(interval);
        }

        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Get a connection to `endpoint`, waiting for capacity if needed.
    pub async fn acquire(
        &self,
        endpoint: &F::Endpoint,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<F>> {
        if self.is_disposed() {
            return Err(ConnPoolError::invalid("connection pool is disposed"));
        }

        let pool = self.endpoint_pool(endpoint);

        // dispose_all may have walked the map before this endpoint was added.
        if self.is_disposed() {
            pool.shut_down();
            return Err(ConnPoolError::invalid("connection pool is disposed"));
        }

        pool.acquire(cancel).await
    }

    /// Look up the pool for `endpoint`, creating it atomically on first use.
    fn endpoint_pool(&self, endpoint: &F::Endpoint) -> Arc<EndpointPool<F>> {
        if let Some(pool) = self.endpoints.get(endpoint) {
            return Arc::clone(pool.value());
        }

        let entry = self.endpoints.entry(endpoint.clone()).or_insert_with(|| {
            let max_connections = endpoint
                .max_connections()
                .unwrap_or(self.config.default_max_connections);
            debug!(
                "Creating pool for {} (max connections: {})",
                endpoint, max_connections
            );
            Arc::new(EndpointPool::new(
                endpoint.clone(),
                Arc::clone(&self.factory),
                max_connections,
                &self.config,
            ))
        });
        Arc::clone(entry.value())
    }

    /// The pool of an endpoint that has been used before.
    pub fn endpoint(&self, endpoint: &F::Endpoint) -> Option<Arc<EndpointPool<F>>> {
        self.endpoints
            .get(endpoint)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Close all idle connections in every endpoint pool.
    ///
    /// Queued acquires fail, later acquires are refused, and connections still
    /// checked out are destroyed when they are closed. Every close is attempted;
    /// failures are reported together.
    pub async fn dispose_all(&self) -> Result<()> {
        self.disposed.store(true, Ordering::Release);
        self.shutdown.cancel();

        let pools: Vec<_> = self
            .endpoints
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let idle: Vec<_> = pools.iter().flat_map(|pool| pool.shut_down()).collect();
        debug!(
            "Disposing connection pool: closing {} idle connection(s) across {} endpoint(s)",
            idle.len(),
            pools.len()
        );

        close_all(idle).await
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let endpoints = self
            .endpoints
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        PoolStats::from_endpoints(endpoints)
    }

    pub fn endpoint_stats(&self, endpoint: &F::Endpoint) -> Option<EndpointStats> {
        self.endpoints.get(endpoint).map(|entry| entry.value().stats())
    }

    /// Start background task to clean up expired connections
    fn start_cleanup_task(&self, interval: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime available, idle connections are only expired on acquire");
            return;
        };

        let endpoints = Arc::clone(&self.endpoints);
        let shutdown = self.shutdown.clone();

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let pools: Vec<_> = endpoints
                    .iter()
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();

                let mut total_removed = 0;
                for pool in pools {
                    let expired = pool.evict_expired();
                    if expired.is_empty() {
                        continue;
                    }

                    trace!(
                        "Cleanup: removed {} expired connections to {}",
                        expired.len(),
                        pool.endpoint()
                    );
                    total_removed += expired.len();
                    for conn in expired {
                        close_quietly(conn, CloseMethod::Graceful).await;
                    }
                }

                if total_removed > 0 {
                    debug!(
                        "Periodic cleanup removed {} expired connections",
                        total_removed
                    );
                }
            }

            trace!("Idle connection cleanup task stopped");
        });
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
