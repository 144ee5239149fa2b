use serde::Serialize;

/// Snapshot of one endpoint pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub max_connections: usize,
    /// Connections created and not yet destroyed, including reserved slots
    /// whose connection is still being opened
    pub live: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Queued acquires that are still waiting
    pub waiters: usize,
    pub created_total: u64,
    pub reused_total: u64,
    pub handoffs_total: u64,
    pub disposed: bool,
}

/// Statistics about the connection pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_live: usize,
    pub total_idle: usize,
    pub total_waiters: usize,
    pub endpoints: Vec<EndpointStats>,
}

impl PoolStats {
    pub fn from_endpoints(mut endpoints: Vec<EndpointStats>) -> Self {
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        Self {
            total_live: endpoints.iter().map(|e| e.live).sum(),
            total_idle: endpoints.iter().map(|e| e.idle).sum(),
            total_waiters: endpoints.iter().map(|e| e.waiters).sum(),
            endpoints,
        }
    }

    pub fn endpoint(&self, endpoint: &str) -> Option<&EndpointStats> {
        self.endpoints.iter().find(|e| e.endpoint == endpoint)
    }
}
