use super::pooled::PooledConnection;
use super::stats::EndpointStats;
use super::waiter::{Grant, GrantReceiver, Lease, LeaseId, WaiterQueue};
use super::{close_all, close_detached, close_quietly};
use crate::config::PoolConfig;
use crate::transport::{CloseMethod, ConnectionFactory};
use crate::utils::error::{ConnPoolError, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

impl<C> IdleConnection<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            idle_since: Instant::now(),
        }
    }

    fn is_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.idle_since) > idle_timeout
    }
}

/// Bookkeeping of one endpoint, only touched under the endpoint's mutex.
///
/// `live` counts idle connections, checked-out connections and reserved slots
/// whose connection is still being opened. Waiters only queue up while `idle`
/// is empty and `live` is at the limit: every path that adds to `idle` first
/// offers the connection to the waiters, and every path that frees a slot first
/// offers it as a permit.
struct EndpointState<C> {
    idle: Vec<IdleConnection<C>>,
    live: usize,
    checked_out: HashSet<LeaseId>,
    waiters: WaiterQueue<C>,
    disposed: bool,
    created_total: u64,
    reused_total: u64,
    handoffs_total: u64,
}

impl<C> EndpointState<C> {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            live: 0,
            checked_out: HashSet::new(),
            waiters: WaiterQueue::new(),
            disposed: false,
            created_total: 0,
            reused_total: 0,
            handoffs_total: 0,
        }
    }

    fn lease(&mut self, conn: C) -> Lease<C> {
        let id = LeaseId::next();
        self.checked_out.insert(id);
        Lease { id, conn }
    }

    /// Give up one slot: the oldest waiter gets it as a permit, otherwise
    /// capacity shrinks.
    fn free_slot(&mut self) {
        if self.waiters.offer(Grant::Permit).is_some() {
            debug_assert!(self.live > 0, "freeing a slot that was never taken");
            self.live = self.live.saturating_sub(1);
        }
    }

    fn take_expired(&mut self, idle_timeout: Option<Duration>) -> Vec<C> {
        let Some(idle_timeout) = idle_timeout else {
            return Vec::new();
        };

        let now = Instant::now();
        let (expired, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut self.idle)
            .into_iter()
            .partition(|entry| entry.is_expired(idle_timeout, now));
        self.idle = fresh;

        for _ in &expired {
            self.free_slot();
        }
        expired.into_iter().map(|entry| entry.conn).collect()
    }
}

/// Admission control for a single endpoint.
///
/// Serves acquires from the idle list (most recently released first), opens new
/// connections while fewer than `max_connections` are live, and queues
/// everything else in FIFO order. A released connection goes straight to the
/// oldest waiter when there is one and only lands in the idle list otherwise.
pub struct EndpointPool<F: ConnectionFactory> {
    endpoint: F::Endpoint,
    factory: Arc<F>,
    max_connections: usize,
    max_idle: usize,
    idle_timeout: Option<Duration>,
    state: Mutex<EndpointState<F::Connection>>,
}

/// The outcome of the admission decision, already in a form that cleans up
/// after itself if the acquire is abandoned.
enum Admission<'a, F: ConnectionFactory> {
    Reuse(PooledConnection<F>),
    Open(Reservation<'a, F>),
    Wait(Ticket<'a, F>),
}

impl<F: ConnectionFactory> EndpointPool<F> {
    pub fn new(
        endpoint: F::Endpoint,
        factory: Arc<F>,
        max_connections: usize,
        config: &PoolConfig,
    ) -> Self {
        Self {
            endpoint,
            factory,
            max_connections: max_connections.max(1),
            max_idle: config.max_idle_per_endpoint,
            idle_timeout: config.idle_timeout(),
            state: Mutex::new(EndpointState::new()),
        }
    }

    pub fn endpoint(&self) -> &F::Endpoint {
        &self.endpoint
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn state(&self) -> MutexGuard<'_, EndpointState<F::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection for exclusive use until it is closed or dropped.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<F>> {
        if cancel.is_cancelled() {
            return Err(ConnPoolError::Cancelled);
        }

        let (admission, expired) = {
            let mut state = self.state();
            if state.disposed {
                return Err(ConnPoolError::invalid(format!(
                    "pool for {} is disposed",
                    self.endpoint
                )));
            }

            let expired = state.take_expired(self.idle_timeout);

            let admission = if let Some(entry) = state.idle.pop() {
                state.reused_total += 1;
                let lease = state.lease(entry.conn);
                Admission::Reuse(PooledConnection::new(Arc::clone(self), lease))
            } else if state.live < self.max_connections {
                // Reserve the slot before connecting so concurrent acquires
                // cannot overshoot the limit.
                state.live += 1;
                Admission::Open(Reservation::new(self))
            } else {
                Admission::Wait(Ticket::new(self, state.waiters.enqueue()))
            };

            (admission, expired)
        };

        if !expired.is_empty() {
            debug!(
                "Discarding {} expired idle connection(s) to {}",
                expired.len(),
                self.endpoint
            );
            for conn in expired {
                close_quietly(conn, CloseMethod::Graceful).await;
            }
        }

        match admission {
            Admission::Reuse(conn) => {
                trace!("Reusing pooled connection to {}", self.endpoint);
                Ok(conn)
            }
            Admission::Open(reservation) => self.open(reservation, cancel).await,
            Admission::Wait(ticket) => self.wait(ticket, cancel).await,
        }
    }

    /// Open a connection into a slot that is already counted in `live`.
    async fn open(
        self: &Arc<Self>,
        reservation: Reservation<'_, F>,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<F>> {
        debug!("Pool miss for {}, creating new connection", self.endpoint);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnPoolError::Cancelled),
            result = self.factory.connect(&self.endpoint, cancel) => result.map_err(|source| {
                if cancel.is_cancelled() {
                    ConnPoolError::Cancelled
                } else {
                    ConnPoolError::ConnectFailed {
                        endpoint: self.endpoint.to_string(),
                        source,
                    }
                }
            }),
        };

        let conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Could not open connection to {}: {}", self.endpoint, e);
                // The slot goes to the next waiter, if any.
                drop(reservation);
                return Err(e);
            }
        };

        let lease = {
            let mut state = self.state();
            if state.disposed {
                Err(conn)
            } else {
                state.created_total += 1;
                Ok(state.lease(conn))
            }
        };

        match lease {
            Ok(lease) => {
                reservation.commit();
                Ok(PooledConnection::new(Arc::clone(self), lease))
            }
            Err(conn) => {
                drop(reservation);
                close_quietly(conn, CloseMethod::Graceful).await;
                Err(ConnPoolError::invalid(format!(
                    "pool for {} was disposed while connecting",
                    self.endpoint
                )))
            }
        }
    }

    async fn wait(
        self: &Arc<Self>,
        mut ticket: Ticket<'_, F>,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<F>> {
        trace!("No capacity for {}, queueing acquire", self.endpoint);

        tokio::select! {
            biased;
            grant = ticket.recv() => match grant {
                Some(Grant::Handoff(lease)) => Ok(PooledConnection::new(Arc::clone(self), lease)),
                Some(Grant::Permit) => self.open(Reservation::new(self), cancel).await,
                None => Err(ConnPoolError::invalid(format!(
                    "pool for {} was disposed",
                    self.endpoint
                ))),
            },
            _ = cancel.cancelled() => {
                debug!("Queued acquire for {} cancelled", self.endpoint);
                // Anything handed over in the meantime goes back to the pool
                // when the ticket drops.
                Err(ConnPoolError::Cancelled)
            }
        }
    }

    /// Return a checked-out connection.
    ///
    /// A healthy connection goes to the oldest waiter or to the idle list. When the
    /// pool decides to destroy the connection instead (unhealthy, idle list full,
    /// pool disposed) it is handed back and the caller closes it.
    pub fn release(
        &self,
        id: LeaseId,
        conn: F::Connection,
        was_healthy: bool,
    ) -> Result<Option<F::Connection>> {
        let mut state = self.state();

        if !state.checked_out.remove(&id) {
            warn!(
                "Rejected release of lease {} to {}: not checked out",
                id.as_u64(),
                self.endpoint
            );
            return Err(ConnPoolError::invalid(format!(
                "lease {} is not checked out from {}",
                id.as_u64(),
                self.endpoint
            )));
        }

        if state.disposed {
            state.live = state.live.saturating_sub(1);
            return Ok(Some(conn));
        }

        if !was_healthy {
            debug!("Destroying unhealthy connection to {}", self.endpoint);
            state.free_slot();
            return Ok(Some(conn));
        }

        let lease = state.lease(conn);
        let conn = match state.waiters.offer(Grant::Handoff(lease)) {
            Some(Grant::Handoff(lease)) => {
                state.checked_out.remove(&lease.id);
                lease.conn
            }
            _ => {
                state.handoffs_total += 1;
                trace!("Handed connection to {} to a waiter", self.endpoint);
                return Ok(None);
            }
        };

        if state.idle.len() >= self.max_idle {
            state.live = state.live.saturating_sub(1);
            trace!("Pool for {} is full, discarding connection", self.endpoint);
            return Ok(Some(conn));
        }

        state.idle.push(IdleConnection::new(conn));
        trace!(
            "Returned connection to pool for {} (idle: {})",
            self.endpoint,
            state.idle.len()
        );
        Ok(None)
    }

    /// Put back a grant that reached a waiter which no longer wants it.
    fn reclaim(&self, grant: Grant<F::Connection>) {
        match grant {
            Grant::Handoff(lease) => {
                trace!(
                    "Waiter for {} gave up after hand-off, returning connection",
                    self.endpoint
                );
                match self.release(lease.id, lease.conn, true) {
                    Ok(None) => {}
                    Ok(Some(conn)) => close_detached(conn, CloseMethod::Graceful),
                    Err(e) => warn!(
                        "Could not return abandoned connection to {}: {}",
                        self.endpoint, e
                    ),
                }
            }
            Grant::Permit => self.state().free_slot(),
        }
    }

    /// Remove idle connections that outlived the idle timeout.
    pub(crate) fn evict_expired(&self) -> Vec<F::Connection> {
        let mut state = self.state();
        if state.disposed {
            return Vec::new();
        }
        state.take_expired(self.idle_timeout)
    }

    /// Refuse further acquires, fail queued waiters and hand out the idle list.
    pub(crate) fn shut_down(&self) -> Vec<F::Connection> {
        let mut state = self.state();
        if state.disposed {
            return Vec::new();
        }

        state.disposed = true;
        state.waiters.clear();

        let idle: Vec<_> = state.idle.drain(..).map(|entry| entry.conn).collect();
        state.live = state.live.saturating_sub(idle.len());

        debug!(
            "Disposed pool for {} ({} idle, {} still checked out)",
            self.endpoint,
            idle.len(),
            state.checked_out.len()
        );
        idle
    }

    /// Close every idle connection and refuse further acquires.
    ///
    /// Checked-out connections are destroyed when they come back.
    pub async fn dispose(&self) -> Result<()> {
        close_all(self.shut_down()).await
    }

    pub fn stats(&self) -> EndpointStats {
        let state = self.state();
        EndpointStats {
            endpoint: self.endpoint.to_string(),
            max_connections: self.max_connections,
            live: state.live,
            idle: state.idle.len(),
            checked_out: state.checked_out.len(),
            waiters: state.waiters.len(),
            created_total: state.created_total,
            reused_total: state.reused_total,
            handoffs_total: state.handoffs_total,
            disposed: state.disposed,
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for EndpointPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("endpoint", &self.endpoint.to_string())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

/// A slot counted in `live` that has no connection yet. Freed on drop unless
/// committed.
struct Reservation<'a, F: ConnectionFactory> {
    pool: &'a EndpointPool<F>,
    armed: bool,
}

impl<'a, F: ConnectionFactory> Reservation<'a, F> {
    fn new(pool: &'a EndpointPool<F>) -> Self {
        Self { pool, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state().free_slot();
        }
    }
}

/// A queued acquire. Whatever reaches it after it stops listening is
/// reclaimed on drop.
struct Ticket<'a, F: ConnectionFactory> {
    pool: &'a EndpointPool<F>,
    rx: GrantReceiver<F::Connection>,
}

impl<'a, F: ConnectionFactory> Ticket<'a, F> {
    fn new(pool: &'a EndpointPool<F>, rx: GrantReceiver<F::Connection>) -> Self {
        Self { pool, rx }
    }

    async fn recv(&mut self) -> Option<Grant<F::Connection>> {
        (&mut self.rx).await.ok()
    }
}

impl<F: ConnectionFactory> Drop for Ticket<'_, F> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            self.pool.reclaim(grant);
        }
    }
}
