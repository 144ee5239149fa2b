use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

static NEXT_LEASE: AtomicU64 = AtomicU64::new(1);

/// Identifies one checkout of a connection.
///
/// Every hand-out gets a fresh id, including a hand-off of a released connection
/// to a waiter, so a stale id can never release somebody else's checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(u64);

impl LeaseId {
    pub(crate) fn next() -> Self {
        LeaseId(NEXT_LEASE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A connection registered as checked out under `id`.
pub(crate) struct Lease<C> {
    pub(crate) id: LeaseId,
    pub(crate) conn: C,
}

/// What a queued acquire can be woken with.
pub(crate) enum Grant<C> {
    /// A released connection, already checked out to the waiter.
    Handoff(Lease<C>),
    /// A freed slot. The waiter opens the connection itself.
    Permit,
}

pub(crate) type GrantReceiver<C> = oneshot::Receiver<Grant<C>>;

/// FIFO queue of pending acquires for one endpoint.
///
/// A waiter that gave up simply drops its receiver. Delivery goes through
/// `oneshot::Sender::send`, which fails once the receiver is closed, so a
/// grant lands with exactly one party: the waiter or the queue.
pub(crate) struct WaiterQueue<C> {
    queue: VecDeque<oneshot::Sender<Grant<C>>>,
    /// Queue length after the last full sweep of abandoned waiters.
    swept_len: usize,
}

const MIN_SWEEP_LEN: usize = 8;

impl<C> WaiterQueue<C> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            swept_len: 0,
        }
    }

    /// Append a new waiter and return the receiving end of its grant.
    ///
    /// Abandoned waiters at either end are dropped on the spot. The rest of
    /// the queue is swept once it has doubled since the previous sweep.
    pub(crate) fn enqueue(&mut self) -> GrantReceiver<C> {
        self.trim();
        if self.queue.len() >= 2 * self.swept_len.max(MIN_SWEEP_LEN) {
            self.prune();
        }
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(tx);
        rx
    }

    /// Offer `grant` to the oldest waiter still listening.
    ///
    /// Returns the grant when nobody accepted it.
    pub(crate) fn offer(&mut self, mut grant: Grant<C>) -> Option<Grant<C>> {
        while let Some(tx) = self.queue.pop_front() {
            match tx.send(grant) {
                Ok(()) => return None,
                Err(rejected) => grant = rejected,
            }
        }
        Some(grant)
    }

    /// Drop every waiter. Their receivers observe a closed channel.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.swept_len = 0;
    }

    /// Number of waiters that are still listening. Walks the whole queue.
    pub(crate) fn len(&self) -> usize {
        self.queue.iter().filter(|tx| !tx.is_closed()).count()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn trim(&mut self) {
        while self.queue.front().is_some_and(|tx| tx.is_closed()) {
            self.queue.pop_front();
        }
        while self.queue.back().is_some_and(|tx| tx.is_closed()) {
            self.queue.pop_back();
        }
    }

    fn prune(&mut self) {
        self.queue.retain(|tx| !tx.is_closed());
        self.swept_len = self.queue.len();
    }
}
