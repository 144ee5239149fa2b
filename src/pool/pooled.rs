use super::{close_detached, close_quietly};
use super::endpoint::EndpointPool;
use super::waiter::{Lease, LeaseId};
use crate::transport::{CloseMethod, Connection, ConnectionFactory};
use crate::utils::error::{ConnPoolError, Result};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

/// Where a checked-out connection ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    CheckedOut,
    ReturnedToPool,
    Destroyed,
}

/// A connection checked out of an [`EndpointPool`].
///
/// Reads and writes go straight to the underlying connection. Closing it
/// gracefully gives it back to the pool instead of tearing down the transport;
/// `Abort` and `Immediate` destroy it. Dropping it without closing counts as an
/// abort.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<EndpointPool<F>>,
    id: LeaseId,
    conn: Option<F::Connection>,
    state: LeaseState,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(pool: Arc<EndpointPool<F>>, lease: Lease<F::Connection>) -> Self {
        Self {
            pool,
            id: lease.id,
            conn: Some(lease.conn),
            state: LeaseState::CheckedOut,
        }
    }

    pub fn endpoint(&self) -> &F::Endpoint {
        self.pool.endpoint()
    }

    pub fn lease_id(&self) -> LeaseId {
        self.id
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// The underlying connection, `None` once closed.
    pub fn get_ref(&self) -> Option<&F::Connection> {
        self.conn.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut F::Connection> {
        self.conn.as_mut()
    }

    /// Close the connection. Only the first call has an effect.
    pub async fn close(&mut self, method: CloseMethod) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        let healthy = method == CloseMethod::Graceful;
        // An unhealthy release frees the slot before the close so a waiter can
        // start replacing the connection.
        let released = self.pool.release(self.id, conn, healthy);
        self.state = match released {
            Ok(None) => LeaseState::ReturnedToPool,
            _ => LeaseState::Destroyed,
        };

        match released? {
            None => Ok(()),
            Some(conn) if healthy => {
                close_quietly(conn, CloseMethod::Graceful).await;
                Ok(())
            }
            Some(mut conn) => Ok(conn.close(method).await?),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(
                "Connection to {} dropped without close, discarding",
                self.pool.endpoint()
            );
            self.state = LeaseState::Destroyed;
            match self.pool.release(self.id, conn, false) {
                Ok(Some(conn)) => close_detached(conn, CloseMethod::Abort),
                Ok(None) => {}
                Err(e) => warn!("Failed to release dropped connection: {}", e),
            }
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", &self.pool.endpoint().to_string())
            .field("lease", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pooled connection is closed")
}

impl<F: ConnectionFactory> AsyncRead for PooledConnection<F> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::into_inner(self).conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_read(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}

impl<F: ConnectionFactory> AsyncWrite for PooledConnection<F> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::into_inner(self).conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_write(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::into_inner(self).conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_flush(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    // Shutting down the write half would poison the connection for the next
    // user, so a pooled connection only flushes here. Use `close` instead.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl<F: ConnectionFactory> Connection for PooledConnection<F> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.conn.as_ref().ok_or_else(not_connected)?.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.conn.as_ref().ok_or_else(not_connected)?.peer_addr()
    }

    async fn close(&mut self, method: CloseMethod) -> io::Result<()> {
        PooledConnection::close(self, method)
            .await
            .map_err(|e| match e {
                ConnPoolError::Io(e) => e,
                other => io::Error::other(other),
            })
    }
}
