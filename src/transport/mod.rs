//! Transport seams consumed by the pool.
//!
//! The pool never touches sockets directly. It asks a [`ConnectionFactory`] for a
//! new [`Connection`] to an [`Endpoint`] and closes connections through
//! [`Connection::close`]. The TCP implementation in [`tcp`] is the default
//! transport used by the `connpool` binary.

pub mod tcp;

pub use tcp::*;

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Identity of a destination, used as the partition key of the pool.
pub trait Endpoint: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {
    /// Per-destination connection limit. `None` falls back to the pool default.
    fn max_connections(&self) -> Option<usize> {
        None
    }
}

impl Endpoint for SocketAddr {}

/// How a connection should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMethod {
    /// Orderly shutdown. For a pooled connection this returns it to the pool.
    Graceful,
    /// Reset the connection.
    Abort,
    /// Release resources without any handshake.
    Immediate,
}

/// An open duplex byte stream to one endpoint.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn close(&mut self, method: CloseMethod) -> impl Future<Output = io::Result<()>> + Send;
}

/// Creates new connections for the pool.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Endpoint: Endpoint;
    type Connection: Connection;

    /// Open a new connection to `endpoint`.
    ///
    /// Implementations should stop early when `cancel` fires, but the pool also
    /// races this future against the token.
    fn connect(
        &self,
        endpoint: &Self::Endpoint,
        cancel: &CancellationToken,
    ) -> impl Future<Output = io::Result<Self::Connection>> + Send;
}
