//! Scripted in-memory transport for pool tests.

use super::pooled::PooledConnection;
use crate::config::PoolConfig;
use crate::transport::{CloseMethod, Connection, ConnectionFactory, TcpEndpoint};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

type CloseLog = Arc<Mutex<Vec<(usize, CloseMethod)>>>;

/// Loopback connection: whatever is written can be read back.
#[derive(Debug)]
pub(crate) struct MockConnection {
    id: usize,
    writer: DuplexStream,
    reader: DuplexStream,
    closes: CloseLog,
    fail_close: bool,
}

impl MockConnection {
    fn new(id: usize, closes: CloseLog, fail_close: bool) -> Self {
        let (writer, reader) = tokio::io::duplex(4096);
        Self {
            id,
            writer,
            reader,
            closes,
            fail_close,
        }
    }

    /// A connection no pool ever handed out.
    pub(crate) fn detached(id: usize) -> Self {
        Self::new(id, CloseLog::default(), false)
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

impl AsyncRead for MockConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

impl Connection for MockConnection {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 40_000 + self.id as u16)))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 80)))
    }

    async fn close(&mut self, method: CloseMethod) -> io::Result<()> {
        self.closes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((self.id, method));
        if self.fail_close {
            return Err(io::Error::other(format!("close of {} failed", self.id)));
        }
        Ok(())
    }
}

/// Factory that numbers its connections 1, 2, 3, ... in connect-call order.
#[derive(Default)]
pub(crate) struct MockFactory {
    attempts: AtomicUsize,
    failures: AtomicUsize,
    fail_close: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    closes: CloseLog,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every connect waits for one permit of `gate`.
    pub(crate) fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Fail the next `n` connects.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Connections created from now on fail to close.
    pub(crate) fn fail_closes(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> Vec<(usize, CloseMethod)> {
        self.closes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ConnectionFactory for MockFactory {
    type Endpoint = TcpEndpoint;
    type Connection = MockConnection;

    async fn connect(
        &self,
        _endpoint: &TcpEndpoint,
        _cancel: &CancellationToken,
    ) -> io::Result<MockConnection> {
        let id = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(io::Error::other)?.forget();
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }

        Ok(MockConnection::new(
            id,
            Arc::clone(&self.closes),
            self.fail_close.load(Ordering::SeqCst),
        ))
    }
}

pub(crate) fn endpoint(host: &str) -> TcpEndpoint {
    TcpEndpoint::new(host, 80)
}

/// One connection per endpoint, no idle expiry.
pub(crate) fn config() -> PoolConfig {
    PoolConfig {
        default_max_connections: 1,
        max_idle_per_endpoint: 8,
        idle_timeout_secs: 0,
    }
}

pub(crate) fn id_of(conn: &PooledConnection<MockFactory>) -> usize {
    conn.get_ref().map(MockConnection::id).unwrap_or_default()
}
