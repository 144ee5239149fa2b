//! Shared helpers for integration tests

#![allow(dead_code)]

use connpool::transport::TcpEndpoint;
use connpool::{CloseMethod, Connection, ConnectionFactory};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// In-memory connection that echoes whatever is written to it.
pub struct EchoConnection {
    pub id: usize,
    local: DuplexStream,
    remote: DuplexStream,
    closes: Arc<Mutex<Vec<usize>>>,
}

impl AsyncRead for EchoConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.remote).poll_read(cx, buf)
    }
}

impl AsyncWrite for EchoConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.local).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.local).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.local).poll_shutdown(cx)
    }
}

impl Connection for EchoConnection {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 50_000 + self.id as u16)))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 80)))
    }

    async fn close(&mut self, _method: CloseMethod) -> io::Result<()> {
        self.closes.lock().unwrap().push(self.id);
        Ok(())
    }
}

/// Factory whose connects can be made to fail or stall on demand.
#[derive(Default)]
pub struct ScriptedFactory {
    connects: AtomicUsize,
    failures: AtomicUsize,
    stalled: Mutex<bool>,
    release: Notify,
    closes: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Hold every connect until `unstall` is called.
    pub fn stall(&self) {
        *self.stalled.lock().unwrap() = true;
    }

    pub fn unstall(&self) {
        *self.stalled.lock().unwrap() = false;
        self.release.notify_waiters();
    }

    pub fn closed(&self) -> Vec<usize> {
        self.closes.lock().unwrap().clone()
    }
}

impl ConnectionFactory for ScriptedFactory {
    type Endpoint = TcpEndpoint;
    type Connection = EchoConnection;

    async fn connect(
        &self,
        _endpoint: &TcpEndpoint,
        cancel: &CancellationToken,
    ) -> io::Result<EchoConnection> {
        let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;

        loop {
            let released = self.release.notified();
            if !*self.stalled.lock().unwrap() {
                break;
            }
            tokio::select! {
                _ = released => {}
                _ = cancel.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "connect cancelled"));
                }
            }
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }

        let (local, remote) = tokio::io::duplex(1024);
        Ok(EchoConnection {
            id,
            local,
            remote,
            closes: Arc::clone(&self.closes),
        })
    }
}

pub fn endpoint(host: &str) -> TcpEndpoint {
    TcpEndpoint::new(host, 80)
}

/// Start a TCP echo server, returning its address.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    tokio::io::copy(&mut reader, &mut writer).await.ok();
                });
            }
        }
    });

    addr
}
