use super::{CloseMethod, Connection, ConnectionFactory, Endpoint};
use crate::config::ConnectorConfig;
use crate::utils::error::ConnPoolError;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Host and port of a TCP destination, optionally carrying its own connection limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
    pub max_connections: Option<usize>,
}

impl TcpEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            max_connections: None,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = Some(max_connections);
        self
    }
}

impl Endpoint for TcpEndpoint {
    fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }
}

impl fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for TcpEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for TcpEndpoint {
    type Err = ConnPoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConnPoolError::Config(format!("Endpoint '{}' is missing a port", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ConnPoolError::Config(format!(
                "Endpoint '{}' is missing a host",
                s
            )));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| ConnPoolError::Config(format!("Invalid port in '{}': {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

/// A TCP stream handed out by [`TcpConnector`].
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    closed: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Err(not_connected()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(not_connected()));
        }
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Connection for TcpConnection {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    async fn close(&mut self, method: CloseMethod) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }

        let result = match method {
            CloseMethod::Graceful => self.stream.shutdown().await,
            // Linger zero turns the close on drop into a RST.
            CloseMethod::Abort => SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)),
            CloseMethod::Immediate => Ok(()),
        };

        self.closed = true;
        trace!(
            "Closed TCP connection to {:?} ({:?})",
            self.stream.peer_addr().ok(),
            method
        );
        result
    }
}

/// Opens TCP connections with a connect timeout and the configured socket options.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    nodelay: bool,
    keepalive: Option<Duration>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::from_config(&ConnectorConfig::default())
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            nodelay: true,
            keepalive: None,
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            nodelay: config.tcp_nodelay,
            keepalive: config.keepalive_secs.map(Duration::from_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let Some(idle) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

impl ConnectionFactory for TcpConnector {
    type Endpoint = TcpEndpoint;
    type Connection = TcpConnection;

    async fn connect(
        &self,
        endpoint: &TcpEndpoint,
        cancel: &CancellationToken,
    ) -> io::Result<TcpConnection> {
        let attempt = timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        );

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    format!("Connection to {} cancelled", endpoint),
                ));
            }
            result = attempt => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!(
                            "Connection to {} timed out after {:?}",
                            endpoint, self.connect_timeout
                        ),
                    ));
                }
            },
        };

        self.configure(&stream)?;
        debug!("Opened TCP connection to {}", endpoint);
        Ok(TcpConnection::new(stream))
    }
}
