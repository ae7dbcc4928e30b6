//! Destination resolution and outbound TCP connections.

use std::{fmt, future::Future, io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::error::SessionError;
use crate::protocol::SessionRequest;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Derives the connect target from a parsed request.
    ///
    /// A configured override host replaces the requested host whenever they
    /// differ; the requested port is always kept.
    #[must_use]
    pub fn resolve(request: &SessionRequest, override_host: Option<&str>) -> Self {
        match override_host {
            Some(host) if host != request.address => Self::new(host, request.port),
            _ => Self::new(request.address.clone(), request.port),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Opens the outbound leg of a session.
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        destination: &Destination,
    ) -> impl Future<Output = Result<Self::Stream, SessionError>> + Send;
}

/// Plain TCP connector with a bounded connect time.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, destination: &Destination) -> Result<TcpStream, SessionError> {
        debug!(target_addr = %destination, "Attempting to connect to target server");

        let attempt = TcpStream::connect((destination.host.as_str(), destination.port));
        let result = match timeout(self.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        };

        let stream = result.map_err(|source| SessionError::UpstreamConnectFailed {
            destination: destination.clone(),
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target_addr = %destination, "Failed to set TCP_NODELAY: {e}");
        }
        Ok(stream)
    }
}
