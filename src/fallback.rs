//! Re-proxies non-tunnel requests to a decoy origin.

use anyhow::{Context, Result, anyhow, bail};
use hyper::{
    Request, Response, Uri,
    body::Incoming,
    client::conn::http1,
    header::{HOST, HeaderValue},
    http::uri::PathAndQuery,
};
use hyper_util::rt::TokioIo;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::{TlsConnector, TlsStream, rustls::pki_types::ServerName};
use tracing::debug;

use crate::outbound::DEFAULT_CONNECT_TIMEOUT;
use crate::stream::StreamType;
use crate::tls::fallback_client_config;

pub struct Fallback {
    host: String,
    port: u16,
    authority: HeaderValue,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl Fallback {
    /// Builds a fallback for an `http://` or `https://` origin.
    pub fn new(origin: &str) -> Result<Self> {
        let uri: Uri = origin
            .parse()
            .with_context(|| format!("Invalid fallback origin: {origin}"))?;
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => bail!("Fallback origin must use http or https: {origin}"),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("Fallback origin has no host: {origin}"))?;

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(if https { 443 } else { 80 });
        let tls = https.then(|| TlsConnector::from(Arc::new(fallback_client_config())));

        Ok(Self {
            host,
            port,
            authority: HeaderValue::from_str(authority.as_str())
                .context("Fallback origin authority is not a valid Host header")?,
            tls,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sends `req` to the origin unchanged apart from its target and `Host` header.
    pub async fn forward(&self, req: Request<Incoming>) -> Result<Response<Incoming>> {
        let stream = self.connect().await?;

        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake with fallback origin failed")?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Fallback origin connection ended");
            }
        });

        let (mut parts, body) = req.into_parts();
        debug!(method = %parts.method, uri = %parts.uri, "Forwarding request to fallback origin");
        parts.uri = parts
            .uri
            .path_and_query()
            .map_or("/", PathAndQuery::as_str)
            .parse()
            .context("Invalid request target")?;
        parts.headers.insert(HOST, self.authority.clone());

        sender
            .send_request(Request::from_parts(parts, body))
            .await
            .context("Fallback origin request failed")
    }

    async fn connect(&self) -> Result<StreamType> {
        let tcp = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "Timed out connecting to fallback origin after {:?}",
                self.connect_timeout
            )
        })?
        .with_context(|| {
            format!(
                "Failed to connect to fallback origin {}:{}",
                self.host, self.port
            )
        })?;

        match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.host.clone())
                    .context("Fallback origin is not a valid TLS server name")?;
                let tls = connector
                    .connect(name, tcp)
                    .await
                    .context("TLS handshake with fallback origin failed")?;
                Ok(StreamType::from(TlsStream::Client(tls)))
            }
            None => Ok(StreamType::from(tcp)),
        }
    }
}
