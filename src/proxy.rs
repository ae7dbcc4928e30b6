use anyhow::{Context, Result};
use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{
        CONNECTION, CONTENT_TYPE, HOST, HeaderMap, HeaderValue, SEC_WEBSOCKET_ACCEPT,
        SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
    },
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{handshake::derive_accept_key, protocol::Role},
};
use tracing::{debug, error, info, warn};

use crate::config::TunnelConfig;
use crate::error::SessionError;
use crate::fallback::Fallback;
use crate::outbound::Connector;
use crate::page::render_config_page;
use crate::security::parse_original_client_ip;
use crate::session::handle_socket;
use crate::stream::StreamType;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Early data uses the URL-safe alphabet; `+` and `/` are mapped onto it first.
const EARLY_DATA: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Everything a connection needs to serve requests, shared by all connections.
pub struct RelayState<C> {
    pub tunnel: TunnelConfig,
    pub connector: C,
    pub fallback: Option<Fallback>,
}

impl<C> RelayState<C> {
    pub fn new(tunnel: TunnelConfig, connector: C) -> Result<Self> {
        let fallback = tunnel
            .fallback_origin
            .as_deref()
            .map(|origin| {
                Fallback::new(origin)
                    .map(|fallback| fallback.with_connect_timeout(tunnel.connect_timeout()))
            })
            .transpose()?;
        Ok(Self {
            tunnel,
            connector,
            fallback,
        })
    }
}

#[tracing::instrument(skip_all, fields(client_addr = %client_addr))]
pub async fn handle_connection<C>(
    stream: StreamType,
    client_addr: SocketAddr,
    state: Arc<RelayState<C>>,
) -> Result<()>
where
    C: Connector + 'static,
{
    let tls = stream.is_tls();
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(route(req, state, client_addr, tls).await) }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .context("Failed to serve HTTP connection")
}

async fn route<C>(
    req: Request<Incoming>,
    state: Arc<RelayState<C>>,
    client_addr: SocketAddr,
    tls: bool,
) -> Response<ProxyBody>
where
    C: Connector + 'static,
{
    let path = req.uri().path();

    if path == state.tunnel.path {
        return match check_upgrade(&req) {
            Ok(key) => accept_tunnel(req, &key, state, client_addr),
            Err(e) => {
                warn!(error = %e, method = %req.method(), "Rejecting request on tunnel path");
                upgrade_required()
            }
        };
    }

    if state.tunnel.config_page && path == state.tunnel.config_page_path() {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        let mut response = Response::new(full(render_config_page(&state.tunnel, host, tls)));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        return response;
    }

    match &state.fallback {
        Some(fallback) => match fallback.forward(req).await {
            Ok(response) => response.map(BodyExt::boxed),
            Err(e) => {
                warn!(error = %e, "Fallback origin request failed");
                status_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        },
        None => status_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Checks that a request asks for a WebSocket upgrade and returns its key.
pub fn check_upgrade<B>(req: &Request<B>) -> Result<HeaderValue, SessionError> {
    let headers = req.headers();
    let upgrade = header_has_token(headers, &UPGRADE, "websocket");
    let connection = header_has_token(headers, &CONNECTION, "upgrade");
    let version = headers
        .get(SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v == "13");

    match headers.get(SEC_WEBSOCKET_KEY) {
        Some(key) if req.method() == Method::GET && upgrade && connection && version => {
            Ok(key.clone())
        }
        _ => Err(SessionError::NotAnUpgradeRequest),
    }
}

fn header_has_token(headers: &HeaderMap, name: &hyper::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Answers 101 and hands the upgraded connection to a session task.
fn accept_tunnel<C>(
    mut req: Request<Incoming>,
    key: &HeaderValue,
    state: Arc<RelayState<C>>,
    client_addr: SocketAddr,
) -> Response<ProxyBody>
where
    C: Connector + 'static,
{
    let protocol = req.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();
    let early_data = protocol
        .as_ref()
        .and_then(|p| p.to_str().ok())
        .and_then(decode_early_data);

    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|xff| xff.to_str().ok())
        .and_then(parse_original_client_ip)
        .unwrap_or_else(|| client_addr.ip().to_string());

    info!(
        client_ip = %client_ip,
        direct_addr = %client_addr,
        early_data = early_data.as_ref().map_or(0, Vec::len),
        "Accepting tunnel upgrade"
    );

    let on_upgrade = hyper::upgrade::on(&mut req);
    let echo_protocol = early_data.is_some();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let websocket =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                if let Err(e) = handle_socket(
                    websocket,
                    early_data,
                    &state.tunnel,
                    &state.connector,
                    Some(client_ip.as_str()),
                )
                .await
                {
                    error!(client_ip = %client_ip, error = %format_args!("{e:#}"), "Tunnel session failed");
                }
            }
            Err(e) => warn!(error = %e, "WebSocket upgrade failed"),
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));
    if let Some(protocol) = protocol.filter(|_| echo_protocol) {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    builder.body(empty()).unwrap_or_else(|e| {
        error!(error = %e, "Failed to build upgrade response");
        status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    })
}

/// Decodes early data sent in `Sec-WebSocket-Protocol`. Returns `None` when the
/// value is empty or not base64.
#[must_use]
pub fn decode_early_data(value: &str) -> Option<Vec<u8>> {
    if value.is_empty() {
        return None;
    }
    let normalized = value.replace('+', "-").replace('/', "_");
    match EARLY_DATA.decode(normalized) {
        Ok(data) if !data.is_empty() => Some(data),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "Sec-WebSocket-Protocol is not early data");
            None
        }
    }
}

fn upgrade_required() -> Response<ProxyBody> {
    let mut response = status_response(StatusCode::UPGRADE_REQUIRED, "Expected WebSocket upgrade");
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("websocket"));
    response
}

fn status_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request() -> hyper::http::request::Builder {
        Request::builder()
            .method(Method::GET)
            .uri("/")
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[test]
    fn accepts_websocket_upgrade() {
        let req = upgrade_request().body(()).unwrap();
        let key = check_upgrade(&req).unwrap();
        assert_eq!(key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(
            derive_accept_key(key.as_bytes()),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_token_is_case_insensitive() {
        let mut req = upgrade_request().body(()).unwrap();
        req.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(check_upgrade(&req).is_ok());
    }

    #[test]
    fn rejects_plain_get() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(matches!(
            check_upgrade(&req),
            Err(SessionError::NotAnUpgradeRequest)
        ));
    }

    #[test]
    fn rejects_upgrade_to_other_protocol() {
        let mut req = upgrade_request().body(()).unwrap();
        req.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(check_upgrade(&req).is_err());
    }

    #[test]
    fn rejects_upgrade_without_key() {
        let mut req = upgrade_request().body(()).unwrap();
        req.headers_mut().remove(SEC_WEBSOCKET_KEY);
        assert!(check_upgrade(&req).is_err());
    }

    #[test]
    fn rejects_post_upgrade() {
        let mut req = upgrade_request().body(()).unwrap();
        *req.method_mut() = Method::POST;
        assert!(check_upgrade(&req).is_err());
    }

    #[test]
    fn decodes_early_data_in_either_alphabet() {
        let bytes = vec![0xfb, 0xff, 0x00, 0x10];
        assert_eq!(decode_early_data("-_8AEA").as_deref(), Some(bytes.as_slice()));
        assert_eq!(decode_early_data("+/8AEA==").as_deref(), Some(bytes.as_slice()));
    }

    #[test]
    fn ignores_non_base64_protocols() {
        assert_eq!(decode_early_data(""), None);
        assert_eq!(decode_early_data("chat, superchat"), None);
    }
}
