//! One tunnel session: header parse, destination resolution, outbound connect, relay.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::SessionError;
use crate::outbound::{Connector, Destination};
use crate::protocol::parse_header;
use crate::relay::relay;

/// Runs a session on an upgraded WebSocket.
///
/// The first frame carries the request header; it comes from `early_data`
/// when the client sent one in the handshake, otherwise from the first
/// binary message. Errors after the upgrade close the WebSocket with the
/// error's close code before being returned.
#[tracing::instrument(skip_all, fields(client_ip = client_ip.unwrap_or("unknown")))]
pub async fn handle_socket<S, C>(
    mut websocket: WebSocketStream<S>,
    early_data: Option<Vec<u8>>,
    tunnel: &TunnelConfig,
    connector: &C,
    client_ip: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Connector,
{
    let first_frame = match early_data {
        Some(data) => data,
        None => match first_binary_frame(&mut websocket).await {
            Some(frame) => frame,
            None => {
                debug!("WebSocket closed before a request header arrived");
                return Ok(());
            }
        },
    };

    let request = match parse_header(&first_frame, tunnel.secret()) {
        Ok(request) => request,
        Err(e) => return reject(websocket, e).await,
    };

    let destination = Destination::resolve(&request, tunnel.override_host.as_deref());
    if destination.host != request.address {
        debug!(
            requested = %request.address,
            pinned = %destination.host,
            "Destination overridden"
        );
    }

    let outbound = match connector.connect(&destination).await {
        Ok(stream) => stream,
        Err(e) => return reject(websocket, e).await,
    };

    info!(target_addr = %destination, "Connected to target server");

    let end = relay(
        websocket,
        outbound,
        request.initial_payload(&first_frame),
        request.version,
        tunnel.idle_timeout(),
    )
    .await
    .with_context(|| format!("Relay to {destination} failed"))?;

    info!(target_addr = %destination, reason = ?end, "Proxy connection closed");
    Ok(())
}

/// Waits for the first binary message, skipping anything else.
async fn first_binary_frame<S>(websocket: &mut WebSocketStream<S>) -> Option<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = websocket.next().await {
        match msg {
            Ok(Message::Binary(data)) => return Some(data.to_vec()),
            Ok(Message::Text(_)) => warn!("Dropping text message before request header"),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Closes the WebSocket with the error's close code and reports the error.
async fn reject<S>(mut websocket: WebSocketStream<S>, error: SessionError) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(error = %error, "Rejecting tunnel session");
    if let Err(e) = websocket.close(Some(error.close_frame())).await {
        debug!("WebSocket close did not complete: {e}");
    }
    Err(error.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{COMMAND_TCP, VERSION};
    use futures_util::SinkExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::{Role, frame::coding::CloseCode};
    use uuid::Uuid;

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);
    const UUID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";

    /// Records every connect call and hands out one side of an in-memory pipe.
    #[derive(Default)]
    struct StubConnector {
        calls: Mutex<Vec<Destination>>,
        remote: Mutex<Option<DuplexStream>>,
        refuse: bool,
    }

    impl StubConnector {
        /// Returns the connector and the remote end of the pipe it will hand out.
        fn with_pipe() -> (Self, DuplexStream) {
            let (outbound, remote) = duplex(64 * 1024);
            let connector = Self {
                remote: Mutex::new(Some(outbound)),
                ..Self::default()
            };
            (connector, remote)
        }

        fn calls(&self) -> Vec<Destination> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Connector for StubConnector {
        type Stream = DuplexStream;

        async fn connect(&self, destination: &Destination) -> Result<DuplexStream, SessionError> {
            self.calls.lock().unwrap().push(destination.clone());
            let stream = if self.refuse {
                None
            } else {
                self.remote.lock().unwrap().take()
            };
            stream.ok_or_else(|| SessionError::UpstreamConnectFailed {
                destination: destination.clone(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            })
        }
    }

    fn tunnel() -> TunnelConfig {
        TunnelConfig::new(Uuid::parse_str(UUID).unwrap())
    }

    fn domain_header(secret: &[u8; 16], host: &str, port: u16) -> Vec<u8> {
        let mut frame = vec![VERSION];
        frame.extend_from_slice(secret);
        frame.push(0);
        frame.push(COMMAND_TCP);
        frame.extend_from_slice(&port.to_be_bytes());
        frame.push(2);
        frame.push(host.len() as u8);
        frame.extend_from_slice(host.as_bytes());
        frame
    }

    async fn websocket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server, client) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        (server, client)
    }

    async fn expect_close(client: &mut WebSocketStream<DuplexStream>) -> CloseCode {
        let msg = timeout(TEST_TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
        match msg {
            Message::Close(Some(frame)) => frame.code,
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwards_payload_then_later_frames_in_order() {
        let tunnel = tunnel();
        let (connector, mut remote) = StubConnector::with_pipe();
        let (server_ws, mut client_ws) = websocket_pair().await;

        let mut first = domain_header(tunnel.secret(), "example.com", 80);
        first.extend_from_slice(b"P");

        let client = async {
            client_ws
                .send(Message::Binary(first.into()))
                .await
                .unwrap();
            client_ws
                .send(Message::Binary(b"Q".to_vec().into()))
                .await
                .unwrap();

            let mut received = [0u8; 2];
            timeout(TEST_TIMEOUT, remote.read_exact(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&received, b"PQ");

            remote.write_all(b"reply").await.unwrap();
            let msg = timeout(TEST_TIMEOUT, client_ws.next()).await.unwrap().unwrap().unwrap();
            assert_eq!(msg.into_data().as_ref(), b"\x00\x00reply");
            drop(remote);
        };

        let (result, ()) = tokio::join!(
            handle_socket(server_ws, None, &tunnel, &connector, None),
            client
        );
        result.unwrap();
        assert_eq!(connector.calls(), vec![Destination::new("example.com", 80)]);
    }

    #[tokio::test]
    async fn invalid_secret_never_reaches_connector() {
        let tunnel = tunnel();
        let (connector, _remote) = StubConnector::with_pipe();
        let (server_ws, mut client_ws) = websocket_pair().await;

        let mut secret = *tunnel.secret();
        secret[3] ^= 0x40;
        client_ws
            .send(Message::Binary(domain_header(&secret, "example.com", 80).into()))
            .await
            .unwrap();

        let err = handle_socket(server_ws, None, &tunnel, &connector, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::InvalidSecret)
        ));
        assert!(connector.calls().is_empty());
        assert_eq!(expect_close(&mut client_ws).await, CloseCode::Policy);
    }

    #[tokio::test]
    async fn override_host_pins_destination_and_keeps_port() {
        let mut tunnel = tunnel();
        tunnel.override_host = Some("egress.internal".to_string());
        let (connector, remote) = StubConnector::with_pipe();
        let (server_ws, _client_ws) = websocket_pair().await;

        let early = domain_header(tunnel.secret(), "example.com", 8443);
        drop(remote);
        handle_socket(server_ws, Some(early), &tunnel, &connector, None)
            .await
            .unwrap();

        assert_eq!(
            connector.calls(),
            vec![Destination::new("egress.internal", 8443)]
        );
    }

    #[tokio::test]
    async fn early_data_carries_header_and_payload() {
        let tunnel = tunnel();
        let (connector, mut remote) = StubConnector::with_pipe();
        let (server_ws, _client_ws) = websocket_pair().await;

        let mut early = domain_header(tunnel.secret(), "example.com", 443);
        early.extend_from_slice(b"hello");

        let session = tokio::spawn(async move {
            handle_socket(server_ws, Some(early), &tunnel, &connector, None).await
        });

        let mut received = [0u8; 5];
        timeout(TEST_TIMEOUT, remote.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"hello");
        drop(remote);
        timeout(TEST_TIMEOUT, session).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_failure_closes_with_error_code() {
        let tunnel = tunnel();
        let connector = StubConnector {
            refuse: true,
            ..StubConnector::default()
        };
        let (server_ws, mut client_ws) = websocket_pair().await;

        let early = domain_header(tunnel.secret(), "unreachable.invalid", 9);
        let err = handle_socket(server_ws, Some(early), &tunnel, &connector, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::UpstreamConnectFailed { .. })
        ));
        assert_eq!(connector.calls().len(), 1);
        assert_eq!(expect_close(&mut client_ws).await, CloseCode::Error);
    }

    #[tokio::test]
    async fn malformed_header_closes_with_protocol_code() {
        let tunnel = tunnel();
        let (connector, _remote) = StubConnector::with_pipe();
        let (server_ws, mut client_ws) = websocket_pair().await;

        let mut frame = domain_header(tunnel.secret(), "example.com", 80);
        frame[0] = 1;
        let err = handle_socket(server_ws, Some(frame), &tunnel, &connector, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::UnsupportedVersion(1))
        ));
        assert!(connector.calls().is_empty());
        assert_eq!(expect_close(&mut client_ws).await, CloseCode::Protocol);
    }

    #[tokio::test]
    async fn client_leaving_before_header_is_not_an_error() {
        let tunnel = tunnel();
        let connector = StubConnector::default();
        let (server_ws, mut client_ws) = websocket_pair().await;

        client_ws.close(None).await.unwrap();
        handle_socket(server_ws, None, &tunnel, &connector, None)
            .await
            .unwrap();
        assert!(connector.calls().is_empty());
    }
}
