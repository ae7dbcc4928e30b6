//! Bidirectional byte relay between the upgraded WebSocket and the outbound stream.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as TungsteniteError, Message, error::ProtocolError,
        protocol::frame::coding::CloseCode,
    },
};
use tracing::{debug, error, info, warn};

use crate::error::close_frame;
use crate::protocol::response_header;

pub const BUFFER_SIZE: usize = 8192;

/// Why a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    IdleTimeout,
}

/// Runs the relay until either side goes away, then closes the WebSocket.
///
/// `initial_payload` is written to `outbound` before any further WebSocket
/// frame is read. The first frame sent back to the client is prefixed with
/// the response header for `version`.
pub async fn relay<S, O>(
    websocket: WebSocketStream<S>,
    outbound: O,
    initial_payload: &[u8],
    version: u8,
    idle_timeout: Option<Duration>,
) -> Result<RelayEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (mut tcp_reader, mut tcp_writer) = tokio::io::split(outbound);

    let started = Instant::now();
    let last_activity = AtomicU64::new(0);
    let touch = || last_activity.store(elapsed_millis(started), Ordering::Relaxed);

    let ws_to_tcp = async {
        if !initial_payload.is_empty() {
            debug!(bytes = initial_payload.len(), "Forwarding initial payload to TCP");
            tcp_writer
                .write_all(initial_payload)
                .await
                .context("Failed to write initial payload to TCP connection")?;
        }

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    touch();
                    debug!(bytes = data.len(), "Forwarding data from WebSocket to TCP");
                    if let Err(e) = tcp_writer.write_all(&data).await {
                        error!(error = %e, bytes = data.len(), "Failed to write to TCP");
                        return Err(e).context("Failed to write WebSocket data to TCP connection");
                    }
                }
                Ok(Message::Text(_)) => {
                    warn!("Dropping text message (binary only)");
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => match e {
                    TungsteniteError::ConnectionClosed
                    | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!("Client disconnected: {e}");
                        break;
                    }
                    _ => {
                        error!("WebSocket error: {e}");
                        return Err(e).context("WebSocket read failed");
                    }
                },
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(RelayEnd::ClientClosed)
    };

    let tcp_to_ws = async {
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut prefix = Some(response_header(version));

        loop {
            let n = tcp_reader
                .read(&mut buffer)
                .await
                .context("Failed to read from TCP connection")?;
            if n == 0 {
                info!("TCP connection closed");
                break;
            }
            touch();
            debug!(bytes = n, "Forwarding data from TCP to WebSocket");

            let frame = match prefix.take() {
                Some(prefix) => [prefix.as_slice(), &buffer[..n]].concat(),
                None => buffer[..n].to_vec(),
            };
            if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                error!(error = %e, bytes = n, "Failed to send WebSocket message");
                return Err(e).context("Failed to send TCP data via WebSocket");
            }
        }
        Ok::<_, anyhow::Error>(RelayEnd::UpstreamClosed)
    };

    let idle = async {
        let Some(limit) = idle_timeout else {
            return std::future::pending::<Result<RelayEnd>>().await;
        };
        loop {
            let idle_for = Duration::from_millis(
                elapsed_millis(started).saturating_sub(last_activity.load(Ordering::Relaxed)),
            );
            if idle_for >= limit {
                return Ok::<_, anyhow::Error>(RelayEnd::IdleTimeout);
            }
            tokio::time::sleep(limit - idle_for).await;
        }
    };

    let outcome: Result<RelayEnd> = tokio::select! {
        result = ws_to_tcp => result,
        result = tcp_to_ws => result,
        result = idle => result,
    };

    let frame = match &outcome {
        Ok(RelayEnd::IdleTimeout) => close_frame(CloseCode::Away, "idle timeout"),
        Ok(_) => close_frame(CloseCode::Normal, ""),
        Err(e) => close_frame(CloseCode::Error, &e.to_string()),
    };
    let _ = tcp_writer.shutdown().await;
    if let Ok(mut websocket) = ws_sender.reunite(ws_receiver) {
        if let Err(e) = websocket.close(Some(frame)).await {
            debug!("WebSocket close did not complete: {e}");
        }
    }

    outcome
}

fn elapsed_millis(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
