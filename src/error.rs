use std::io;
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::{CloseFrame, coding::CloseCode};

use crate::outbound::Destination;

/// Longest close reason that still fits a control frame next to the 2-byte code.
const MAX_CLOSE_REASON: usize = 123;

/// Terminal failures of a tunnel session. None of them is retried.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("request is not a WebSocket upgrade")]
    NotAnUpgradeRequest,

    #[error("truncated header: need {needed} bytes, frame has {available}")]
    TruncatedHeader { needed: usize, available: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid secret identifier")]
    InvalidSecret,

    #[error("unsupported command {0}, only TCP is supported")]
    UnsupportedCommand(u8),

    #[error("invalid address kind {0}")]
    InvalidAddressKind(u8),

    #[error("failed to connect to {destination}: {source}")]
    UpstreamConnectFailed {
        destination: Destination,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Close code used when this error ends an upgraded session.
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidSecret => CloseCode::Policy,
            Self::UpstreamConnectFailed { .. } => CloseCode::Error,
            Self::NotAnUpgradeRequest
            | Self::TruncatedHeader { .. }
            | Self::UnsupportedVersion(_)
            | Self::UnsupportedCommand(_)
            | Self::InvalidAddressKind(_) => CloseCode::Protocol,
        }
    }

    #[must_use]
    pub fn close_frame(&self) -> CloseFrame {
        close_frame(self.close_code(), &self.to_string())
    }
}

/// Builds a close frame, cutting the reason at a char boundary if it is too long.
#[must_use]
pub fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code,
        reason: reason[..end].to_owned().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_abnormal_close_codes() {
        assert_eq!(SessionError::InvalidSecret.close_code(), CloseCode::Policy);
        assert_eq!(
            SessionError::UnsupportedVersion(1).close_code(),
            CloseCode::Protocol
        );
        let err = SessionError::UpstreamConnectFailed {
            destination: Destination::new("example.com", 443),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(err.close_code(), CloseCode::Error);
        assert!(err.to_string().starts_with("failed to connect to example.com:443"));
    }

    #[test]
    fn truncates_long_close_reasons_on_char_boundary() {
        let reason = "é".repeat(100);
        let frame = close_frame(CloseCode::Error, &reason);
        assert!(frame.reason.len() <= MAX_CLOSE_REASON);
        assert!(frame.reason.chars().all(|c| c == 'é'));
    }
}
