//! VLESS request header decoding.
//!
//! The first inbound frame of a session carries a fixed-layout header
//! followed by the initial payload. Multi-byte integers are big-endian.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use crate::error::SessionError;
use crate::security::validate_secret;

pub const VERSION: u8 = 0;
pub const COMMAND_TCP: u8 = 1;
pub const SECRET_LEN: usize = 16;

/// Response header prefixed to the first frame sent back to the client.
#[must_use]
pub const fn response_header(version: u8) -> [u8; 2] {
    [version, 0]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Ipv4,
    Domain,
    Ipv6,
}

impl TryFrom<u8> for AddressKind {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ipv4),
            2 => Ok(Self::Domain),
            3 => Ok(Self::Ipv6),
            other => Err(SessionError::InvalidAddressKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub version: u8,
    pub secret: [u8; SECRET_LEN],
    pub addons_length: u8,
    pub command: u8,
    pub port: u16,
    pub address_kind: AddressKind,
    pub address: String,
    /// Offset in the first frame where the header ends and the payload begins.
    pub header_len: usize,
}

impl SessionRequest {
    /// Payload bytes that arrived in the same frame as the header.
    #[must_use]
    pub fn initial_payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        &frame[self.header_len..]
    }
}

/// Bounds-checked reader over the first frame.
struct HeaderCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderCursor<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SessionError> {
        let end = self.pos + len;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(SessionError::TruncatedHeader {
                needed: end,
                available: self.buf.len(),
            })?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, SessionError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SessionError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// Parses the session header from the first frame.
///
/// The version is checked first, then the secret is validated against
/// `expected_secret` before anything after it is decoded.
pub fn parse_header(
    frame: &[u8],
    expected_secret: &[u8; SECRET_LEN],
) -> Result<SessionRequest, SessionError> {
    let mut cursor = HeaderCursor::new(frame);

    let version = cursor.u8()?;
    if version != VERSION {
        return Err(SessionError::UnsupportedVersion(version));
    }

    let secret_bytes = cursor.take(SECRET_LEN)?;
    validate_secret(secret_bytes, expected_secret)?;
    let mut secret = [0u8; SECRET_LEN];
    secret.copy_from_slice(secret_bytes);

    let addons_length = cursor.u8()?;
    // Addons are reserved and never interpreted.
    cursor.take(usize::from(addons_length))?;

    let command = cursor.u8()?;
    if command != COMMAND_TCP {
        return Err(SessionError::UnsupportedCommand(command));
    }

    let port = cursor.u16()?;
    let address_kind = AddressKind::try_from(cursor.u8()?)?;
    let address = decode_address(address_kind, &mut cursor)?;

    Ok(SessionRequest {
        version,
        secret,
        addons_length,
        command,
        port,
        address_kind,
        address,
        header_len: cursor.pos,
    })
}

fn decode_address(kind: AddressKind, cursor: &mut HeaderCursor<'_>) -> Result<String, SessionError> {
    match kind {
        AddressKind::Ipv4 => {
            let b = cursor.take(4)?;
            Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string())
        }
        AddressKind::Domain => {
            let len = cursor.u8()?;
            let name = cursor.take(usize::from(len))?;
            Ok(String::from_utf8_lossy(name).into_owned())
        }
        AddressKind::Ipv6 => Ok(format_ipv6_expanded(cursor.take(16)?)),
    }
}

/// Renders 16 bytes as eight zero-padded lowercase hex groups, without `::` compression.
fn format_ipv6_expanded(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(39);
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{:04x}", u16::from_be_bytes([pair[0], pair[1]]));
    }
    out
}
