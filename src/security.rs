use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

use crate::error::SessionError;
use crate::protocol::SECRET_LEN;

/// Compares a parsed secret against the configured one.
///
/// Plain byte equality: a candidate of the wrong length or with any
/// differing byte is rejected. Not constant-time.
pub fn validate_secret(candidate: &[u8], expected: &[u8; SECRET_LEN]) -> Result<(), SessionError> {
    if candidate == expected.as_slice() {
        Ok(())
    } else {
        Err(SessionError::InvalidSecret)
    }
}

/// Parses the original client IP from X-Forwarded-For header
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost (original client) IP
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Peers allowed to connect to the listener, typically the fronting CDN or load balancer.
#[derive(Debug, Clone, Default)]
pub struct ProxyAllowlist {
    nets: Option<Vec<IpNet>>,
}

impl ProxyAllowlist {
    /// Builds the allowlist from config entries, each an IP address or a CIDR subnet.
    /// `None` allows every peer.
    pub fn parse(entries: Option<&[String]>) -> Result<Self> {
        let Some(entries) = entries else {
            return Ok(Self::default());
        };

        let nets = entries
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .or_else(|_| entry.parse::<IpNet>())
                    .map_err(|_| {
                        anyhow!("Invalid IP address or CIDR in allowed_proxy_ips: {}", entry)
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { nets: Some(nets) })
    }

    #[must_use]
    pub fn allows(&self, peer: IpAddr) -> bool {
        self.nets
            .as_ref()
            .is_none_or(|nets| nets.iter().any(|net| net.contains(&peer)))
    }
}
