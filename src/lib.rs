//! VLESS Relay Server
//!
//! An edge relay that accepts VLESS sessions carried over WebSocket and forwards
//! each tunneled TCP stream to the destination the client asks for.
//! Supports TLS termination, egress pinning, a decoy fallback origin and IP filtering.

pub mod config;
pub mod error;
pub mod fallback;
pub mod outbound;
pub mod page;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod security;
pub mod session;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use config::{Config, ListenConfig, TlsConfig, TunnelConfig, load_config};
pub use error::SessionError;
pub use outbound::{Connector, Destination, TcpConnector};
pub use protocol::{AddressKind, SessionRequest, parse_header};
pub use proxy::{RelayState, handle_connection};
pub use relay::{BUFFER_SIZE, RelayEnd, relay};
pub use security::{ProxyAllowlist, parse_original_client_ip, validate_secret};
pub use session::handle_socket;
pub use stream::StreamType;
pub use tls::load_tls_config;
