//! Plain-text configuration page with the share link for this node.

use hyper::http::uri::Authority;

use crate::config::TunnelConfig;

/// Renders the page for a request that arrived with `host` as its Host header.
#[must_use]
pub fn render_config_page(tunnel: &TunnelConfig, host: &str, tls: bool) -> String {
    let default_port = if tls { 443 } else { 80 };
    let (hostname, port) = match host.parse::<Authority>() {
        Ok(authority) => (
            authority.host().to_string(),
            authority.port_u16().unwrap_or(default_port),
        ),
        Err(_) => (host.to_string(), default_port),
    };

    let uuid = tunnel.uuid.hyphenated();
    let security = if tls { "tls" } else { "none" };
    let path = urlencoding::encode(&tunnel.path);
    let sni = if tls {
        format!("&sni={hostname}")
    } else {
        String::new()
    };
    let link = format!(
        "vless://{uuid}@{hostname}:{port}?encryption=none&security={security}{sni}&type=ws&host={hostname}&path={path}#{hostname}"
    );

    format!(
        "VLESS over WebSocket\n\
         \n\
         address: {hostname}\n\
         port: {port}\n\
         uuid: {uuid}\n\
         network: ws\n\
         path: {tunnel_path}\n\
         security: {security}\n\
         \n\
         {link}\n",
        tunnel_path = tunnel.path,
    )
}
