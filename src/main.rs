use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vless_relay::{
    ProxyAllowlist, RelayState, StreamType, TcpConnector, handle_connection, load_config,
    load_tls_config,
};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    info!(
        config_file = %args.config.display(),
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tls = config.listen.tls.is_some(),
        tunnel_path = %config.tunnel.path,
        override_host = ?config.tunnel.override_host,
        fallback_origin = ?config.tunnel.fallback_origin,
        "Configuration loaded"
    );

    let allowlist = ProxyAllowlist::parse(config.listen.allowed_proxy_ips.as_deref())?;
    let acceptor = config
        .listen
        .tls
        .as_ref()
        .map(load_tls_config)
        .transpose()?
        .map(|tls| TlsAcceptor::from(Arc::new(tls)));

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let connector = TcpConnector::new(config.tunnel.connect_timeout());
    let state = Arc::new(RelayState::new(config.tunnel, connector)?);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(listen_addr = %addr, "VLESS relay listening");

    tokio::select! {
        () = serve(listener, state, allowlist, acceptor) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
        }
    }

    Ok(())
}

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

async fn serve(
    listener: TcpListener,
    state: Arc<RelayState<TcpConnector>>,
    allowlist: ProxyAllowlist,
    acceptor: Option<TlsAcceptor>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        if !allowlist.allows(addr.ip()) {
            warn!(client_addr = %addr, "Rejecting connection from disallowed proxy IP");
            continue;
        }

        let state = state.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let stream = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => StreamType::from(TlsStream::Server(tls)),
                    Err(e) => {
                        debug!(client_addr = %addr, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => StreamType::from(stream),
            };

            if let Err(e) = handle_connection(stream, addr, state).await {
                error!(client_addr = %addr, error = %e, "Connection failed");
            }
        });
    }
}
