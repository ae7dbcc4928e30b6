use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use uuid::Uuid;

use crate::protocol::SECRET_LEN;

#[derive(Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
}

#[derive(Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Values every tunnel session reads. Immutable once loaded.
#[derive(Clone, Debug, Deserialize)]
pub struct TunnelConfig {
    pub uuid: Uuid,
    #[serde(default = "default_path")]
    pub path: String,
    pub override_host: Option<String>,
    pub fallback_origin: Option<String>,
    #[serde(default = "default_true")]
    pub config_page: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
}

fn default_path() -> String {
    "/".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

impl TunnelConfig {
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            path: default_path(),
            override_host: None,
            fallback_origin: None,
            config_page: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: None,
        }
    }

    #[must_use]
    pub const fn secret(&self) -> &[u8; SECRET_LEN] {
        self.uuid.as_bytes()
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Path the configuration page is served on.
    #[must_use]
    pub fn config_page_path(&self) -> String {
        format!("/{}", self.uuid.hyphenated())
    }

    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            bail!("tunnel.path must start with '/', got {:?}", self.path);
        }
        if self.config_page && self.path == self.config_page_path() {
            bail!("tunnel.path must not be the configuration page path");
        }
        if self.override_host.as_deref().is_some_and(str::is_empty) {
            bail!("tunnel.override_host must not be empty");
        }
        if self.connect_timeout_secs == 0 {
            bail!("tunnel.connect_timeout_secs must be greater than zero");
        }
        if self.idle_timeout_secs == Some(0) {
            bail!("tunnel.idle_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse {} as valid config", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Invalid TOML")?;
    config.tunnel.validate()?;
    Ok(config)
}
