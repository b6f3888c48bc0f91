//! Client configuration.
//!
//! Settings come from a JSON file (`~/.peerlink/config.json` by default),
//! overlaid with `PEERLINK_*` environment variables, overlaid with command
//! line flags. Only the token is required.

use std::path::{Path, PathBuf};
use std::time::Duration;

use peerlink_net::{Credential, RelayEndpoint, WsDialer};

use crate::{Error, Result};

pub const DEFAULT_REGION: &str = "eu-central";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

pub const ENV_TOKEN: &str = "PEERLINK_TOKEN";
pub const ENV_TOKEN_FILE: &str = "PEERLINK_TOKEN_FILE";
pub const ENV_REGION: &str = "PEERLINK_REGION";
pub const ENV_RELAY_URL: &str = "PEERLINK_RELAY_URL";
pub const ENV_INSECURE: &str = "PEERLINK_INSECURE";

#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay access token, sent as a bearer credential.
    pub token: String,
    /// File holding the token, used when `token` is empty.
    pub token_file: Option<PathBuf>,
    pub region: String,
    pub relay_domain: String,
    /// Full relay URL; overrides `region` and `relay_domain`.
    pub relay_url: Option<String>,
    pub connect_timeout_secs: u64,
    pub insecure_skip_verify: bool,
    /// Local ports inbound tunnels may reach. Empty means any port.
    pub allowed_ports: Vec<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            token_file: None,
            region: DEFAULT_REGION.to_string(),
            relay_domain: peerlink_net::DEFAULT_RELAY_DOMAIN.to_string(),
            relay_url: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            insecure_skip_verify: false,
            allowed_ports: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("token", &"<redacted>")
            .field("token_file", &self.token_file)
            .field("region", &self.region)
            .field("relay_domain", &self.relay_domain)
            .field("relay_url", &self.relay_url)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("allowed_ports", &self.allowed_ports)
            .finish()
    }
}

impl Config {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    /// `~/.peerlink/config.json`
    pub fn default_path() -> Option<PathBuf> {
        let home_dir = directories::UserDirs::new()?.home_dir().to_path_buf();
        Some(home_dir.join(".peerlink").join("config.json"))
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Overlay values from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`, which maps a variable name to its value.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(token) = lookup(ENV_TOKEN).filter(|t| !t.is_empty()) {
            self.token = token;
        }
        if let Some(path) = lookup(ENV_TOKEN_FILE).filter(|p| !p.is_empty()) {
            self.token_file = Some(PathBuf::from(path));
        }
        if let Some(region) = lookup(ENV_REGION).filter(|r| !r.is_empty()) {
            self.region = region;
        }
        if let Some(url) = lookup(ENV_RELAY_URL).filter(|u| !u.is_empty()) {
            self.relay_url = Some(url);
        }
        if let Some(insecure) = lookup(ENV_INSECURE) {
            self.insecure_skip_verify = parse_flag(&insecure);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() && self.token_file.is_none() {
            return Err(Error::Config(format!(
                "a relay token is required (set {ENV_TOKEN} or {ENV_TOKEN_FILE})"
            )));
        }
        if self.relay_url.is_none() && self.region.trim().is_empty() {
            return Err(Error::Config("region must not be empty".to_string()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::Config("connect timeout must be positive".to_string()));
        }
        if let Some(url) = &self.relay_url
            && !(url.starts_with("ws://") || url.starts_with("wss://"))
        {
            return Err(Error::Config(format!(
                "relay URL must use ws:// or wss://, got {url}"
            )));
        }
        if self.allowed_ports.contains(&0) {
            return Err(Error::Config("allowed ports must be in 1..=65535".to_string()));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> RelayEndpoint {
        match &self.relay_url {
            Some(url) => RelayEndpoint::from_url(url.clone()),
            None => RelayEndpoint::for_region(&self.region, &self.relay_domain),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Whether inbound tunnels may reach local `port`.
    pub fn port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.is_empty() || self.allowed_ports.contains(&port)
    }

    pub async fn credential(&self) -> Result<Credential> {
        let credential = if !self.token.trim().is_empty() {
            Credential::new(self.token.clone())
        } else if let Some(path) = &self.token_file {
            Credential::read_from_file(path).await
        } else {
            Credential::new("")
        };
        credential.map_err(|e| Error::Config(e.to_string()))
    }

    /// Build the websocket dialer for the configured relay.
    pub async fn dialer(&self) -> Result<WsDialer> {
        self.validate()?;
        let credential = self.credential().await?;
        WsDialer::new(
            self.endpoint(),
            credential,
            self.insecure_skip_verify,
            self.connect_timeout(),
        )
        .map_err(|e| Error::Config(e.to_string()))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
