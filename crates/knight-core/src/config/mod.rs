mod defaults;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::KnightError;
use defaults::*;

/// Top-level Knight configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub knight: KnightConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub bot: BotConfig,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnightConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for KnightConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Session identity and credential storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session identifier reused across restarts. Env: `SESSION_ID`.
    #[serde(default)]
    pub id: Option<String>,
    /// Prefix for generated session identifiers.
    #[serde(default = "default_session_prefix")]
    pub prefix: String,
    /// Skip credential backups. Env: `MINIMIZE_LOCAL_STATE`.
    #[serde(default)]
    pub minimize_local_state: bool,
    /// Credential encryption key file. Defaults to `{data_dir}/secrets/credential.key`.
    #[serde(default)]
    pub key_file: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: None,
            prefix: default_session_prefix(),
            minimize_local_state: false,
            key_file: None,
        }
    }
}

impl SessionConfig {
    /// Identity the credential store files are keyed by.
    ///
    /// Without a configured id the bot keeps a single `default` identity so
    /// a restart still finds its credentials.
    pub fn identity(&self) -> &str {
        self.id.as_deref().unwrap_or("default")
    }

    /// Reject ids the credential store could not use as file names.
    pub fn validate(&self) -> Result<(), KnightError> {
        if let Some(ref id) = self.id {
            if !is_valid_session_id(id) {
                return Err(KnightError::Config(format!(
                    "session id '{id}' may only contain letters, digits, '-' and '_' (max {MAX_SESSION_ID_LEN})"
                )));
            }
        }
        if !is_valid_session_id(&self.prefix) {
            return Err(KnightError::Config(format!(
                "session prefix '{}' may only contain letters, digits, '-' and '_'",
                self.prefix
            )));
        }
        Ok(())
    }
}

/// Longest accepted session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Session ids become file names, so they are kept to `[A-Za-z0-9_-]`.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Name resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Resolver endpoints, tried in order.
    #[serde(default = "default_dns_servers")]
    pub servers: Vec<String>,
    #[serde(default = "default_dns_timeout_ms")]
    pub timeout_ms: u64,
    /// Hostname of the remote service.
    #[serde(default = "default_service_host")]
    pub service_host: String,
    /// Literal returned for `service_host` when every resolver fails.
    #[serde(default = "default_fallback_ip")]
    pub fallback_ip: String,
    /// Optional DNS-config file overriding `servers`. Env: `DNS_CONFIG`.
    #[serde(default)]
    pub config_file: Option<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: default_dns_servers(),
            timeout_ms: default_dns_timeout_ms(),
            service_host: default_service_host(),
            fallback_ip: default_fallback_ip(),
            config_file: None,
        }
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Contents of a custom DNS-config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsFile {
    pub servers: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Transport, retry, and liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// WebSocket URL of the protocol bridge. Env: `KNIGHT_BRIDGE_URL`.
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// Give up after this many consecutive retries (0 = never).
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bridge_url: default_bridge_url(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            max_retries: 0,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Health-check HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_host")]
    pub host: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_health_host(),
            port: default_health_port(),
        }
    }
}

/// Chat command settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_command_prefix")]
    pub prefix: String,
    /// Sticker pack name written into sticker metadata.
    #[serde(default = "default_packname")]
    pub packname: String,
    /// Sticker pack publisher written into sticker metadata.
    #[serde(default = "default_author")]
    pub author: String,
    /// Extra words and phrases for the bad-word filter, on top of the built-in list.
    #[serde(default)]
    pub bad_words: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            prefix: default_command_prefix(),
            packname: default_packname(),
            author: default_author(),
            bad_words: Vec::new(),
        }
    }
}

impl Config {
    /// Expanded data directory.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand(&self.knight.data_dir))
    }

    /// Directory holding credential blobs and sidecars.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir().join("sessions")
    }

    /// Persisted group moderation settings.
    pub fn moderation_file(&self) -> PathBuf {
        self.data_dir().join("antibadword.json")
    }

    /// Credential key file, kept apart from the blobs it protects.
    pub fn key_file(&self) -> PathBuf {
        match self.session.key_file {
            Some(ref path) => PathBuf::from(shellexpand(path)),
            None => self.data_dir().join("secrets").join("credential.key"),
        }
    }

    /// Apply environment overrides using the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides from an arbitrary lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("SESSION_ID").filter(|v| !v.trim().is_empty()) {
            self.session.id = Some(id.trim().to_string());
        }
        if let Some(path) = lookup("DNS_CONFIG").filter(|v| !v.trim().is_empty()) {
            self.dns.config_file = Some(path.trim().to_string());
        }
        if let Some(flag) = lookup("MINIMIZE_LOCAL_STATE") {
            self.session.minimize_local_state = is_truthy(&flag);
        }
        if let Some(url) = lookup("KNIGHT_BRIDGE_URL").filter(|v| !v.trim().is_empty()) {
            self.connection.bridge_url = url.trim().to_string();
        }
    }

    /// Check values that would otherwise only fail deep inside a session.
    pub fn validate(&self) -> Result<(), KnightError> {
        self.session.validate()?;
        let url = self.connection.bridge_url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(KnightError::Config(format!(
                "connection.bridge_url must be a ws:// or wss:// URL, got '{url}'"
            )));
        }
        Ok(())
    }

    /// Merge the custom DNS-config file, if one is configured.
    ///
    /// A missing or malformed file is logged and ignored; the built-in
    /// resolver list still works.
    pub fn apply_dns_file(&mut self) {
        let Some(ref path) = self.dns.config_file else {
            return;
        };
        let path = shellexpand(path);
        match load_dns_file(&path) {
            Ok(file) => {
                if file.servers.is_empty() {
                    warn!("dns config {path} lists no servers, keeping defaults");
                } else {
                    info!("dns: using {} resolvers from {path}", file.servers.len());
                    self.dns.servers = file.servers;
                }
                if let Some(ms) = file.timeout_ms {
                    self.dns.timeout_ms = ms;
                }
            }
            Err(e) => warn!("dns config ignored: {e}"),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Read a DNS-config TOML file.
pub fn load_dns_file(path: &str) -> Result<DnsFile, KnightError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| KnightError::Config(format!("failed to read {path}: {e}")))?;
    toml::from_str(&content)
        .map_err(|e| KnightError::Config(format!("failed to parse {path}: {e}")))
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist. Environment overrides
/// and the DNS-config file are applied on top, then the result is validated.
pub fn load(path: &str) -> Result<Config, KnightError> {
    let file = Path::new(path);
    let mut config = if !file.exists() {
        info!("Config file not found at {}, using defaults", file.display());
        Config::default()
    } else {
        let content = std::fs::read_to_string(file).map_err(|e| {
            KnightError::Config(format!("failed to read {}: {}", file.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| KnightError::Config(format!("failed to parse config: {}", e)))?
    };

    config.apply_env();
    config.apply_dns_file();
    config.validate()?;
    Ok(config)
}
