pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_name() -> String {
    "Knight".to_string()
}

pub(super) fn default_data_dir() -> String {
    "~/.knight".to_string()
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_session_prefix() -> String {
    "KnightBot".to_string()
}

pub(super) fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

pub(super) fn default_dns_timeout_ms() -> u64 {
    3000
}

pub(super) fn default_service_host() -> String {
    "web.whatsapp.com".to_string()
}

/// Last-resort address for the service host. May be stale.
pub(super) fn default_fallback_ip() -> String {
    "157.240.22.54".to_string()
}

pub(super) fn default_port() -> u16 {
    443
}

/// Local protocol bridge endpoint.
pub(super) fn default_bridge_url() -> String {
    "ws://127.0.0.1:8787/knight".to_string()
}

pub(super) fn default_retry_base_ms() -> u64 {
    2000
}

pub(super) fn default_retry_cap_ms() -> u64 {
    60_000
}

pub(super) fn default_connect_timeout() -> u64 {
    20
}

pub(super) fn default_keepalive_interval() -> u64 {
    30
}

pub(super) fn default_probe_timeout() -> u64 {
    10
}

pub(super) fn default_health_host() -> String {
    "0.0.0.0".to_string()
}

pub(super) fn default_health_port() -> u16 {
    7860
}

pub(super) fn default_command_prefix() -> String {
    ".".to_string()
}

pub(super) fn default_packname() -> String {
    "Knight Bot".to_string()
}

pub(super) fn default_author() -> String {
    "Knight".to_string()
}
