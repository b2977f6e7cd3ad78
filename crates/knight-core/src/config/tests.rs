use super::*;
use std::collections::HashMap;

#[test]
fn test_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.dns.servers, vec!["8.8.8.8", "1.1.1.1"]);
    assert_eq!(cfg.dns.service_host, "web.whatsapp.com");
    assert_eq!(cfg.dns.fallback_ip, "157.240.22.54");
    assert_eq!(cfg.connection.retry_base_ms, 2000);
    assert_eq!(cfg.connection.retry_cap_ms, 60_000);
    assert_eq!(cfg.health.port, 7860);
    assert_eq!(cfg.session.identity(), "default");
    assert!(!cfg.session.minimize_local_state);
    assert_eq!(cfg.connection.bridge_url, "ws://127.0.0.1:8787/knight");
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let toml_str = r#"
        [dns]
        servers = ["9.9.9.9"]

        [connection]
        retry_base_ms = 500
    "#;
    let cfg: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.dns.servers, vec!["9.9.9.9"]);
    assert_eq!(cfg.dns.timeout_ms, 3000);
    assert_eq!(cfg.connection.retry_base_ms, 500);
    assert_eq!(cfg.connection.retry_cap_ms, 60_000);
    assert_eq!(cfg.knight.log_level, "info");
}

#[test]
fn test_env_overrides() {
    let env: HashMap<&str, &str> = [
        ("SESSION_ID", "KnightBot-abc"),
        ("DNS_CONFIG", "/etc/knight/dns.toml"),
        ("MINIMIZE_LOCAL_STATE", "true"),
        ("KNIGHT_BRIDGE_URL", "wss://bridge.internal:9443/knight"),
    ]
    .into_iter()
    .collect();

    let mut cfg = Config::default();
    cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

    assert_eq!(cfg.session.id.as_deref(), Some("KnightBot-abc"));
    assert_eq!(cfg.session.identity(), "KnightBot-abc");
    assert_eq!(
        cfg.dns.config_file.as_deref(),
        Some("/etc/knight/dns.toml")
    );
    assert!(cfg.session.minimize_local_state);
    assert_eq!(cfg.connection.bridge_url, "wss://bridge.internal:9443/knight");
}

#[test]
fn test_blank_env_values_ignored() {
    let mut cfg = Config::default();
    cfg.session.id = Some("keep".to_string());
    cfg.apply_env_from(|k| match k {
        "SESSION_ID" => Some("   ".to_string()),
        "MINIMIZE_LOCAL_STATE" => Some("0".to_string()),
        _ => None,
    });
    assert_eq!(cfg.session.id.as_deref(), Some("keep"));
    assert!(!cfg.session.minimize_local_state);
}

#[test]
fn test_dns_file_overrides_servers() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("dns.toml");
    std::fs::write(&path, "servers = [\"208.67.222.222\"]\ntimeout_ms = 1500\n").unwrap();

    let mut cfg = Config::default();
    cfg.dns.config_file = Some(path.to_string_lossy().to_string());
    cfg.apply_dns_file();

    assert_eq!(cfg.dns.servers, vec!["208.67.222.222"]);
    assert_eq!(cfg.dns.timeout_ms, 1500);
}

#[test]
fn test_bad_dns_file_keeps_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("dns.toml");
    std::fs::write(&path, "servers = not-a-list").unwrap();

    let mut cfg = Config::default();
    cfg.dns.config_file = Some(path.to_string_lossy().to_string());
    cfg.apply_dns_file();

    assert_eq!(cfg.dns.servers, vec!["8.8.8.8", "1.1.1.1"]);
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let cfg = load("/nonexistent/knight/config.toml").unwrap();
    assert_eq!(cfg.knight.name, "Knight");
}

#[test]
fn test_load_invalid_toml_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[knight\nname = ").unwrap();
    let err = load(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, KnightError::Config(_)));
}

#[test]
fn test_session_id_alphabet() {
    assert!(is_valid_session_id("KnightBot-abc_01"));
    assert!(!is_valid_session_id("KnightBot.main"));
    assert!(!is_valid_session_id("../escape"));
    assert!(!is_valid_session_id(""));
    assert!(!is_valid_session_id(&"a".repeat(MAX_SESSION_ID_LEN + 1)));
}

#[test]
fn test_invalid_env_session_id_fails_validation() {
    let mut cfg = Config::default();
    cfg.apply_env_from(|k| (k == "SESSION_ID").then(|| "KnightBot.main".to_string()));
    let err = cfg.validate().unwrap_err();
    assert!(matches!(err, KnightError::Config(ref m) if m.contains("KnightBot.main")));
}

#[test]
fn test_load_rejects_unusable_session_id() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[session]\nid = \"KnightBot.main\"\n").unwrap();
    let err = load(path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, KnightError::Config(_)));

    std::fs::write(&path, "[session]\nprefix = \"Knight Bot\"\n").unwrap();
    assert!(load(path.to_str().unwrap()).is_err());
}

#[test]
fn test_bridge_url_needs_websocket_scheme() {
    let mut cfg = Config::default();
    cfg.connection.bridge_url = "http://127.0.0.1:8787".to_string();
    assert!(matches!(cfg.validate(), Err(KnightError::Config(_))));
}

#[test]
fn test_paths_derive_from_data_dir() {
    let mut cfg = Config::default();
    cfg.knight.data_dir = "/var/lib/knight".to_string();
    assert_eq!(cfg.sessions_dir(), PathBuf::from("/var/lib/knight/sessions"));
    assert_eq!(
        cfg.key_file(),
        PathBuf::from("/var/lib/knight/secrets/credential.key")
    );

    cfg.session.key_file = Some("/run/secrets/knight.key".to_string());
    assert_eq!(cfg.key_file(), PathBuf::from("/run/secrets/knight.key"));
}

#[test]
fn test_shellexpand_without_tilde() {
    assert_eq!(shellexpand("/tmp/knight"), "/tmp/knight");
}
