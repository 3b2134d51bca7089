//! Coverage for config parsing, path resolution and env overrides.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use attguard::config::AttguardConfig;
use attguard::ports::PortRange;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_match_the_documented_values() {
    let config = AttguardConfig::default();
    assert_eq!(config.server.socket_path, PathBuf::from("/var/run/attguard.sock"));
    assert_eq!(config.server.socket_mode, 0o666);
    assert_eq!(config.server.max_frame_bytes, 16_777_216);
    assert_eq!(config.policy.url, "http://127.0.0.1:7777/");
    assert_eq!(config.policy.request_timeout_secs, 0);
    assert_eq!(config.identity.ip, Ipv4Addr::LOCALHOST);
    assert_eq!(config.ports.range(), Some(PortRange { lo: 20000, hi: 40000 }));
    assert_eq!(config.persistence.flush_interval(), Duration::from_secs(30));
    assert_eq!(config.logging.level, "info");
    assert!(config.logging.dir.is_none());
}

#[test]
fn partial_file_keeps_defaults_elsewhere() {
    let toml_str = r#"
[policy]
url = "http://policy.internal:9000/"
attest_identity = "checker"

[ports]
local_lo = 41000
local_hi = 42000
"#;
    let config = match AttguardConfig::from_toml(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("partial config should parse: {err}"),
    };
    assert_eq!(config.policy.url, "http://policy.internal:9000/");
    assert_eq!(config.policy.attest_identity, "checker");
    assert_eq!(config.policy.iaas_identity, "iaas");
    assert_eq!(config.ports.range(), Some(PortRange { lo: 41000, hi: 42000 }));
    assert_eq!(config.server.max_connections, 256);
}

#[test]
fn empty_port_range_is_reported_as_none() {
    let config = match AttguardConfig::from_toml("[ports]\nlocal_lo = 500\nlocal_hi = 500\n") {
        Ok(config) => config,
        Err(err) => panic!("config should parse: {err}"),
    };
    assert_eq!(config.ports.range(), None);
}

#[test]
fn invalid_toml_is_an_error() {
    assert!(AttguardConfig::from_toml("[server\nsocket_path = 1").is_err());
    assert!(AttguardConfig::from_toml("[server]\nsocket_mode = \"rw\"").is_err());
}

#[test]
fn path_prefers_cli_then_env_then_cwd() {
    let cli = Path::new("/etc/attguard/custom.toml");
    let with_env = env(&[("ATTGUARD_CONFIG_PATH", "/srv/attguard.toml")]);

    assert_eq!(AttguardConfig::config_path_with(Some(cli), &with_env), cli);
    assert_eq!(
        AttguardConfig::config_path_with(None, &with_env),
        PathBuf::from("/srv/attguard.toml")
    );
    assert_eq!(
        AttguardConfig::config_path_with(None, env(&[])),
        PathBuf::from("attguard.toml")
    );
}

#[test]
fn env_overrides_file_values() {
    let mut config = AttguardConfig::default();
    config.apply_overrides(env(&[
        ("ATTGUARD_SOCKET", "/tmp/a.sock"),
        ("ATTGUARD_POLICY_URL", "http://10.0.0.1:7777/"),
        ("ATTGUARD_SPEAKER", "node-7"),
        ("ATTGUARD_IP", "10.0.0.7"),
        ("ATTGUARD_SNAPSHOT", "/tmp/state.json"),
        ("ATTGUARD_FLUSH_SECS", "5"),
        ("ATTGUARD_LOG_LEVEL", "debug"),
        ("ATTGUARD_LOG_DIR", "/tmp/logs"),
    ]));

    assert_eq!(config.server.socket_path, PathBuf::from("/tmp/a.sock"));
    assert_eq!(config.policy.url, "http://10.0.0.1:7777/");
    assert_eq!(config.identity.speaker, "node-7");
    assert_eq!(config.identity.ip, Ipv4Addr::new(10, 0, 0, 7));
    assert_eq!(config.persistence.snapshot_path, PathBuf::from("/tmp/state.json"));
    assert_eq!(config.persistence.flush_interval(), Duration::from_secs(5));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.dir, Some(PathBuf::from("/tmp/logs")));
}

#[test]
fn invalid_env_values_are_ignored() {
    let mut config = AttguardConfig::default();
    config.apply_overrides(env(&[
        ("ATTGUARD_IP", "not-an-ip"),
        ("ATTGUARD_FLUSH_SECS", "0"),
    ]));
    assert_eq!(config.identity.ip, Ipv4Addr::LOCALHOST);
    assert_eq!(config.persistence.flush_interval_secs, 30);
}

#[test]
fn missing_file_loads_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");
    let config = match AttguardConfig::load(Some(&path)) {
        Ok(config) => config,
        Err(err) => panic!("missing file should fall back to defaults: {err}"),
    };
    assert_eq!(config.ports.local_hi, 40000);
}

#[test]
fn rendered_config_parses_back() {
    let config = AttguardConfig::default();
    let rendered = match toml::to_string_pretty(&config) {
        Ok(text) => text,
        Err(err) => panic!("config should render: {err}"),
    };
    let parsed = match AttguardConfig::from_toml(&rendered) {
        Ok(config) => config,
        Err(err) => panic!("rendered config should parse: {err}"),
    };
    assert_eq!(parsed.server.socket_path, config.server.socket_path);
    assert_eq!(parsed.identity.speaker, config.identity.speaker);
}
