//! Config save/load roundtrip integration tests.
//!
//! These tests verify that configuration can be serialized, written to disk,
//! and loaded back with identical field values.

use chatmux_core::Config;
use std::path::Path;
use tempfile::TempDir;

#[test]
fn test_config_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");

    let config = Config::default();
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    // Defaults should survive the roundtrip
    assert_eq!(loaded.gateway.port, config.gateway.port);
    assert_eq!(loaded.gateway.bind, config.gateway.bind);
    assert_eq!(loaded.worker.program, config.worker.program);
    assert_eq!(loaded.worker.max, config.worker.max);
    assert_eq!(
        loaded.session.idle_timeout_secs,
        config.session.idle_timeout_secs
    );
}

#[test]
fn test_config_modify_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");

    let mut config = Config::default();
    config.gateway.port = 9090;
    config.worker.program = "agentd".to_string();
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.gateway.port, 9090);
    assert_eq!(loaded.worker.program, "agentd");
}

#[test]
fn test_config_load_nonexistent() {
    let result = Config::load(Path::new("/nonexistent/config.json"));
    assert!(result.is_err());
}

#[test]
fn test_config_parse_invalid() {
    let result = Config::parse("not valid json");
    assert!(result.is_err());
}

#[test]
fn test_config_parse_json_with_comments() {
    let config = Config::parse(
        r#"{
            // elastic ceiling
            "worker": { "max": 6 },
            "gateway": { "port": 9200 },
        }"#,
    )
    .unwrap();
    assert_eq!(config.worker.max, 6);
    assert_eq!(config.gateway.port, 9200);
}
