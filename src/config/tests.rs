//! Config module tests

use std::time::Duration;

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("MQE_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${MQE_TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("MQE_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("MQE_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${MQE_TEST_VAR_UNSET:-default_value}\"").unwrap();
    assert_eq!(result, "value = \"default_value\"");

    std::env::set_var("MQE_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${MQE_TEST_VAR_SET:-default_value}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("MQE_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("MQE_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${MQE_TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("engine.toml");

    std::env::set_var("MQE_TEST_BIND_HOST", "127.0.0.1");

    let config_content = r#"
[server]
bind = "${MQE_TEST_BIND_HOST}:1885"
communication_timeout = "${MQE_TEST_TIMEOUT:-5s}"
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.server.bind, "127.0.0.1:1885");
    assert_eq!(config.server.communication_timeout, Duration::from_secs(5));

    std::env::remove_var("MQE_TEST_BIND_HOST");
}

#[test]
fn test_env_override() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("engine.toml");
    std::fs::write(&config_path, "[session]\nmax_pending_messages = 10\n").unwrap();

    std::env::set_var("MQTT_ENGINE__SESSION__MAX_PENDING_MESSAGES", "42");
    let config = Config::load(&config_path).unwrap();
    std::env::remove_var("MQTT_ENGINE__SESSION__MAX_PENDING_MESSAGES");

    assert_eq!(config.session.max_pending_messages, 42);
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.mqtt.max_qos, 2);
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.bind, "0.0.0.0:1883");
    assert_eq!(config.server.communication_timeout, Duration::from_secs(10));
    assert_eq!(config.server.max_retries, 3);
    assert_eq!(config.session.default_keep_alive, 60);
    assert_eq!(config.session.max_pending_messages, 250);
    assert_eq!(
        config.session.overflow_strategy,
        OverflowStrategy::DropNewMessage
    );
    assert_eq!(config.mqtt.max_qos, 2);
    assert!(config.session.persistent_sessions);
    assert!(!config.persistence.enabled);
    assert_eq!(config.persistence.backend, BackendType::Memory);
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:8883"
communication_timeout = "3s"
max_retries = 5

[server.tls]
cert = "/etc/engine/cert.pem"
key = "/etc/engine/key.pem"

[session]
default_keep_alive = 30
max_keep_alive = 120
persistent_sessions = false
max_pending_messages = 0
overflow_strategy = "drop_oldest_queued_message"
expiry_check_interval = "10s"
max_inflight = 16

[mqtt]
max_qos = 1
retain_available = false
max_topic_alias = 0

[persistence]
enabled = true
backend = "file"
path = "/var/lib/engine/state.snapshot"
flush_interval = "1s"
max_batch_size = 500
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.max_retries, 5);
    let tls = config.server.tls.as_ref().unwrap();
    assert_eq!(tls.cert, "/etc/engine/cert.pem");
    assert!(!tls.require_client_cert);
    assert_eq!(config.session.overflow_strategy, OverflowStrategy::DropOldestQueuedMessage);
    assert_eq!(config.persistence.backend, BackendType::File);
    assert_eq!(config.persistence.flush_interval, Duration::from_secs(1));

    let broker = config.broker_config();
    assert_eq!(broker.communication_timeout, Duration::from_secs(3));
    assert_eq!(broker.max_qos, QoS::AtLeastOnce);
    assert!(!broker.retain_available);
    assert!(!broker.persistent_sessions);
    assert_eq!(broker.max_pending_messages, 0);
    assert_eq!(broker.max_inflight, 16);
    assert_eq!(broker.max_topic_alias, 0);
    assert_eq!(broker.expiry_check_interval, Duration::from_secs(10));
    assert_eq!(broker.persistence_batch_size, 500);
}

#[test]
fn test_validation_rejects_bad_qos() {
    let err = Config::parse("[mqtt]\nmax_qos = 3\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_validation_rejects_zero_timeout() {
    let err = Config::parse("[server]\ncommunication_timeout = \"0s\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_validation_rejects_empty_tls_key() {
    let err = Config::parse("[server.tls]\ncert = \"cert.pem\"\nkey = \"\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_parse_error() {
    let err = Config::parse("[server\nbind = ").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_open_backend() {
    let disabled = PersistenceConfig::default();
    assert!(disabled.open_backend().unwrap().is_none());

    let dir = tempfile::tempdir().unwrap();
    let file = PersistenceConfig {
        enabled: true,
        backend: BackendType::File,
        path: dir.path().join("state.snapshot"),
        ..Default::default()
    };
    assert!(file.open_backend().unwrap().is_some());
}
