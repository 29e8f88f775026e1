use super::*;
use crate::ring::WaitStrategy;
use crate::transport::MessagingType;
use serial_test::serial;
use std::io::Write;

fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults() {
    let config = Config::default();

    assert_eq!(config.messaging.messaging_type, MessagingType::Memory);
    assert_eq!(config.messaging.request_topic, "request_topic");
    assert_eq!(config.server.consumer_threads, 1);
    assert_eq!(config.server.ring.size, 1024);
    assert_eq!(config.server.ring.wait_strategy, WaitStrategy::Blocking);
    assert_eq!(config.client.ping.timeout_ms, 3000);
    assert_eq!(config.client.ping.max_attempts, 10);
    assert_eq!(config.client.reply_topic_prefix, "response_topic_");
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_load_from_yaml_file() {
    let file = yaml_file(
        r#"
messaging:
  request_topic: device_requests
server:
  worker_threads: 8
  ring:
    size: 256
    wait_strategy: yielding
client:
  ping:
    timeout_ms: 500
"#,
    );

    let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();

    assert_eq!(config.messaging.request_topic, "device_requests");
    assert_eq!(config.server.worker_threads, 8);
    assert_eq!(config.server.ring.size, 256);
    assert_eq!(config.server.ring.wait_strategy, WaitStrategy::Yielding);
    assert_eq!(config.client.ping.timeout_ms, 500);
    assert_eq!(config.client.ping.max_attempts, 10);
}

#[test]
#[serial]
fn test_unknown_wait_strategy_falls_back_to_blocking() {
    let file = yaml_file("event_bus:\n  ring:\n    wait_strategy: lazy\n");

    let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();

    assert_eq!(config.event_bus.ring.wait_strategy, WaitStrategy::Blocking);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = yaml_file("server:\n  worker_threads: 8\n");
    std::env::set_var("HIVERELAY__SERVER__WORKER_THREADS", "16");

    let loaded = Config::load(Some(file.path().to_str().unwrap()));
    std::env::remove_var("HIVERELAY__SERVER__WORKER_THREADS");

    assert_eq!(loaded.unwrap().server.worker_threads, 16);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    let result = Config::load(Some("/nonexistent/hiverelay.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
fn test_validate_rejects_bad_ring_size() {
    let mut config = Config::default();
    config.delivery.ring.size = 1000;

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("delivery.ring.size"));
}

#[test]
fn test_validate_rejects_zero_threads() {
    let mut config = Config::default();
    config.server.worker_threads = 0;

    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_validate_rejects_zero_ping_attempts() {
    let mut config = Config::default();
    config.client.ping.max_attempts = 0;

    assert!(config.validate().is_err());
}
