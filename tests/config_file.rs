use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};
use zbcam::config::Config;

#[tokio::test]
async fn default_file_round_trips() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    let path = path.to_str().expect("utf8 path");

    assert_ok!(Config::create_default(path).await);
    let text = std::fs::read_to_string(path).expect("read back");
    assert!(text.contains("[radio]"));
    assert!(text.contains("[transfer]"));

    let config = assert_ok!(Config::load(path).await);
    assert_ok!(config.validate());
    assert_eq!(config.radio.baud_rate, 115200);
    assert_eq!(config.transfer.ring_capacity, 24);
    assert_eq!(config.queues.commands, 8);
}

#[tokio::test]
async fn hand_written_file_overrides_defaults() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("camera.toml");
    std::fs::write(
        &path,
        r#"
[radio]
port = "/dev/ttyS1"
peer_address = "0013A20040A1B2C3"

[transfer]
chunk_timeout_ms = 400
fast_retransmit = false

[capture]
source = "/var/lib/zbcam/latest.jpg"
interval_secs = 120

[logging]
level = "debug"
"#,
    )
    .expect("write config");

    let config = assert_ok!(Config::load(path.to_str().expect("utf8 path")).await);
    assert_ok!(config.validate());
    assert_eq!(assert_ok!(config.peer_address()), 0x0013A20040A1B2C3);
    let engine = config.transfer.engine();
    assert_eq!(engine.chunk_timeout.as_millis(), 400);
    assert!(!engine.fast_retransmit);
    assert_eq!(config.capture.interval_secs, 120);
    assert_eq!(config.logging.level, "debug");
}

#[tokio::test]
async fn unreadable_and_malformed_files_are_reported() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("nope.toml");
    let err = assert_err!(Config::load(missing.to_str().expect("utf8 path")).await);
    assert!(err.to_string().contains("Failed to read config file"));

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[radio\nport = 3").expect("write");
    let err = assert_err!(Config::load(bad.to_str().expect("utf8 path")).await);
    assert!(err.to_string().contains("Failed to parse config file"));
}
