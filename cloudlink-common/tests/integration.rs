//! Integration tests for cloudlink-common library.

use serde::Deserialize;
use std::time::Duration;

use cloudlink_common::{
    Backoff, BridgeConfig, Error, ErrorKey, ErrorThrottle, LinkState, LoggingConfig,
    OutboundEnvelope, RegisterFrame, decode_command,
};

#[derive(Debug, Deserialize)]
struct SiteConfig {
    #[serde(default)]
    logging: LoggingConfig,
    url: String,
    backoff: Backoff,
}

impl BridgeConfig for SiteConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> cloudlink_common::Result<()> {
        if !self.url.starts_with("ws") {
            return Err(Error::validation(format!("unsupported url '{}'", self.url)));
        }
        Ok(())
    }
}

#[test]
fn test_load_config_from_file() {
    let path = std::env::temp_dir().join(format!("cloudlink-common-{}.json5", std::process::id()));
    std::fs::write(
        &path,
        r#"{
            // comments are allowed in JSON5
            url: "ws://127.0.0.1:9000",
            backoff: { initial: { secs: 1, nanos: 0 }, factor: 2, max: { secs: 8, nanos: 0 } },
            logging: { level: "warn" },
        }"#,
    )
    .expect("write temp config");

    let config = SiteConfig::load(&path).expect("load config");
    std::fs::remove_file(&path).ok();

    assert_eq!(config.url, "ws://127.0.0.1:9000");
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.backoff.delay(3), Duration::from_secs(8));
}

#[test]
fn test_validation_rejects_bad_url() {
    let result = SiteConfig::parse(
        r#"{
            url: "http://example.com",
            backoff: {
                initial: { secs: 1, nanos: 0 },
                factor: 1,
                max: { secs: 1, nanos: 0 },
            },
        }"#,
    );
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[test]
fn test_telemetry_and_command_workflow() {
    // What a bridge produces for one poll
    let frame = RegisterFrame::new(vec![230, 50, 1]);
    let text = OutboundEnvelope::update(frame).to_text().expect("encode");
    assert_eq!(text, r#"{"action":"update","data":[230,50,1]}"#);

    // What the cloud may send back
    let command = decode_command(r#"{"action":"set","register":3,"value":7}"#).expect("decode");
    assert_eq!(command.len(), 3);
}

#[test]
fn test_sustained_fault_logs_once_per_window() {
    let mut throttle = ErrorThrottle::new(Duration::from_secs(60));
    let emitted = (0..100)
        .filter(|_| throttle.should_emit(ErrorKey::TransportBroken))
        .count();

    assert_eq!(emitted, 1);
    assert_eq!(throttle.occurrences(ErrorKey::TransportBroken), 100);
}

#[test]
fn test_link_state_cycle() {
    let cycle = [
        LinkState::Disconnected,
        LinkState::Connecting,
        LinkState::Connected,
        LinkState::Disconnected,
    ];
    assert!(cycle.windows(2).all(|w| w[0].can_transition_to(w[1])));
}
