//! Tests for logging configuration and format parsing

use gatelink::observability::logging::{init_test_logging, LogFormat, LoggingConfig};
use tracing::Level;

#[test]
fn test_log_format_parse_known_values() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    assert_eq!(LogFormat::parse(""), LogFormat::Json);
    assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    assert_eq!(LogFormat::parse("123"), LogFormat::Json);
}

#[test]
fn test_default_config() {
    let config = LoggingConfig::default();
    assert_eq!(config.level, Level::INFO);
    assert_eq!(config.format, LogFormat::Json);
    assert!(!config.include_spans);
}

#[test]
fn test_init_test_logging_is_idempotent() {
    init_test_logging();
    init_test_logging();
    tracing::info!(component = "test", "Logging initialized twice without panicking");
}

#[test]
fn test_spans_accept_structured_fields() {
    init_test_logging();
    let generation = 3u64;
    let span = gatelink::connect_span!(client_id = "panel", generation);
    let _guard = span.enter();
    let command = gatelink::command_span!(command = "toggle", actor = "Anna");
    command.in_scope(|| tracing::debug!("inside command span"));
}
