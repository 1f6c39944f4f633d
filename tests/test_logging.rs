//! Tests for logging configuration and error-message sanitization
//!
//! Tests the pure functions that decide log format and level, and the
//! redaction applied to broker errors before they are logged.

use sensor_relay::error::sanitize_error_message;
use sensor_relay::observability::logging::{parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_whitespace() {
    assert_eq!(LogFormat::parse("  pretty  "), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("compact\n"), LogFormat::Compact);
    assert_eq!(LogFormat::parse("\tjson"), LogFormat::Json);
}

#[test]
fn test_log_format_unknown_defaults_to_json() {
    for input in ["", "xml", "123", "logfmt"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input:?}");
    }
}

#[test]
fn test_level_parsing_defaults_to_info() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level(" WARN "), Level::WARN);
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("TRACE"), Level::TRACE);
    assert_eq!(parse_level(""), Level::INFO);
    assert_eq!(parse_level("loud"), Level::INFO);
}

#[test]
fn test_broker_credentials_never_logged() {
    let message = "Connection refused: bad user name or password=s3cr3t for token: abc.def";
    let sanitized = sanitize_error_message(message);

    assert!(!sanitized.contains("s3cr3t"));
    assert!(!sanitized.contains("abc.def"));
    assert!(sanitized.starts_with("Connection refused"));
}

#[test]
fn test_plain_messages_pass_through() {
    let message = "I/O error: Connection refused (os error 111)";
    assert_eq!(sanitize_error_message(message), message);
}
