//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format parsing from the `LOG_FORMAT` environment variable.

use qa_pipeline::observability::logging::LogFormat;

#[test]
fn test_log_format_parse_known_formats() {
    assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("PRETTY"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("Compact"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for input in ["invalid", "", "xml", "  pretty  ", "123"] {
        assert!(
            matches!(LogFormat::parse(input), LogFormat::Json),
            "{input:?} should fall back to json"
        );
    }
}

#[test]
fn test_log_format_is_copy() {
    let format = LogFormat::Pretty;
    let copied = format;
    assert!(matches!(format, LogFormat::Pretty));
    assert!(matches!(copied, LogFormat::Pretty));
    assert_eq!(format!("{copied:?}"), "Pretty");
}
