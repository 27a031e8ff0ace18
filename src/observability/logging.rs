//! Structured logging using the tracing crate
//!
//! Every stage, import run and queue delivery runs inside a span so log lines
//! carry `stage`, `topic`, `message_id` and `data_id` fields.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE, defaults to INFO
//! - `LOG_FORMAT`: `json`, `pretty` or `compact`, defaults to json
//! - `LOG_SPANS`: `true` to log span open/close events
//! - `RUST_LOG`: replaces the computed filter entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./qa-pipeline run
//! LOG_FORMAT=json ./qa-pipeline import --start 2024-06-01T00:00:00Z --end 2024-06-02T00:00:00Z
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies logged at WARN regardless of the configured level
const QUIET_TARGETS: [&str; 5] = ["rumqttc", "hyper", "reqwest", "warp", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line, colored
    Pretty,
    /// Single-line, colored, no targets
    Compact,
}

impl LogFormat {
    /// Parse log format from string; anything unrecognized is JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG` directives, used verbatim when present
    pub directives: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
            directives: None,
        }
    }
}

impl LogSettings {
    /// Read `LOG_LEVEL`, `LOG_FORMAT`, `LOG_SPANS` and `RUST_LOG`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            level: lookup("LOG_LEVEL")
                .and_then(|value| parse_level(&value))
                .unwrap_or(defaults.level),
            format: lookup("LOG_FORMAT")
                .map(|value| LogFormat::parse(&value))
                .unwrap_or(defaults.format),
            include_spans: lookup("LOG_SPANS")
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.include_spans),
            directives: lookup("RUST_LOG").filter(|value| !value.trim().is_empty()),
        }
    }

    /// Raise the level by one step per `-v`, never lowering it
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        let raised = match verbose {
            0 => return self,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        // tracing orders levels by verbosity: TRACE > DEBUG > INFO
        if raised > self.level {
            self.level = raised;
        }
        self
    }

    fn filter(&self) -> EnvFilter {
        if let Some(directives) = &self.directives {
            return EnvFilter::new(directives);
        }
        QUIET_TARGETS
            .iter()
            .fold(EnvFilter::new(self.level.to_string()), |filter, target| {
                filter.add_directive(format!("{target}=warn").parse().unwrap())
            })
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

fn parse_level(value: &str) -> Option<Level> {
    match value.trim().to_uppercase().as_str() {
        "ERROR" => Some(Level::ERROR),
        "WARN" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber
pub fn init_logging(settings: &LogSettings) {
    let subscriber = tracing_subscriber::registry().with(settings.filter());
    let span_events = settings.span_events();

    match settings.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(span_events))
            .init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .init(),
    }
}

/// Create a span for one stage processing one message
#[macro_export]
macro_rules! stage_span {
    ($($field:tt)*) => {
        tracing::info_span!("stage_processing", $($field)*)
    };
}

/// Create a span for a batch import run
#[macro_export]
macro_rules! import_span {
    ($($field:tt)*) => {
        tracing::info_span!("batch_import", $($field)*)
    };
}

/// Create a message queue delivery span
#[macro_export]
macro_rules! mq_span {
    ($($field:tt)*) => {
        tracing::info_span!("mq_delivery", $($field)*)
    };
}

pub use {import_span, mq_span, stage_span};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        assert_eq!(settings(&[]), LogSettings::default());
    }

    #[test]
    fn test_env_values_are_read() {
        let s = settings(&[
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "Compact"),
            ("LOG_SPANS", "TRUE"),
        ]);
        assert_eq!(s.level, Level::DEBUG);
        assert_eq!(s.format, LogFormat::Compact);
        assert!(s.include_spans);
        assert_eq!(s.directives, None);
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let s = settings(&[("LOG_LEVEL", "loud"), ("LOG_SPANS", "yes"), ("RUST_LOG", " ")]);
        assert_eq!(s.level, Level::INFO);
        assert!(!s.include_spans);
        assert_eq!(s.directives, None);
    }

    #[test]
    fn test_verbosity_only_raises() {
        let base = settings(&[("LOG_LEVEL", "WARN")]);
        assert_eq!(base.clone().with_verbosity(0).level, Level::WARN);
        assert_eq!(base.clone().with_verbosity(1).level, Level::DEBUG);
        assert_eq!(base.with_verbosity(3).level, Level::TRACE);

        let tracing = settings(&[("LOG_LEVEL", "TRACE")]);
        assert_eq!(tracing.with_verbosity(1).level, Level::TRACE);
    }

    #[test]
    fn test_filter_quiets_dependencies() {
        let filter = settings(&[]).filter().to_string();
        for target in QUIET_TARGETS {
            assert!(filter.contains(&format!("{target}=warn")), "{filter}");
        }

        let overridden = settings(&[("RUST_LOG", "qa_pipeline=trace")]).filter().to_string();
        assert!(overridden.contains("qa_pipeline=trace"));
        assert!(!overridden.contains("rumqttc"));
    }
}
