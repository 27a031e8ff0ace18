//! Observability for the QA pipeline
//!
//! Structured logging, process-wide metrics and the HTTP health endpoints.

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::HealthServer;
pub use logging::{init_logging, LogFormat, LogSettings};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{import_span, mq_span, stage_span};
