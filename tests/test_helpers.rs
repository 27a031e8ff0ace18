//! Test helpers and utilities for integration tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use qa_pipeline::config::PipelineConfig;
use qa_pipeline::model::{Category, QAUnit, UnitDraft};
use qa_pipeline::mq::memory::MemoryQueue;
use qa_pipeline::mq::MessageQueue;
use qa_pipeline::trace::{CallRecord, CallState, RootRecord, TimeWindow};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config() -> PipelineConfig {
    PipelineConfig::from_toml_str(
        r#"
[mq]
backend = "memory"
max_retries = 2
retry_backoff_ms = [1, 1]
poll_interval_ms = 5

[dispatcher]
annotators = ["alice", "bob"]
expire_hours = 24

[review]
max_retry_count = 2

[runtime]
instance_id = "test-pipeline"
batch_size = 4
instances_per_stage = 2
shutdown_timeout_secs = 5
health_port = 0
"#,
    )
    .expect("test config should parse")
}

/// Connected in-memory queue built from the test config
#[allow(dead_code)]
pub async fn memory_queue() -> Arc<MemoryQueue> {
    let queue = Arc::new(MemoryQueue::new(test_config().mq));
    queue.connect().await.unwrap();
    queue
}

#[allow(dead_code)]
pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, minute, 0).unwrap()
}

/// The hour starting at `at(0)`
#[allow(dead_code)]
pub fn window() -> TimeWindow {
    TimeWindow::new(at(0), at(0) + Duration::hours(1)).unwrap()
}

#[allow(dead_code)]
pub fn root_record(trace: &str, minute: u32) -> RootRecord {
    RootRecord {
        trace_id: trace.to_string(),
        request_id: format!("{trace}-root"),
        group_id: "session-1".to_string(),
        callee: "master_agent".to_string(),
        input: json!({"query": format!("What happened in {trace}?")}),
        output: json!(format!("Here is the full account of {trace}.")),
        created_at: at(minute),
    }
}

#[allow(dead_code)]
pub fn call_record(trace: &str, callee: &str, category: Category, minute: u32) -> CallRecord {
    CallRecord {
        trace_id: trace.to_string(),
        request_id: format!("{trace}-{callee}"),
        node_id: None,
        group_id: "session-1".to_string(),
        caller: "master_agent".to_string(),
        callee: callee.to_string(),
        caller_category: None,
        callee_category: category,
        call_stack: vec!["user".into(), "master_agent".into(), callee.into()],
        input: json!({"arguments": {"query": format!("{callee} query for {trace}")}}),
        output: json!(format!("{callee} returned a detailed result")),
        state: CallState::Completed,
        created_at: at(minute),
    }
}

/// A stand-alone agent→tool unit with unique content
#[allow(dead_code)]
pub fn tool_unit(tag: &str) -> QAUnit {
    UnitDraft {
        trace_id: format!("trace-{tag}"),
        request_id: format!("req-{tag}"),
        group_id: String::new(),
        caller: "planner".to_string(),
        callee: "calculator".to_string(),
        caller_category: Category::Agent,
        callee_category: Category::Tool,
        call_chain: vec!["user".into(), "planner".into(), "calculator".into()],
        question: format!("compute {tag}"),
        answer: format!("the result for {tag} is ready"),
        batch_id: None,
        parent_id: None,
    }
    .into_unit()
}

/// Poll `check` until it holds or two seconds pass
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
