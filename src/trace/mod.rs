//! Read-side view of the agent execution trace log
//!
//! The trace log holds two record kinds. A [`RootRecord`] is one end-to-end
//! user request with the final answer; a [`CallRecord`] is one caller→callee
//! invocation inside a trace. Both carry their payloads as loosely typed JSON,
//! and the question/answer text is extracted here.

pub mod jsonl;
pub mod memory;

use crate::error::PipelineError;
use crate::model::{Category, UnitDraft};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inclusive time range over record creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, PipelineError> {
        if start > end {
            return Err(PipelineError::validation(format!(
                "time window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Execution state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Running,
    Completed,
    Failed,
}

/// One end-to-end request: the user's query and the main agent's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootRecord {
    pub trace_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub group_id: String,
    /// Main agent that served the request
    pub callee: String,
    /// `{"query": ...}` object, or its JSON text
    pub input: Value,
    pub output: Value,
    pub created_at: DateTime<Utc>,
}

impl RootRecord {
    pub fn question(&self) -> String {
        field_text(&self.input, &["query"])
    }

    pub fn answer(&self) -> String {
        value_text(&self.output)
    }

    /// Draft of the end-to-end unit for this request
    pub fn to_draft(&self, batch_id: Option<&str>) -> UnitDraft {
        let request_id = if self.request_id.is_empty() {
            self.trace_id.clone()
        } else {
            self.request_id.clone()
        };
        UnitDraft {
            trace_id: self.trace_id.clone(),
            request_id,
            group_id: self.group_id.clone(),
            caller: "user".to_string(),
            callee: self.callee.clone(),
            caller_category: Category::User,
            callee_category: Category::Agent,
            call_chain: vec!["user".to_string(), self.callee.clone()],
            question: self.question(),
            answer: self.answer(),
            batch_id: batch_id.map(str::to_string),
            parent_id: None,
        }
    }
}

/// One caller→callee invocation inside a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub trace_id: String,
    pub request_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub group_id: String,
    pub caller: String,
    pub callee: String,
    /// Inferred from `caller` when absent
    #[serde(default)]
    pub caller_category: Option<Category>,
    #[serde(alias = "node_type")]
    pub callee_category: Category,
    #[serde(default)]
    pub call_stack: Vec<String>,
    /// `{"arguments": {"query": ...}}` object, or its JSON text
    pub input: Value,
    pub output: Value,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn is_completed(&self) -> bool {
        self.state == CallState::Completed
    }

    /// A call made directly by the user; its content is the root record's
    pub fn is_user_call(&self) -> bool {
        self.caller == "user"
    }

    pub fn caller_category(&self) -> Category {
        self.caller_category.unwrap_or(if self.is_user_call() {
            Category::User
        } else {
            Category::Agent
        })
    }

    pub fn question(&self) -> String {
        let text = field_text(&self.input, &["arguments", "query"]);
        if text.is_empty() {
            field_text(&self.input, &["query"])
        } else {
            text
        }
    }

    pub fn answer(&self) -> String {
        value_text(&self.output)
    }

    pub fn to_draft(&self, batch_id: Option<&str>, parent_id: Option<String>) -> UnitDraft {
        UnitDraft {
            trace_id: self.trace_id.clone(),
            request_id: self.request_id.clone(),
            group_id: self.group_id.clone(),
            caller: self.caller.clone(),
            callee: self.callee.clone(),
            caller_category: self.caller_category(),
            callee_category: self.callee_category,
            call_chain: self.call_stack.clone(),
            question: self.question(),
            answer: self.answer(),
            batch_id: batch_id.map(str::to_string),
            parent_id,
        }
    }
}

/// Follow `path` through an object (or JSON text of one) and render the leaf
fn field_text(value: &Value, path: &[&str]) -> String {
    let parsed;
    let mut current = match value {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(inner @ Value::Object(_)) => {
                parsed = inner;
                &parsed
            }
            // A bare string input is the question itself
            _ if path == ["query"] => return text.clone(),
            _ => return String::new(),
        },
        other => other,
    };
    for key in path {
        match current.get(key) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    value_text(current)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Record counts for an import preview
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub roots: usize,
    pub agent_calls: usize,
    pub tool_calls: usize,
}

/// Query interface over the trace log
#[async_trait::async_trait]
pub trait TraceStore: Send + Sync {
    async fn count_roots(&self, window: &TimeWindow) -> Result<usize, PipelineError>;

    /// Completed calls in the window whose callee is one of `categories`
    async fn count_calls(
        &self,
        window: &TimeWindow,
        categories: &[Category],
    ) -> Result<usize, PipelineError>;

    /// Newest first, at most `limit`
    async fn query_roots(
        &self,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<RootRecord>, PipelineError>;

    /// Every call on a trace, oldest first
    async fn query_calls_for_trace(&self, trace_id: &str)
        -> Result<Vec<CallRecord>, PipelineError>;

    /// Completed calls in the window whose callee is one of `categories`,
    /// newest first, at most `limit`
    async fn query_calls(
        &self,
        window: &TimeWindow,
        categories: &[Category],
        limit: usize,
    ) -> Result<Vec<CallRecord>, PipelineError>;

    /// Earliest and latest record creation time, if any records exist
    async fn available_range(&self) -> Result<Option<TimeWindow>, PipelineError>;
}
