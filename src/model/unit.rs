//! The canonical QA unit carried through every pipeline stage

use super::classify::{classify, Category, Priority, SourceType};
use super::status::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Optional enrichment attached by the quality stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// Score in [0, 1]
    pub score: f64,
    pub suggested_category: Option<String>,
    pub is_valid: bool,
    pub summary: Option<String>,
}

/// One recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

/// A question/answer pair extracted from one call, plus its task lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QAUnit {
    pub data_id: String,
    pub question: String,
    pub answer: String,
    pub content_hash: String,

    pub source_trace_id: String,
    pub source_request_id: String,
    #[serde(default)]
    pub source_group_id: String,
    pub caller: String,
    pub callee: String,
    pub caller_category: Category,
    pub callee_category: Category,
    #[serde(default)]
    pub call_chain: Vec<String>,

    pub priority: Priority,
    pub source_type: SourceType,
    pub parent_id: Option<String>,
    /// Import batch that produced the unit; `None` for realtime collection
    pub batch_id: Option<String>,

    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,

    pub quality: Option<QualityAssessment>,
    #[serde(default)]
    pub low_quality: bool,
    /// Number of times review sent the unit back to pending
    #[serde(default)]
    pub retry_count: u32,
    pub kb_error: Option<String>,
    pub kb_ingested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_history: Vec<StatusChange>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QAUnit {
    pub fn is_root(&self) -> bool {
        self.source_type == SourceType::EndToEnd
    }

    /// Sequence of statuses the unit has been in, oldest first
    pub fn status_path(&self) -> Vec<TaskStatus> {
        self.status_history.iter().map(|c| c.status).collect()
    }
}

/// Dedup key over trace id, request id, question and answer
pub fn content_hash(trace_id: &str, request_id: &str, question: &str, answer: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [trace_id, request_id, question, answer] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

/// Extracted call content before classification and id assignment
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDraft {
    pub trace_id: String,
    pub request_id: String,
    pub group_id: String,
    pub caller: String,
    pub callee: String,
    pub caller_category: Category,
    pub callee_category: Category,
    pub call_chain: Vec<String>,
    pub question: String,
    pub answer: String,
    pub batch_id: Option<String>,
    pub parent_id: Option<String>,
}

impl UnitDraft {
    pub fn content_hash(&self) -> String {
        content_hash(&self.trace_id, &self.request_id, &self.question, &self.answer)
    }

    /// Build a unit classified from its caller/callee categories and call chain
    pub fn into_unit(self) -> QAUnit {
        let classification = classify(
            self.caller_category,
            self.callee_category,
            self.call_chain.len(),
        );
        self.build(classification.priority, classification.source_type)
    }

    /// Build an end-to-end root unit; roots are always priority 0
    pub fn into_root_unit(self) -> QAUnit {
        self.build(Priority::END_TO_END, SourceType::EndToEnd)
    }

    fn build(self, priority: Priority, source_type: SourceType) -> QAUnit {
        let now = Utc::now();
        let content_hash = self.content_hash();
        // Roots never carry a parent
        let parent_id = if source_type == SourceType::EndToEnd {
            None
        } else {
            self.parent_id
        };

        QAUnit {
            data_id: Uuid::new_v4().to_string(),
            question: self.question,
            answer: self.answer,
            content_hash,
            source_trace_id: self.trace_id,
            source_request_id: self.request_id,
            source_group_id: self.group_id,
            caller: self.caller,
            callee: self.callee,
            caller_category: self.caller_category,
            callee_category: self.callee_category,
            call_chain: self.call_chain,
            priority,
            source_type,
            parent_id,
            batch_id: self.batch_id,
            status: TaskStatus::Pending,
            assigned_to: None,
            assigned_at: None,
            expire_at: None,
            quality: None,
            low_quality: false,
            retry_count: 0,
            kb_error: None,
            kb_ingested_at: None,
            status_history: vec![StatusChange {
                status: TaskStatus::Pending,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }
}
