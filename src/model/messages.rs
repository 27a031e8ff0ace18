//! Payloads carried on the `review` and `knowledge` topics

use super::annotation::{Annotation, ReviewOutcome};
use super::classify::{Priority, SourceType};
use super::unit::QAUnit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reviewer's decision on an annotated unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub data_id: String,
    pub annotation_id: String,
    pub outcome: ReviewOutcome,
    pub reviewer_id: String,
    pub comment: Option<String>,
    /// Whether an approved unit goes to the knowledge base
    pub add_to_kb: bool,
    pub decided_at: DateTime<Utc>,
}

/// A reviewed unit ready for the knowledge base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub data_id: String,
    pub annotation_id: String,
    pub question: String,
    pub answer: String,
    pub score: Option<f64>,
    pub caller: String,
    pub callee: String,
    pub source_trace_id: String,
    pub source_request_id: String,
    pub source_type: SourceType,
    pub priority: Priority,
    pub category: Option<String>,
    pub domain: Option<String>,
    pub intent: Option<String>,
    pub remark: Option<String>,
}

impl KnowledgeEntry {
    /// Build the entry from a unit and its approved annotation
    pub fn from_reviewed(unit: &QAUnit, annotation: &Annotation) -> Self {
        Self {
            data_id: unit.data_id.clone(),
            annotation_id: annotation.annotation_id.clone(),
            question: annotation.final_question(&unit.question).to_string(),
            answer: annotation.final_answer(&unit.answer).to_string(),
            score: unit.quality.as_ref().map(|q| q.score),
            caller: unit.caller.clone(),
            callee: unit.callee.clone(),
            source_trace_id: unit.source_trace_id.clone(),
            source_request_id: unit.source_request_id.clone(),
            source_type: unit.source_type,
            priority: unit.priority,
            category: annotation
                .input
                .kb_category
                .clone()
                .or_else(|| unit.quality.as_ref().and_then(|q| q.suggested_category.clone())),
            domain: annotation.input.domain.clone(),
            intent: annotation.input.intent.clone(),
            remark: annotation.input.notes.clone(),
        }
    }
}
