//! Durable lifecycle record of every QA unit and its annotations
//!
//! All status changes go through [`TaskStore::transition`], a compare-and-set
//! against the statuses the caller expects. Concurrent writers racing on the
//! same unit therefore see exactly one winner; the rest get a conflict.

pub mod memory;
pub mod sqlite;

use crate::error::PipelineError;
use crate::model::{Annotation, Priority, QAUnit, ReviewOutcome, SourceType, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unit query; every set field must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub trace_id: Option<String>,
    pub group_id: Option<String>,
    pub caller: Option<String>,
    pub callee: Option<String>,
    pub source_type: Option<SourceType>,
    pub batch_id: Option<String>,
    pub parent_id: Option<String>,
    pub assigned_to: Option<String>,
    /// Only end-to-end units
    pub only_roots: bool,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Case-insensitive substring of question, answer, caller or callee
    pub keyword: Option<String>,
}

impl UnitFilter {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, unit: &QAUnit) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }

        self.status.map_or(true, |s| unit.status == s)
            && self.priority.map_or(true, |p| unit.priority == p)
            && eq(&self.trace_id, &unit.source_trace_id)
            && eq(&self.group_id, &unit.source_group_id)
            && eq(&self.caller, &unit.caller)
            && eq(&self.callee, &unit.callee)
            && self.source_type.map_or(true, |t| unit.source_type == t)
            && self
                .batch_id
                .as_ref()
                .map_or(true, |b| unit.batch_id.as_ref() == Some(b))
            && self
                .parent_id
                .as_ref()
                .map_or(true, |p| unit.parent_id.as_ref() == Some(p))
            && self
                .assigned_to
                .as_ref()
                .map_or(true, |a| unit.assigned_to.as_ref() == Some(a))
            && (!self.only_roots || unit.is_root())
            && self.created_after.map_or(true, |t| unit.created_at >= t)
            && self.created_before.map_or(true, |t| unit.created_at <= t)
            && self.keyword.as_ref().map_or(true, |k| {
                let k = k.to_lowercase();
                [&unit.question, &unit.answer, &unit.caller, &unit.callee]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&k))
            })
    }
}

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: usize = 500;

    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page - 1) * self.page_size
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches across all pages
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// How a transition treats the assignment fields
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AssignmentUpdate {
    #[default]
    Keep,
    Set {
        annotator: String,
        assigned_at: DateTime<Utc>,
        expire_at: DateTime<Utc>,
    },
    Clear,
}

/// A requested status change and the fields it updates
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: TaskStatus,
    pub assignment: AssignmentUpdate,
    /// Increment the review retry counter
    pub bump_retry: bool,
    /// Recorded on `kb_failed`
    pub kb_error: Option<String>,
}

impl Transition {
    pub fn to(status: TaskStatus) -> Self {
        Self {
            to: status,
            assignment: AssignmentUpdate::Keep,
            bump_retry: false,
            kb_error: None,
        }
    }

    pub fn assign(mut self, annotator: &str, assigned_at: DateTime<Utc>, expire_at: DateTime<Utc>) -> Self {
        self.assignment = AssignmentUpdate::Set {
            annotator: annotator.to_string(),
            assigned_at,
            expire_at,
        };
        self
    }

    pub fn clear_assignment(mut self) -> Self {
        self.assignment = AssignmentUpdate::Clear;
        self
    }

    pub fn bump_retry(mut self) -> Self {
        self.bump_retry = true;
        self
    }

    pub fn kb_error(mut self, error: String) -> Self {
        self.kb_error = Some(error);
        self
    }

    /// Apply to a unit whose current status was already checked
    pub(crate) fn apply(&self, unit: &mut QAUnit, now: DateTime<Utc>) {
        unit.status = self.to;
        match &self.assignment {
            AssignmentUpdate::Keep => {}
            AssignmentUpdate::Set {
                annotator,
                assigned_at,
                expire_at,
            } => {
                unit.assigned_to = Some(annotator.clone());
                unit.assigned_at = Some(*assigned_at);
                unit.expire_at = Some(*expire_at);
            }
            AssignmentUpdate::Clear => {
                unit.assigned_to = None;
                unit.assigned_at = None;
                unit.expire_at = None;
            }
        }
        if self.bump_retry {
            unit.retry_count += 1;
        }
        match self.to {
            TaskStatus::KbIngested => {
                unit.kb_ingested_at = Some(now);
                unit.kb_error = None;
            }
            TaskStatus::KbFailed => unit.kb_error = self.kb_error.clone(),
            _ => {}
        }
        unit.status_history.push(crate::model::StatusChange {
            status: self.to,
            at: now,
        });
        unit.updated_at = now;
    }
}

/// Reviewer fields written onto an annotation
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewUpdate {
    pub outcome: ReviewOutcome,
    pub reviewer_id: String,
    pub comment: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Units created by one import batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub count: usize,
    /// Creation time of the batch's newest unit
    pub latest_created_at: DateTime<Utc>,
}

/// Persistence for units and annotations
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new pending unit. Fails with `Duplicate` if the content hash is
    /// taken and with `Validation` if the parent is unknown or on another trace.
    async fn insert_unit(&self, unit: QAUnit) -> Result<QAUnit, PipelineError>;

    async fn get_unit(&self, data_id: &str) -> Result<Option<QAUnit>, PipelineError>;

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<QAUnit>, PipelineError>;

    /// Newest first
    async fn list_units(
        &self,
        filter: &UnitFilter,
        page: &PageRequest,
    ) -> Result<Page<QAUnit>, PipelineError>;

    async fn units_for_trace(&self, trace_id: &str) -> Result<Vec<QAUnit>, PipelineError>;

    /// Compare-and-set the status. Fails with `Conflict` when the current
    /// status is not in `expected` or the state machine forbids the move.
    async fn transition(
        &self,
        data_id: &str,
        expected: &[TaskStatus],
        transition: Transition,
    ) -> Result<QAUnit, PipelineError>;

    /// Link a unit to a parent on the same trace, or unlink it
    async fn set_parent(
        &self,
        data_id: &str,
        parent_id: Option<String>,
    ) -> Result<QAUnit, PipelineError>;

    async fn save_annotation(&self, annotation: Annotation) -> Result<Annotation, PipelineError>;

    async fn get_annotation(&self, annotation_id: &str)
        -> Result<Option<Annotation>, PipelineError>;

    /// Most recent annotation submitted for a unit
    async fn latest_annotation_for(
        &self,
        data_id: &str,
    ) -> Result<Option<Annotation>, PipelineError>;

    async fn update_annotation_review(
        &self,
        annotation_id: &str,
        review: ReviewUpdate,
    ) -> Result<Annotation, PipelineError>;

    /// Assigned units whose `expire_at` is at or before `now`
    async fn expired_assignments(&self, now: DateTime<Utc>) -> Result<Vec<QAUnit>, PipelineError>;

    async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>, PipelineError>;

    /// Newest batch first
    async fn batch_summaries(&self) -> Result<Vec<BatchSummary>, PipelineError>;

    async fn ping(&self) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, UnitDraft};

    fn unit() -> QAUnit {
        UnitDraft {
            trace_id: "trace-9".to_string(),
            request_id: "req".to_string(),
            group_id: "group".to_string(),
            caller: "planner".to_string(),
            callee: "weather_tool".to_string(),
            caller_category: Category::Agent,
            callee_category: Category::Tool,
            call_chain: vec!["user".into(), "planner".into(), "weather_tool".into()],
            question: "Forecast for Lisbon".to_string(),
            answer: "Sunny with a high of 24C".to_string(),
            batch_id: Some("b-1".to_string()),
            parent_id: Some("root".to_string()),
        }
        .into_unit()
    }

    #[test]
    fn test_filter_fields() {
        let unit = unit();
        assert!(UnitFilter::default().matches(&unit));
        assert!(UnitFilter::with_status(TaskStatus::Pending).matches(&unit));
        assert!(!UnitFilter::with_status(TaskStatus::Approved).matches(&unit));

        let filter = UnitFilter {
            trace_id: Some("trace-9".to_string()),
            batch_id: Some("b-1".to_string()),
            parent_id: Some("root".to_string()),
            source_type: Some(SourceType::AgentTool),
            ..UnitFilter::default()
        };
        assert!(filter.matches(&unit));

        let roots_only = UnitFilter {
            only_roots: true,
            ..UnitFilter::default()
        };
        assert!(!roots_only.matches(&unit));
    }

    #[test]
    fn test_keyword_is_case_insensitive() {
        let unit = unit();
        let hit = UnitFilter {
            keyword: Some("LISBON".to_string()),
            ..UnitFilter::default()
        };
        let by_callee = UnitFilter {
            keyword: Some("weather".to_string()),
            ..UnitFilter::default()
        };
        let miss = UnitFilter {
            keyword: Some("porto".to_string()),
            ..UnitFilter::default()
        };
        assert!(hit.matches(&unit));
        assert!(by_callee.matches(&unit));
        assert!(!miss.matches(&unit));
    }

    #[test]
    fn test_page_request_bounds() {
        let page = PageRequest::new(0, 0);
        assert_eq!((page.page, page.page_size), (1, 1));
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
        assert_eq!(PageRequest::new(1, 10_000).page_size, PageRequest::MAX_PAGE_SIZE);
    }

    #[test]
    fn test_transition_apply_updates_fields() {
        let mut unit = unit();
        let now = Utc::now();
        Transition::to(TaskStatus::Assigned)
            .assign("alice", now, now + chrono::Duration::hours(24))
            .apply(&mut unit, now);
        assert_eq!(unit.assigned_to.as_deref(), Some("alice"));
        assert_eq!(unit.status_path(), vec![TaskStatus::Pending, TaskStatus::Assigned]);

        Transition::to(TaskStatus::Pending)
            .clear_assignment()
            .bump_retry()
            .apply(&mut unit, now);
        assert!(unit.assigned_to.is_none());
        assert!(unit.expire_at.is_none());
        assert_eq!(unit.retry_count, 1);
    }
}
