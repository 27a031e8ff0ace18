//! Task service: the surface the annotation UI talks to
//!
//! Status changes made here are compare-and-set against the task store, then
//! announced on the `review` topic. Two annotators racing on the same unit
//! see exactly one success; the other gets a conflict.

use crate::error::PipelineError;
use crate::model::{
    Annotation, AnnotationInput, QAUnit, ReviewDecision, ReviewOutcome, TaskStatus, TreeNode,
    UnitTree,
};
use crate::mq::{MessageQueue, Topic};
use crate::processors::KnowledgeProcessor;
use crate::store::{
    BatchSummary, Page, PageRequest, ReviewUpdate, TaskStore, Transition, UnitFilter,
};
use crate::trace::TraceStore;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A unit with its annotation and its place in the trace tree
#[derive(Debug, Clone, Serialize)]
pub struct UnitDetail {
    pub unit: QAUnit,
    pub annotation: Option<Annotation>,
    /// Ancestors, nearest first
    pub ancestors: Vec<QAUnit>,
    pub children: Vec<QAUnit>,
    /// Every unit of the trace, nested under its roots
    pub tree: Vec<TreeNode>,
}

/// Task counts for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub status_counts: BTreeMap<String, usize>,
    pub total: usize,
    pub end_to_end: usize,
    /// Units that have been annotated at least once
    pub annotated: usize,
    /// Units whose annotation was approved
    pub approved: usize,
    /// `annotated / total`
    pub annotation_progress: f64,
    /// `approved / annotated`
    pub approval_progress: f64,
    /// Root records in the trace log not yet stored as units
    pub pending_import: Option<usize>,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn MessageQueue>,
    knowledge: Arc<KnowledgeProcessor>,
    traces: Option<Arc<dyn TraceStore>>,
    /// How long a manual assignment holds before the sweeper reverts it
    assignment_ttl: Duration,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn MessageQueue>,
        knowledge: Arc<KnowledgeProcessor>,
    ) -> Self {
        Self {
            store,
            queue,
            knowledge,
            traces: None,
            assignment_ttl: Duration::hours(24),
        }
    }

    pub fn with_expire_hours(mut self, hours: i64) -> Self {
        self.assignment_ttl = Duration::hours(hours);
        self
    }

    /// Enables `pending_import` in the overview
    pub fn with_trace_store(mut self, traces: Arc<dyn TraceStore>) -> Self {
        self.traces = Some(traces);
        self
    }

    pub async fn list(
        &self,
        filter: &UnitFilter,
        page: &PageRequest,
    ) -> Result<Page<QAUnit>, PipelineError> {
        self.store.list_units(filter, page).await
    }

    pub async fn get(&self, data_id: &str) -> Result<UnitDetail, PipelineError> {
        let unit = self.require_unit(data_id).await?;
        let annotation = self.store.latest_annotation_for(data_id).await?;
        let tree = UnitTree::build(self.store.units_for_trace(&unit.source_trace_id).await?);

        Ok(UnitDetail {
            ancestors: tree
                .path_to_root(data_id)
                .into_iter()
                .skip(1)
                .cloned()
                .collect(),
            children: tree.children(data_id).into_iter().cloned().collect(),
            tree: tree.to_nested(),
            annotation,
            unit,
        })
    }

    /// Trace tree of every stored unit on a trace
    pub async fn trace_tree(&self, trace_id: &str) -> Result<UnitTree, PipelineError> {
        Ok(UnitTree::build(self.store.units_for_trace(trace_id).await?))
    }

    /// Claim a pending unit for an annotator until the assignment expires
    pub async fn assign(&self, data_id: &str, annotator_id: &str) -> Result<QAUnit, PipelineError> {
        if annotator_id.trim().is_empty() {
            return Err(PipelineError::validation("annotator_id must not be empty"));
        }
        let now = Utc::now();
        let unit = self
            .store
            .transition(
                data_id,
                &[TaskStatus::Pending],
                Transition::to(TaskStatus::Assigned).assign(
                    annotator_id,
                    now,
                    now + self.assignment_ttl,
                ),
            )
            .await?;
        info!(data_id = data_id, annotator = annotator_id, "Task assigned");
        Ok(unit)
    }

    /// Submit an annotation for a pending or assigned unit
    pub async fn annotate(
        &self,
        data_id: &str,
        input: AnnotationInput,
    ) -> Result<QAUnit, PipelineError> {
        input.validate().map_err(PipelineError::validation)?;

        let unit = self
            .store
            .transition(
                data_id,
                &TaskStatus::ANNOTATABLE,
                Transition::to(TaskStatus::Annotated),
            )
            .await?;
        let annotation = self
            .store
            .save_annotation(Annotation::new(data_id, input))
            .await?;

        let notice = ReviewDecision {
            data_id: data_id.to_string(),
            annotation_id: annotation.annotation_id.clone(),
            outcome: ReviewOutcome::Pending,
            reviewer_id: String::new(),
            comment: None,
            add_to_kb: annotation.input.should_add_to_kb,
            decided_at: Utc::now(),
        };
        self.publish_decision(&notice, &unit).await?;

        info!(
            data_id = data_id,
            annotation_id = %annotation.annotation_id,
            annotator = %annotation.input.annotator_id,
            "Annotation submitted"
        );
        Ok(unit)
    }

    /// Replace the latest annotation while it awaits review; only its author may
    pub async fn revise_annotation(
        &self,
        data_id: &str,
        input: AnnotationInput,
    ) -> Result<Annotation, PipelineError> {
        input.validate().map_err(PipelineError::validation)?;

        let unit = self.require_unit(data_id).await?;
        if unit.status != TaskStatus::Annotated {
            return Err(PipelineError::conflict(
                data_id,
                &[TaskStatus::Annotated],
                unit.status,
            ));
        }
        let mut annotation = self.require_annotation(data_id).await?;
        if annotation.input.annotator_id != input.annotator_id {
            return Err(PipelineError::validation(format!(
                "annotation {} belongs to {}",
                annotation.annotation_id, annotation.input.annotator_id
            )));
        }

        annotation.input = input;
        annotation.review_status = ReviewOutcome::Pending;
        annotation.reviewer_id = None;
        annotation.review_comment = None;
        annotation.reviewed_at = None;
        self.store.save_annotation(annotation).await
    }

    pub async fn approve(
        &self,
        data_id: &str,
        reviewer_id: &str,
        comment: Option<String>,
        add_to_kb: bool,
    ) -> Result<QAUnit, PipelineError> {
        self.review(data_id, ReviewOutcome::Approved, reviewer_id, comment, add_to_kb)
            .await
    }

    pub async fn reject(
        &self,
        data_id: &str,
        reviewer_id: &str,
        comment: Option<String>,
    ) -> Result<QAUnit, PipelineError> {
        self.review(data_id, ReviewOutcome::Rejected, reviewer_id, comment, false)
            .await
    }

    async fn review(
        &self,
        data_id: &str,
        outcome: ReviewOutcome,
        reviewer_id: &str,
        comment: Option<String>,
        add_to_kb: bool,
    ) -> Result<QAUnit, PipelineError> {
        if reviewer_id.trim().is_empty() {
            return Err(PipelineError::validation("reviewer_id must not be empty"));
        }
        let annotation = self.require_annotation(data_id).await?;
        let to = match outcome {
            ReviewOutcome::Approved => TaskStatus::Approved,
            ReviewOutcome::Rejected => TaskStatus::Rejected,
            ReviewOutcome::Pending => {
                return Err(PipelineError::validation("a review needs a verdict"))
            }
        };

        let unit = self
            .store
            .transition(data_id, &[TaskStatus::Annotated], Transition::to(to))
            .await?;
        let now = Utc::now();
        self.store
            .update_annotation_review(
                &annotation.annotation_id,
                ReviewUpdate {
                    outcome,
                    reviewer_id: reviewer_id.to_string(),
                    comment: comment.clone(),
                    reviewed_at: now,
                },
            )
            .await?;

        let decision = ReviewDecision {
            data_id: data_id.to_string(),
            annotation_id: annotation.annotation_id,
            outcome,
            reviewer_id: reviewer_id.to_string(),
            comment,
            add_to_kb,
            decided_at: now,
        };
        self.publish_decision(&decision, &unit).await?;

        info!(data_id = data_id, reviewer = reviewer_id, outcome = ?outcome, "Review recorded");
        Ok(unit)
    }

    /// Send a `kb_failed` unit to the knowledge base again
    pub async fn retrigger_kb(&self, data_id: &str) -> Result<QAUnit, PipelineError> {
        self.knowledge.retrigger(data_id).await?;
        self.require_unit(data_id).await
    }

    pub async fn overview(&self) -> Result<Overview, PipelineError> {
        let counts = self.store.status_counts().await?;
        let count = |status: TaskStatus| counts.get(&status).copied().unwrap_or(0);

        let total: usize = counts.values().sum();
        let approved = count(TaskStatus::Approved)
            + count(TaskStatus::KbIngested)
            + count(TaskStatus::KbFailed);
        let annotated = approved + count(TaskStatus::Annotated) + count(TaskStatus::Rejected);
        let end_to_end = self
            .store
            .list_units(
                &UnitFilter {
                    only_roots: true,
                    ..UnitFilter::default()
                },
                &PageRequest::new(1, 1),
            )
            .await?
            .total;

        let pending_import = match &self.traces {
            Some(traces) => self.pending_import(traces.as_ref(), end_to_end).await,
            None => None,
        };

        Ok(Overview {
            status_counts: TaskStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), count(*s)))
                .collect(),
            total,
            end_to_end,
            annotated,
            approved,
            annotation_progress: ratio(annotated, total),
            approval_progress: ratio(approved, annotated),
            pending_import,
        })
    }

    async fn pending_import(&self, traces: &dyn TraceStore, end_to_end: usize) -> Option<usize> {
        let counted = async {
            match traces.available_range().await? {
                Some(range) => traces.count_roots(&range).await,
                None => Ok(0),
            }
        };
        match counted.await {
            Ok(roots) => Some(roots.saturating_sub(end_to_end)),
            Err(e) => {
                warn!(error = %e, "Trace store unavailable for overview");
                None
            }
        }
    }

    pub async fn batch_summaries(&self) -> Result<Vec<BatchSummary>, PipelineError> {
        self.store.batch_summaries().await
    }

    async fn require_unit(&self, data_id: &str) -> Result<QAUnit, PipelineError> {
        self.store
            .get_unit(data_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("unit {data_id}")))
    }

    async fn require_annotation(&self, data_id: &str) -> Result<Annotation, PipelineError> {
        self.store
            .latest_annotation_for(data_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("annotation for unit {data_id}")))
    }

    async fn publish_decision(
        &self,
        decision: &ReviewDecision,
        unit: &QAUnit,
    ) -> Result<(), PipelineError> {
        self.queue
            .publish(
                Topic::Review,
                serde_json::to_value(decision)?,
                unit.priority.value(),
                None,
            )
            .await?;
        Ok(())
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqSection;
    use crate::model::{Category, QualityLabel, UnitDraft};
    use crate::mq::memory::MemoryQueue;
    use crate::store::memory::MemoryTaskStore;
    use crate::testing::mocks::MockKnowledgeSink;

    struct Fixture {
        store: Arc<MemoryTaskStore>,
        queue: Arc<MemoryQueue>,
        service: TaskService,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryTaskStore::new());
        let queue = Arc::new(MemoryQueue::new(MqSection::default()));
        queue.connect().await.unwrap();
        let knowledge = Arc::new(KnowledgeProcessor::new(
            store.clone(),
            Arc::new(MockKnowledgeSink::new()),
        ));
        let service = TaskService::new(store.clone(), queue.clone(), knowledge);
        Fixture {
            store,
            queue,
            service,
        }
    }

    async fn stored_unit(store: &MemoryTaskStore, question: &str) -> QAUnit {
        let unit = UnitDraft {
            trace_id: "trace".to_string(),
            request_id: question.to_string(),
            group_id: String::new(),
            caller: "user".to_string(),
            callee: "assistant".to_string(),
            caller_category: Category::User,
            callee_category: Category::Agent,
            call_chain: vec!["user".into(), "assistant".into()],
            question: question.to_string(),
            answer: "a sufficiently long answer".to_string(),
            batch_id: None,
            parent_id: None,
        }
        .into_root_unit();
        store.insert_unit(unit).await.unwrap()
    }

    // ========== Tests for assign ==========

    #[tokio::test]
    async fn test_assign_claims_pending_unit() {
        let f = fixture().await;
        let service = TaskService::new(
            f.store.clone(),
            f.queue.clone(),
            Arc::new(KnowledgeProcessor::new(
                f.store.clone(),
                Arc::new(MockKnowledgeSink::new()),
            )),
        )
        .with_expire_hours(6);
        let unit = stored_unit(&f.store, "q1").await;

        let assigned = service.assign(&unit.data_id, "carol").await.unwrap();
        assert_eq!(assigned.status, TaskStatus::Assigned);
        assert_eq!(assigned.assigned_to.as_deref(), Some("carol"));
        assert_eq!(
            assigned.expire_at.unwrap() - assigned.assigned_at.unwrap(),
            Duration::hours(6)
        );

        let err = service.assign(&unit.data_id, "dave").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Conflict {
                actual: TaskStatus::Assigned,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_assign_validates_input() {
        let f = fixture().await;
        let unit = stored_unit(&f.store, "q1").await;
        assert!(matches!(
            f.service.assign(&unit.data_id, "  ").await,
            Err(PipelineError::Validation { .. })
        ));
        assert!(matches!(
            f.service.assign("missing", "carol").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    // ========== Tests for annotate ==========

    #[tokio::test]
    async fn test_annotate_moves_to_annotated_and_notifies() {
        let f = fixture().await;
        let unit = stored_unit(&f.store, "q1").await;

        let updated = f
            .service
            .annotate(&unit.data_id, AnnotationInput::labelled("alice", QualityLabel::Good))
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Annotated);

        let notice: ReviewDecision = f.queue.retained(Topic::Review)[0].decode().unwrap();
        assert_eq!(notice.outcome, ReviewOutcome::Pending);
        assert_eq!(notice.data_id, unit.data_id);
    }

    #[tokio::test]
    async fn test_second_annotation_conflicts() {
        let f = fixture().await;
        let unit = stored_unit(&f.store, "q1").await;
        let input = AnnotationInput::labelled("alice", QualityLabel::Good);

        f.service.annotate(&unit.data_id, input.clone()).await.unwrap();
        let err = f.service.annotate(&unit.data_id, input).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_invalid_annotation_rejected() {
        let f = fixture().await;
        let unit = stored_unit(&f.store, "q1").await;
        let err = f
            .service
            .annotate(&unit.data_id, AnnotationInput::labelled(" ", QualityLabel::Good))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
        let stored = f.store.get_unit(&unit.data_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_revise_only_by_author() {
        let f = fixture().await;
        let unit = stored_unit(&f.store, "q1").await;
        f.service
            .annotate(&unit.data_id, AnnotationInput::labelled("alice", QualityLabel::Good))
            .await
            .unwrap();

        let revised = f
            .service
            .revise_annotation(&unit.data_id, AnnotationInput::labelled("alice", QualityLabel::Poor))
            .await
            .unwrap();
        assert_eq!(revised.input.quality_label, QualityLabel::Poor);

        let err = f
            .service
            .revise_annotation(&unit.data_id, AnnotationInput::labelled("bob", QualityLabel::Poor))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    // ========== Tests for review ==========

    #[tokio::test]
    async fn test_approve_records_review_and_publishes() {
        let f = fixture().await;
        let unit = stored_unit(&f.store, "q1").await;
        f.service
            .annotate(&unit.data_id, AnnotationInput::labelled("alice", QualityLabel::Good))
            .await
            .unwrap();

        let updated = f
            .service
            .approve(&unit.data_id, "rev", Some("fine".to_string()), true)
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Approved);

        let annotation = f.store.latest_annotation_for(&unit.data_id).await.unwrap().unwrap();
        assert_eq!(annotation.review_status, ReviewOutcome::Approved);
        assert_eq!(annotation.reviewer_id.as_deref(), Some("rev"));

        let decisions: Vec<ReviewDecision> = f
            .queue
            .retained(Topic::Review)
            .iter()
            .map(|m| m.decode().unwrap())
            .collect();
        assert_eq!(decisions.last().unwrap().outcome, ReviewOutcome::Approved);
        assert!(decisions.last().unwrap().add_to_kb);
    }

    #[tokio::test]
    async fn test_reject_without_annotation_is_not_found() {
        let f = fixture().await;
        let unit = stored_unit(&f.store, "q1").await;
        let err = f.service.reject(&unit.data_id, "rev", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retrigger_requires_failed_status() {
        let f = fixture().await;
        let unit = stored_unit(&f.store, "q1").await;
        let err = f.service.retrigger_kb(&unit.data_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }));
    }

    // ========== Tests for queries ==========

    #[tokio::test]
    async fn test_get_includes_tree() {
        let f = fixture().await;
        let root = stored_unit(&f.store, "root question").await;
        let child = UnitDraft {
            trace_id: "trace".to_string(),
            request_id: "child".to_string(),
            group_id: String::new(),
            caller: "assistant".to_string(),
            callee: "search".to_string(),
            caller_category: Category::Agent,
            callee_category: Category::Tool,
            call_chain: vec!["user".into(), "assistant".into(), "search".into()],
            question: "search query".to_string(),
            answer: "search results text".to_string(),
            batch_id: None,
            parent_id: Some(root.data_id.clone()),
        }
        .into_unit();
        let child = f.store.insert_unit(child).await.unwrap();

        let detail = f.service.get(&child.data_id).await.unwrap();
        assert_eq!(detail.ancestors.len(), 1);
        assert_eq!(detail.ancestors[0].data_id, root.data_id);
        assert_eq!(detail.tree.len(), 1);
        assert_eq!(detail.tree[0].children.len(), 1);

        let root_detail = f.service.get(&root.data_id).await.unwrap();
        assert_eq!(root_detail.children.len(), 1);
        assert!(f.service.get("missing").await.is_err());

        let tree = f.service.trace_tree("trace").await.unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.roots().count(), 1);
        assert!(f.service.trace_tree("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overview_counts() {
        let f = fixture().await;
        let a = stored_unit(&f.store, "q1").await;
        stored_unit(&f.store, "q2").await;
        f.service
            .annotate(&a.data_id, AnnotationInput::labelled("alice", QualityLabel::Good))
            .await
            .unwrap();
        f.service.approve(&a.data_id, "rev", None, false).await.unwrap();

        let overview = f.service.overview().await.unwrap();
        assert_eq!(overview.total, 2);
        assert_eq!(overview.end_to_end, 2);
        assert_eq!(overview.status_counts["approved"], 1);
        assert_eq!(overview.status_counts["pending"], 1);
        assert_eq!(overview.annotated, 1);
        assert!((overview.annotation_progress - 0.5).abs() < f64::EPSILON);
        assert!((overview.approval_progress - 1.0).abs() < f64::EPSILON);
        assert!(overview.pending_import.is_none());
    }
}
