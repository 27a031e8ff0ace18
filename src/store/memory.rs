//! In-memory task store

use super::{BatchSummary, Page, PageRequest, ReviewUpdate, TaskStore, Transition, UnitFilter};
use crate::error::PipelineError;
use crate::model::{Annotation, QAUnit, TaskStatus};
use crate::observability::metrics::metrics;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    units: HashMap<String, QAUnit>,
    /// content_hash -> data_id
    by_hash: HashMap<String, String>,
    annotations: HashMap<String, Annotation>,
    /// data_id -> annotation ids in submission order
    annotations_by_unit: HashMap<String, Vec<String>>,
}

impl State {
    fn check_parent(&self, unit: &QAUnit, parent_id: &str) -> Result<(), PipelineError> {
        if parent_id == unit.data_id {
            return Err(PipelineError::validation(format!(
                "unit {} cannot be its own parent",
                unit.data_id
            )));
        }
        match self.units.get(parent_id) {
            None => Err(PipelineError::validation(format!(
                "parent {parent_id} of unit {} does not exist",
                unit.data_id
            ))),
            Some(parent) if parent.source_trace_id != unit.source_trace_id => {
                Err(PipelineError::validation(format!(
                    "parent {parent_id} is on trace {}, unit {} is on trace {}",
                    parent.source_trace_id, unit.data_id, unit.source_trace_id
                )))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Task store held in process memory behind an async read/write lock
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    state: RwLock<State>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_unit(&self, unit: QAUnit) -> Result<QAUnit, PipelineError> {
        if unit.status != TaskStatus::Pending {
            return Err(PipelineError::validation(format!(
                "new unit {} must be pending, not {}",
                unit.data_id, unit.status
            )));
        }

        let mut state = self.state.write().await;
        if state.by_hash.contains_key(&unit.content_hash) {
            return Err(PipelineError::duplicate(&unit.content_hash));
        }
        if state.units.contains_key(&unit.data_id) {
            return Err(PipelineError::validation(format!(
                "data_id {} already exists",
                unit.data_id
            )));
        }
        if let Some(parent_id) = &unit.parent_id {
            state.check_parent(&unit, parent_id)?;
        }

        state
            .by_hash
            .insert(unit.content_hash.clone(), unit.data_id.clone());
        state.units.insert(unit.data_id.clone(), unit.clone());
        debug!(data_id = %unit.data_id, "Unit stored");
        Ok(unit)
    }

    async fn get_unit(&self, data_id: &str) -> Result<Option<QAUnit>, PipelineError> {
        Ok(self.state.read().await.units.get(data_id).cloned())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<QAUnit>, PipelineError> {
        let state = self.state.read().await;
        Ok(state
            .by_hash
            .get(content_hash)
            .and_then(|id| state.units.get(id))
            .cloned())
    }

    async fn list_units(
        &self,
        filter: &UnitFilter,
        page: &PageRequest,
    ) -> Result<Page<QAUnit>, PipelineError> {
        let state = self.state.read().await;
        let mut matching: Vec<&QAUnit> =
            state.units.values().filter(|u| filter.matches(u)).collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.data_id.cmp(&b.data_id))
        });

        Ok(Page {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(page.offset())
                .take(page.page_size)
                .cloned()
                .collect(),
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn units_for_trace(&self, trace_id: &str) -> Result<Vec<QAUnit>, PipelineError> {
        let state = self.state.read().await;
        Ok(state
            .units
            .values()
            .filter(|u| u.source_trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        data_id: &str,
        expected: &[TaskStatus],
        transition: Transition,
    ) -> Result<QAUnit, PipelineError> {
        let mut state = self.state.write().await;
        let unit = state
            .units
            .get_mut(data_id)
            .ok_or_else(|| PipelineError::not_found(format!("unit {data_id}")))?;

        if !expected.contains(&unit.status) || !unit.status.can_transition_to(transition.to) {
            metrics().status_conflict();
            return Err(PipelineError::conflict(data_id, expected, unit.status));
        }

        let from = unit.status;
        transition.apply(unit, Utc::now());
        debug!(data_id = data_id, from = %from, to = %unit.status, "Status changed");
        Ok(unit.clone())
    }

    async fn set_parent(
        &self,
        data_id: &str,
        parent_id: Option<String>,
    ) -> Result<QAUnit, PipelineError> {
        let mut state = self.state.write().await;
        let current = state
            .units
            .get(data_id)
            .ok_or_else(|| PipelineError::not_found(format!("unit {data_id}")))?;
        if let Some(parent) = &parent_id {
            state.check_parent(current, parent)?;
        }

        let unit = state
            .units
            .get_mut(data_id)
            .ok_or_else(|| PipelineError::not_found(format!("unit {data_id}")))?;
        unit.parent_id = parent_id;
        unit.updated_at = Utc::now();
        Ok(unit.clone())
    }

    async fn save_annotation(&self, annotation: Annotation) -> Result<Annotation, PipelineError> {
        let mut state = self.state.write().await;
        if !state.units.contains_key(&annotation.task_id) {
            return Err(PipelineError::not_found(format!(
                "unit {}",
                annotation.task_id
            )));
        }

        let ids = state
            .annotations_by_unit
            .entry(annotation.task_id.clone())
            .or_default();
        if !ids.contains(&annotation.annotation_id) {
            ids.push(annotation.annotation_id.clone());
        }
        state
            .annotations
            .insert(annotation.annotation_id.clone(), annotation.clone());
        Ok(annotation)
    }

    async fn get_annotation(
        &self,
        annotation_id: &str,
    ) -> Result<Option<Annotation>, PipelineError> {
        Ok(self.state.read().await.annotations.get(annotation_id).cloned())
    }

    async fn latest_annotation_for(
        &self,
        data_id: &str,
    ) -> Result<Option<Annotation>, PipelineError> {
        let state = self.state.read().await;
        Ok(state
            .annotations_by_unit
            .get(data_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.annotations.get(id))
            .cloned())
    }

    async fn update_annotation_review(
        &self,
        annotation_id: &str,
        review: ReviewUpdate,
    ) -> Result<Annotation, PipelineError> {
        let mut state = self.state.write().await;
        let annotation = state
            .annotations
            .get_mut(annotation_id)
            .ok_or_else(|| PipelineError::not_found(format!("annotation {annotation_id}")))?;
        annotation.review_status = review.outcome;
        annotation.reviewer_id = Some(review.reviewer_id);
        annotation.review_comment = review.comment;
        annotation.reviewed_at = Some(review.reviewed_at);
        Ok(annotation.clone())
    }

    async fn expired_assignments(&self, now: DateTime<Utc>) -> Result<Vec<QAUnit>, PipelineError> {
        let state = self.state.read().await;
        Ok(state
            .units
            .values()
            .filter(|u| {
                u.status == TaskStatus::Assigned && u.expire_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }

    async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>, PipelineError> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for unit in state.units.values() {
            *counts.entry(unit.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn batch_summaries(&self) -> Result<Vec<BatchSummary>, PipelineError> {
        let state = self.state.read().await;
        let mut batches: HashMap<&str, BatchSummary> = HashMap::new();
        for unit in state.units.values() {
            let Some(batch_id) = unit.batch_id.as_deref() else {
                continue;
            };
            batches
                .entry(batch_id)
                .and_modify(|b| {
                    b.count += 1;
                    b.latest_created_at = b.latest_created_at.max(unit.created_at);
                })
                .or_insert_with(|| BatchSummary {
                    batch_id: batch_id.to_string(),
                    count: 1,
                    latest_created_at: unit.created_at,
                });
        }
        let mut summaries: Vec<BatchSummary> = batches.into_values().collect();
        summaries.sort_by(|a, b| b.latest_created_at.cmp(&a.latest_created_at));
        Ok(summaries)
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}
