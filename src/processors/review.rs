//! Review stage: route reviewer decisions
//!
//! The task service applies the approve/reject status change before the
//! decision is published, so this stage only routes. A decision whose unit
//! has already moved on is acknowledged without effect. Annotation
//! submissions arrive here too, as decisions with a `pending` outcome.

use super::{Stage, StageProcessor};
use crate::config::ReviewSection;
use crate::error::PipelineError;
use crate::model::{KnowledgeEntry, QAUnit, ReviewDecision, ReviewOutcome, TaskStatus};
use crate::mq::{MessageQueue, MqMessage, Topic};
use crate::store::{TaskStore, Transition};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ReviewProcessor {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn MessageQueue>,
    config: ReviewSection,
}

impl ReviewProcessor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn MessageQueue>,
        config: ReviewSection,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    async fn route_approval(
        &self,
        unit: &QAUnit,
        decision: &ReviewDecision,
    ) -> Result<(), PipelineError> {
        match unit.status {
            TaskStatus::Approved => {}
            TaskStatus::KbIngested | TaskStatus::KbFailed => {
                debug!(data_id = %unit.data_id, "Approval already routed");
                return Ok(());
            }
            other => {
                return Err(PipelineError::conflict(
                    &unit.data_id,
                    &[TaskStatus::Approved],
                    other,
                ))
            }
        }

        if !decision.add_to_kb {
            info!(data_id = %unit.data_id, "Unit approved without knowledge-base publishing");
            return Ok(());
        }

        let annotation = self
            .store
            .get_annotation(&decision.annotation_id)
            .await?
            .ok_or_else(|| {
                PipelineError::not_found(format!("annotation {}", decision.annotation_id))
            })?;
        let entry = KnowledgeEntry::from_reviewed(unit, &annotation);
        self.queue
            .publish(
                Topic::Knowledge,
                serde_json::to_value(&entry)?,
                unit.priority.value(),
                None,
            )
            .await?;
        info!(data_id = %unit.data_id, "Approved unit sent to knowledge stage");
        Ok(())
    }

    async fn route_rejection(&self, unit: &QAUnit) -> Result<(), PipelineError> {
        if unit.status != TaskStatus::Rejected {
            debug!(data_id = %unit.data_id, status = %unit.status, "Rejection already routed");
            return Ok(());
        }

        // retry_count counts returns to pending, so cancelling leaves it as is
        let transition = if unit.retry_count >= self.config.max_retry_count {
            Transition::to(TaskStatus::Cancelled)
        } else {
            Transition::to(TaskStatus::Pending)
                .clear_assignment()
                .bump_retry()
        };

        let updated = match self
            .store
            .transition(&unit.data_id, &[TaskStatus::Rejected], transition)
            .await
        {
            Ok(updated) => updated,
            Err(PipelineError::Conflict { .. }) => {
                debug!(data_id = %unit.data_id, "Rejection routed concurrently");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if updated.status == TaskStatus::Pending {
            self.queue
                .publish(
                    Topic::Pending,
                    serde_json::to_value(&updated)?,
                    updated.priority.value(),
                    None,
                )
                .await?;
            info!(
                data_id = %updated.data_id,
                retry_count = updated.retry_count,
                "Rejected unit returned to pending"
            );
        } else {
            info!(
                data_id = %updated.data_id,
                retry_count = updated.retry_count,
                "Unit cancelled after repeated rejection"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl StageProcessor for ReviewProcessor {
    fn stage(&self) -> Stage {
        Stage::Review
    }

    async fn process(&self, message: &MqMessage) -> Result<(), PipelineError> {
        let decision: ReviewDecision = message.decode()?;
        let unit = self
            .store
            .get_unit(&decision.data_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("unit {}", decision.data_id)))?;

        match decision.outcome {
            ReviewOutcome::Approved => self.route_approval(&unit, &decision).await,
            ReviewOutcome::Rejected => self.route_rejection(&unit).await,
            // Submission notice; nothing to route until a reviewer decides
            ReviewOutcome::Pending => {
                info!(
                    data_id = %decision.data_id,
                    annotation_id = %decision.annotation_id,
                    status = %unit.status,
                    "Annotation awaiting review"
                );
                Ok(())
            }
        }
    }
}
