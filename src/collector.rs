//! Realtime collection at call completion
//!
//! The collector is invoked from the agent runtime's completion path. It must
//! never slow down or fail its caller: every rejection is logged and counted,
//! and publishing is bounded by `publish_timeout_ms`.

use crate::cache::TraceCache;
use crate::config::CollectorSection;
use crate::model::QAUnit;
use crate::mq::{MessageQueue, Topic};
use crate::observability::metrics::metrics;
use crate::trace::CallRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Why a completed call was not collected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NotCompleted,
    ExcludedCallee,
    ExcludedCategory,
    InvalidContent(String),
    AlreadySeen,
}

pub struct Collector {
    queue: Arc<dyn MessageQueue>,
    cache: Arc<dyn TraceCache>,
    config: CollectorSection,
}

impl Collector {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        cache: Arc<dyn TraceCache>,
        config: CollectorSection,
    ) -> Self {
        Self {
            queue,
            cache,
            config,
        }
    }

    /// Filter a record and build its unit, resolving the parent from the cache
    pub fn prepare(&self, record: &CallRecord) -> Result<QAUnit, SkipReason> {
        if !self.config.enabled {
            return Err(SkipReason::Disabled);
        }
        if !record.is_completed() {
            return Err(SkipReason::NotCompleted);
        }
        if self.config.exclude_callees.iter().any(|c| c == &record.callee) {
            return Err(SkipReason::ExcludedCallee);
        }
        let category = record.callee_category.as_str();
        if self
            .config
            .exclude_callee_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(category))
        {
            return Err(SkipReason::ExcludedCategory);
        }

        let parent = if record.is_user_call() {
            None
        } else {
            self.cache.root_for_trace(&record.trace_id)
        };
        let draft = record.to_draft(None, parent);
        self.config
            .rules()
            .check(&draft.question, &draft.answer)
            .map_err(|e| SkipReason::InvalidContent(e.to_string()))?;
        if self.cache.seen_hash(&draft.content_hash()) {
            return Err(SkipReason::AlreadySeen);
        }

        Ok(draft.into_unit())
    }

    /// Collect one completed call; returns the published `data_id`
    pub async fn on_call_completed(&self, record: &CallRecord) -> Option<String> {
        let unit = match self.prepare(record) {
            Ok(unit) => unit,
            Err(SkipReason::Disabled) => return None,
            Err(reason) => {
                debug!(
                    trace_id = %record.trace_id,
                    callee = %record.callee,
                    reason = ?reason,
                    "Call not collected"
                );
                metrics().collector_dropped();
                return None;
            }
        };

        let payload = match serde_json::to_value(&unit) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(data_id = %unit.data_id, error = %e, "Unit serialization failed");
                metrics().collector_dropped();
                return None;
            }
        };

        let timeout = Duration::from_millis(self.config.publish_timeout_ms);
        let published = tokio::time::timeout(
            timeout,
            self.queue
                .publish(Topic::Raw, payload, unit.priority.value(), None),
        )
        .await;

        match published {
            Ok(Ok(_)) => {
                self.cache.remember_hash(&unit.content_hash, &unit.data_id);
                if unit.is_root() {
                    self.cache
                        .remember_root(&unit.source_trace_id, &unit.data_id);
                }
                metrics().unit_collected();
                debug!(
                    data_id = %unit.data_id,
                    trace_id = %unit.source_trace_id,
                    priority = unit.priority.value(),
                    "Unit collected"
                );
                Some(unit.data_id)
            }
            Ok(Err(e)) => {
                warn!(data_id = %unit.data_id, error = %e, "Collector publish failed");
                metrics().collector_dropped();
                None
            }
            Err(_) => {
                warn!(
                    data_id = %unit.data_id,
                    timeout_ms = self.config.publish_timeout_ms,
                    "Collector publish timed out"
                );
                metrics().collector_dropped();
                None
            }
        }
    }

    /// Fire-and-forget variant for callers that must not await
    pub fn spawn_collect(self: Arc<Self>, record: CallRecord) -> JoinHandle<Option<String>> {
        tokio::spawn(async move { self.on_call_completed(&record).await })
    }
}
