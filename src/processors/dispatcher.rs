//! Dispatcher stage: persist, assign and publish tasks
//!
//! The dispatcher is the only writer that creates units in the task store.
//! It drops duplicates by content hash, resolves parent linkage against the
//! store, picks an annotator and publishes the stored unit to `pending`.
//!
//! A child that arrives before its parent is redelivered up to
//! `parent_wait_retries` times; after that it is stored without a parent and
//! reattached when the trace's root unit is stored.

use super::{Stage, StageProcessor};
use crate::cache::TraceCache;
use crate::config::DispatcherSection;
use crate::error::PipelineError;
use crate::model::{QAUnit, TaskStatus};
use crate::mq::{MessageQueue, MqMessage, Topic};
use crate::observability::metrics::metrics;
use crate::store::{TaskStore, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Picks the annotator for a new task
pub trait AssignmentStrategy: Send + Sync {
    /// `None` leaves the task pending
    fn pick(&self, unit: &QAUnit) -> Option<String>;
}

/// Cycles through a fixed annotator list
#[derive(Debug)]
pub struct RoundRobinStrategy {
    annotators: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new(annotators: Vec<String>) -> Self {
        Self {
            annotators,
            next: AtomicUsize::new(0),
        }
    }
}

impl AssignmentStrategy for RoundRobinStrategy {
    fn pick(&self, _unit: &QAUnit) -> Option<String> {
        if self.annotators.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.annotators.len();
        Some(self.annotators[index].clone())
    }
}

pub struct DispatcherProcessor {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn MessageQueue>,
    cache: Arc<dyn TraceCache>,
    strategy: Arc<dyn AssignmentStrategy>,
    config: DispatcherSection,
}

impl DispatcherProcessor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn MessageQueue>,
        cache: Arc<dyn TraceCache>,
        strategy: Arc<dyn AssignmentStrategy>,
        config: DispatcherSection,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            strategy,
            config,
        }
    }

    fn is_low_quality(&self, unit: &QAUnit) -> bool {
        unit.quality
            .as_ref()
            .is_some_and(|q| {
                !q.is_valid || !q.score.is_finite() || q.score < self.config.quality_threshold
            })
    }

    /// Settle `parent_id` against the store; errors ask for a redelivery
    async fn resolve_parent(
        &self,
        unit: &mut QAUnit,
        retry_count: u32,
    ) -> Result<(), PipelineError> {
        if unit.is_root() {
            unit.parent_id = None;
            return Ok(());
        }

        if let Some(parent_id) = unit.parent_id.clone() {
            if self.store.get_unit(&parent_id).await?.is_some() {
                return Ok(());
            }
            if retry_count < self.config.parent_wait_retries {
                return Err(PipelineError::transient(format!(
                    "parent {parent_id} of unit {} not stored yet",
                    unit.data_id
                )));
            }
            warn!(
                data_id = %unit.data_id,
                parent_id = %parent_id,
                "Parent never arrived, storing unit as orphan"
            );
            unit.parent_id = None;
        }

        // Parentless non-root: attach to the trace's root if one is stored
        let cached = self.cache.root_for_trace(&unit.source_trace_id);
        let root = match cached {
            Some(id) if self.store.get_unit(&id).await?.is_some() => Some(id),
            _ => self
                .store
                .units_for_trace(&unit.source_trace_id)
                .await?
                .into_iter()
                .find(|u| u.is_root())
                .map(|u| u.data_id),
        };
        if root.is_none() {
            metrics().orphan_stored();
        }
        unit.parent_id = root;
        Ok(())
    }

    /// Link parentless units of a trace to its newly stored root
    async fn reattach_orphans(&self, root: &QAUnit) -> Result<usize, PipelineError> {
        let orphans: Vec<QAUnit> = self
            .store
            .units_for_trace(&root.source_trace_id)
            .await?
            .into_iter()
            .filter(|u| !u.is_root() && u.parent_id.is_none())
            .collect();

        for orphan in &orphans {
            self.store
                .set_parent(&orphan.data_id, Some(root.data_id.clone()))
                .await?;
        }
        if !orphans.is_empty() {
            info!(
                root_id = %root.data_id,
                count = orphans.len(),
                "Reattached orphaned units to root"
            );
        }
        Ok(orphans.len())
    }

    async fn publish_pending(&self, unit: &QAUnit) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(unit)?;
        self.queue
            .publish(Topic::Pending, payload, unit.priority.value(), None)
            .await?;
        Ok(())
    }

    async fn assign(&self, unit: QAUnit) -> Result<QAUnit, PipelineError> {
        let Some(annotator) = self.strategy.pick(&unit) else {
            return Ok(unit);
        };
        let now = Utc::now();
        let expire_at = now + Duration::hours(self.config.expire_hours);
        self.store
            .transition(
                &unit.data_id,
                &[TaskStatus::Pending],
                Transition::to(TaskStatus::Assigned).assign(&annotator, now, expire_at),
            )
            .await
    }
}

#[async_trait]
impl StageProcessor for DispatcherProcessor {
    fn stage(&self) -> Stage {
        Stage::Dispatcher
    }

    async fn process(&self, message: &MqMessage) -> Result<(), PipelineError> {
        let mut unit: QAUnit = message.decode()?;

        if let Some(existing) = self.store.find_by_hash(&unit.content_hash).await? {
            if existing.data_id == unit.data_id
                && matches!(existing.status, TaskStatus::Pending | TaskStatus::Assigned)
            {
                // Redelivery after a failed publish; make sure it reaches `pending`
                return self.publish_pending(&existing).await;
            }
            debug!(
                data_id = %unit.data_id,
                existing_id = %existing.data_id,
                "Duplicate content hash, skipping"
            );
            metrics().duplicate_skipped();
            return Ok(());
        }

        self.resolve_parent(&mut unit, message.retry_count).await?;
        unit.low_quality = self.is_low_quality(&unit);

        let stored = match self.store.insert_unit(unit).await {
            Ok(stored) => stored,
            Err(PipelineError::Duplicate { content_hash }) => {
                debug!(content_hash = %content_hash, "Lost insert race, skipping");
                metrics().duplicate_skipped();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if stored.is_root() {
            self.cache
                .remember_root(&stored.source_trace_id, &stored.data_id);
            self.reattach_orphans(&stored).await?;
        }

        let stored = self.assign(stored).await?;
        self.publish_pending(&stored).await?;
        metrics().unit_dispatched();
        info!(
            data_id = %stored.data_id,
            status = %stored.status,
            assigned_to = stored.assigned_to.as_deref().unwrap_or("-"),
            low_quality = stored.low_quality,
            "Task dispatched"
        );
        Ok(())
    }
}

/// Reverts expired assignments to `pending`, optionally handing them to
/// the next annotator straight away
pub struct ExpirySweeper {
    store: Arc<dyn TaskStore>,
    interval: std::time::Duration,
    reassign: Option<(Arc<dyn AssignmentStrategy>, Duration)>,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn TaskStore>, interval: std::time::Duration) -> Self {
        Self {
            store,
            interval,
            reassign: None,
        }
    }

    pub fn with_reassignment(mut self, strategy: Arc<dyn AssignmentStrategy>, expire_hours: i64) -> Self {
        self.reassign = Some((strategy, Duration::hours(expire_hours)));
        self
    }

    /// One pass; returns the number of units reverted
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        let expired = self.store.expired_assignments(now).await?;
        let mut reverted = 0;
        let mut reassigned = 0;

        for unit in expired {
            let pending = match self
                .store
                .transition(
                    &unit.data_id,
                    &[TaskStatus::Assigned],
                    Transition::to(TaskStatus::Pending).clear_assignment(),
                )
                .await
            {
                Ok(pending) => pending,
                // Annotated in the meantime
                Err(PipelineError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            };
            reverted += 1;

            let Some((strategy, ttl)) = &self.reassign else {
                continue;
            };
            let Some(annotator) = strategy.pick(&pending) else {
                continue;
            };
            match self
                .store
                .transition(
                    &pending.data_id,
                    &[TaskStatus::Pending],
                    Transition::to(TaskStatus::Assigned).assign(&annotator, now, now + *ttl),
                )
                .await
            {
                Ok(_) => reassigned += 1,
                // Claimed or annotated by hand first
                Err(PipelineError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if reverted > 0 {
            metrics().assignments_expired(reverted as u64);
            info!(
                count = reverted,
                reassigned = reassigned,
                "Expired assignments returned to pending"
            );
        }
        Ok(reverted)
    }

    /// Sweep every interval until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        warn!(error = %e, "Expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTraceCache;
    use crate::config::MqSection;
    use crate::model::{Category, QualityAssessment, UnitDraft};
    use crate::mq::memory::MemoryQueue;
    use crate::store::memory::MemoryTaskStore;

    fn draft(trace: &str, question: &str, chain: usize) -> UnitDraft {
        let (caller, callee) = if chain == 2 {
            (Category::User, Category::Agent)
        } else {
            (Category::Agent, Category::Tool)
        };
        UnitDraft {
            trace_id: trace.to_string(),
            request_id: format!("{trace}-{question}"),
            group_id: String::new(),
            caller: "a".to_string(),
            callee: "b".to_string(),
            caller_category: caller,
            callee_category: callee,
            call_chain: (0..chain).map(|i| format!("n{i}")).collect(),
            question: question.to_string(),
            answer: "an answer long enough".to_string(),
            batch_id: None,
            parent_id: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryTaskStore>,
        queue: Arc<MemoryQueue>,
        dispatcher: DispatcherProcessor,
    }

    async fn fixture(annotators: &[&str]) -> Fixture {
        let store = Arc::new(MemoryTaskStore::new());
        let queue = Arc::new(MemoryQueue::new(MqSection::default()));
        queue.connect().await.unwrap();
        let cache = Arc::new(MemoryTraceCache::new(std::time::Duration::from_secs(60), 100));
        let strategy = Arc::new(RoundRobinStrategy::new(
            annotators.iter().map(|a| a.to_string()).collect(),
        ));
        let dispatcher = DispatcherProcessor::new(
            store.clone(),
            queue.clone(),
            cache,
            strategy,
            DispatcherSection::default(),
        );
        Fixture {
            store,
            queue,
            dispatcher,
        }
    }

    fn message(unit: &QAUnit, retry_count: u32) -> MqMessage {
        let mut message = MqMessage::new(
            Topic::Processed,
            serde_json::to_value(unit).unwrap(),
            unit.priority.value(),
        );
        message.retry_count = retry_count;
        message
    }

    // ========== Tests for assignment ==========

    #[test]
    fn test_round_robin_cycles() {
        let unit = draft("t", "q1", 3).into_unit();
        let strategy = RoundRobinStrategy::new(vec!["alice".into(), "bob".into()]);
        let picks: Vec<_> = (0..3).filter_map(|_| strategy.pick(&unit)).collect();
        assert_eq!(picks, vec!["alice", "bob", "alice"]);
        assert!(RoundRobinStrategy::new(Vec::new()).pick(&unit).is_none());
    }

    #[tokio::test]
    async fn test_dispatch_assigns_and_publishes() {
        let f = fixture(&["alice"]).await;
        let unit = draft("t1", "q", 2).into_root_unit();

        f.dispatcher.process(&message(&unit, 0)).await.unwrap();

        let stored = f.store.get_unit(&unit.data_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.assigned_to.as_deref(), Some("alice"));
        let window = stored.expire_at.unwrap() - stored.assigned_at.unwrap();
        assert_eq!(window, Duration::hours(24));

        let published: QAUnit = f.queue.retained(Topic::Pending)[0].decode().unwrap();
        assert_eq!(published.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_no_annotators_stays_pending() {
        let f = fixture(&[]).await;
        let unit = draft("t1", "q", 3).into_unit();
        f.dispatcher.process(&message(&unit, 0)).await.unwrap();
        let stored = f.store.get_unit(&unit.data_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.assigned_to.is_none());
    }

    // ========== Tests for dedup and quality ==========

    #[tokio::test]
    async fn test_duplicate_hash_acked_and_skipped() {
        let f = fixture(&[]).await;
        let first = draft("t1", "q", 3).into_unit();
        let second = draft("t1", "q", 3).into_unit();
        assert_eq!(first.content_hash, second.content_hash);

        f.dispatcher.process(&message(&first, 0)).await.unwrap();
        f.dispatcher.process(&message(&second, 0)).await.unwrap();

        assert!(f.store.get_unit(&second.data_id).await.unwrap().is_none());
        assert_eq!(f.queue.retained(Topic::Pending).len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_republishes_same_unit() {
        let f = fixture(&[]).await;
        let unit = draft("t1", "q", 3).into_unit();
        f.dispatcher.process(&message(&unit, 0)).await.unwrap();
        f.dispatcher.process(&message(&unit, 1)).await.unwrap();
        assert_eq!(f.queue.retained(Topic::Pending).len(), 2);
    }

    #[tokio::test]
    async fn test_low_quality_still_creates_task() {
        let f = fixture(&[]).await;
        let mut unit = draft("t1", "q", 3).into_unit();
        unit.quality = Some(QualityAssessment {
            score: 0.1,
            suggested_category: None,
            is_valid: true,
            summary: None,
        });
        f.dispatcher.process(&message(&unit, 0)).await.unwrap();
        let stored = f.store.get_unit(&unit.data_id).await.unwrap().unwrap();
        assert!(stored.low_quality);
    }

    #[tokio::test]
    async fn test_nan_score_is_low_quality() {
        let f = fixture(&[]).await;
        let mut unit = draft("t1", "q", 3).into_unit();
        unit.quality = Some(QualityAssessment {
            score: f64::NAN,
            suggested_category: None,
            is_valid: true,
            summary: None,
        });
        assert!(f.dispatcher.is_low_quality(&unit));

        unit.quality.as_mut().unwrap().score = 0.9;
        assert!(!f.dispatcher.is_low_quality(&unit));
    }

    // ========== Tests for parent linkage ==========

    #[tokio::test]
    async fn test_missing_parent_waits_then_orphans() {
        let f = fixture(&[]).await;
        let mut child = draft("t1", "child", 3);
        child.parent_id = Some("root-not-yet".to_string());
        let child = child.into_unit();

        let err = f.dispatcher.process(&message(&child, 0)).await.unwrap_err();
        assert!(err.is_retryable());

        f.dispatcher.process(&message(&child, 2)).await.unwrap();
        let stored = f.store.get_unit(&child.data_id).await.unwrap().unwrap();
        assert!(stored.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_root_reattaches_orphans() {
        let f = fixture(&[]).await;
        let child = draft("t1", "child", 3).into_unit();
        f.dispatcher.process(&message(&child, 0)).await.unwrap();

        let root = draft("t1", "root", 2).into_root_unit();
        f.dispatcher.process(&message(&root, 0)).await.unwrap();

        let stored = f.store.get_unit(&child.data_id).await.unwrap().unwrap();
        assert_eq!(stored.parent_id.as_deref(), Some(root.data_id.as_str()));
    }

    #[tokio::test]
    async fn test_child_after_root_links_from_store() {
        let f = fixture(&[]).await;
        let root = draft("t1", "root", 2).into_root_unit();
        f.dispatcher.process(&message(&root, 0)).await.unwrap();

        let child = draft("t1", "child", 3).into_unit();
        f.dispatcher.process(&message(&child, 0)).await.unwrap();
        let stored = f.store.get_unit(&child.data_id).await.unwrap().unwrap();
        assert_eq!(stored.parent_id.as_deref(), Some(root.data_id.as_str()));
    }

    // ========== Tests for expiry ==========

    #[tokio::test]
    async fn test_expiry_sweep_reverts_after_24h() {
        let f = fixture(&["alice"]).await;
        let unit = draft("t1", "q", 3).into_unit();
        f.dispatcher.process(&message(&unit, 0)).await.unwrap();

        let sweeper = ExpirySweeper::new(f.store.clone(), std::time::Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + Duration::hours(25);
        assert_eq!(sweeper.sweep_once(later).await.unwrap(), 1);
        let stored = f.store.get_unit(&unit.data_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.assigned_to.is_none());
        assert!(stored.expire_at.is_none());
    }

    #[tokio::test]
    async fn test_sweeper_hands_expired_unit_to_next_annotator() {
        let store = Arc::new(MemoryTaskStore::new());
        let unit = store
            .insert_unit(draft("t1", "q", 3).into_unit())
            .await
            .unwrap();
        let start = Utc::now();
        store
            .transition(
                &unit.data_id,
                &[TaskStatus::Pending],
                Transition::to(TaskStatus::Assigned).assign("alice", start, start + Duration::hours(24)),
            )
            .await
            .unwrap();

        let strategy = Arc::new(RoundRobinStrategy::new(vec!["bob".to_string()]));
        let sweeper = ExpirySweeper::new(store.clone(), std::time::Duration::from_secs(60))
            .with_reassignment(strategy, 24);
        let later = start + Duration::hours(25);
        assert_eq!(sweeper.sweep_once(later).await.unwrap(), 1);

        let stored = store.get_unit(&unit.data_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.assigned_to.as_deref(), Some("bob"));
        assert_eq!(stored.expire_at, Some(later + Duration::hours(24)));
        assert_eq!(
            stored.status_path(),
            vec![TaskStatus::Pending, TaskStatus::Assigned, TaskStatus::Pending, TaskStatus::Assigned]
        );
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let store = Arc::new(MemoryTaskStore::new());
        let sweeper = ExpirySweeper::new(store, std::time::Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sweeper.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
