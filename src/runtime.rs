//! Pipeline runtime: wiring, stage consumers and graceful shutdown
//!
//! [`PipelineRuntime::build`] turns a [`PipelineConfig`] into connected
//! components. [`PipelineRuntime::start`] spawns `instances_per_stage`
//! consumer loops per stage (all in the stage's consumer group) plus the
//! expiry sweeper. [`PipelineRuntime::shutdown`] signals every loop, waits
//! for in-flight batches to settle and disconnects, bounded by
//! `shutdown_timeout_secs`.

use crate::cache::{MemoryTraceCache, TraceCache};
use crate::collector::Collector;
use crate::config::{PipelineConfig, StoreBackendKind, StoreSection};
use crate::error::PipelineError;
use crate::health::{HealthCheckManager, MqHealthCheck, TaskStoreHealthCheck, TraceStoreHealthCheck};
use crate::importer::Importer;
use crate::mq::{connect_backend, MessageQueue};
use crate::observability::metrics::metrics;
use crate::processors::{
    AssignmentStrategy, DisabledKnowledgeSink, DispatcherProcessor, ExpirySweeper, HttpKnowledgeSink,
    HttpQualityScorer, KnowledgeProcessor, KnowledgeSink, PassthroughQuality, QualityEnricher,
    QualityProcessor, ReviewProcessor, RoundRobinStrategy, ScoringQuality, StageHandler,
    StageProcessor,
};
use crate::service::TaskService;
use crate::store::memory::MemoryTaskStore;
use crate::store::sqlite::SqliteTaskStore;
use crate::store::TaskStore;
use crate::trace::jsonl::JsonlTraceStore;
use crate::trace::TraceStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pluggable parts of a pipeline; everything else is derived from config
pub struct PipelineParts {
    pub queue: Arc<dyn MessageQueue>,
    pub store: Arc<dyn TaskStore>,
    pub cache: Arc<dyn TraceCache>,
    pub enricher: Arc<dyn QualityEnricher>,
    pub sink: Arc<dyn KnowledgeSink>,
    pub traces: Option<Arc<dyn TraceStore>>,
}

pub struct PipelineRuntime {
    config: PipelineConfig,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn TaskStore>,
    cache: Arc<dyn TraceCache>,
    traces: Option<Arc<dyn TraceStore>>,
    processors: Vec<Arc<dyn StageProcessor>>,
    strategy: Arc<dyn AssignmentStrategy>,
    knowledge: Arc<KnowledgeProcessor>,
    health_checks: Arc<HealthCheckManager>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl PipelineRuntime {
    /// Assemble a runtime from explicit parts
    pub fn new(config: PipelineConfig, parts: PipelineParts) -> Self {
        let PipelineParts {
            queue,
            store,
            cache,
            enricher,
            sink,
            traces,
        } = parts;

        let knowledge = Arc::new(KnowledgeProcessor::new(store.clone(), sink));
        let strategy: Arc<dyn AssignmentStrategy> =
            Arc::new(RoundRobinStrategy::new(config.dispatcher.annotators.clone()));
        let processors: Vec<Arc<dyn StageProcessor>> = vec![
            Arc::new(QualityProcessor::new(queue.clone(), enricher)),
            Arc::new(DispatcherProcessor::new(
                store.clone(),
                queue.clone(),
                cache.clone(),
                strategy.clone(),
                config.dispatcher.clone(),
            )),
            Arc::new(ReviewProcessor::new(
                store.clone(),
                queue.clone(),
                config.review.clone(),
            )),
            knowledge.clone(),
        ];

        let mut health_checks = HealthCheckManager::new();
        health_checks.add_health_check(Box::new(MqHealthCheck::new(queue.clone())));
        health_checks.add_health_check(Box::new(TaskStoreHealthCheck::new(store.clone())));
        if let Some(traces) = &traces {
            health_checks.add_health_check(Box::new(TraceStoreHealthCheck::new(traces.clone())));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            queue,
            store,
            cache,
            traces,
            processors,
            strategy,
            knowledge,
            health_checks: Arc::new(health_checks),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Build every component from configuration
    pub async fn build(config: PipelineConfig) -> Result<Self, PipelineError> {
        let queue = connect_backend(&config.mq)?;
        let cache: Arc<dyn TraceCache> = Arc::new(MemoryTraceCache::new(
            Duration::from_secs(config.runtime.cache_ttl_secs),
            config.runtime.cache_max_entries,
        ));

        let enricher: Arc<dyn QualityEnricher> = match (config.quality.enabled, &config.quality.endpoint)
        {
            (true, Some(endpoint)) => {
                let scorer = HttpQualityScorer::new(
                    endpoint,
                    config.get_quality_api_key()?,
                    Duration::from_millis(config.quality.timeout_ms),
                )?;
                Arc::new(ScoringQuality::new(Arc::new(scorer), &config.quality))
            }
            _ => Arc::new(PassthroughQuality),
        };

        let knowledge_key = config.get_knowledge_api_key()?;
        let sink: Arc<dyn KnowledgeSink> =
            match HttpKnowledgeSink::from_config(&config.knowledge, knowledge_key)? {
                Some(sink) => Arc::new(sink),
                None => Arc::new(DisabledKnowledgeSink),
            };

        let store = open_task_store(&config.store).await?;
        let traces = JsonlTraceStore::open(&config.trace_store.path).await?;
        info!(
            backend = queue.backend_name(),
            store = %config.store.backend,
            quality = enricher.name(),
            knowledge = sink.name(),
            trace_dir = %config.trace_store.path,
            "Pipeline components built"
        );

        let parts = PipelineParts {
            queue,
            store,
            cache,
            enricher,
            sink,
            traces: Some(Arc::new(traces)),
        };
        Ok(Self::new(config, parts))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<dyn MessageQueue> {
        self.queue.clone()
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn health_checks(&self) -> Arc<HealthCheckManager> {
        self.health_checks.clone()
    }

    /// Receiver that flips to true when shutdown begins
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn service(&self) -> TaskService {
        let service = TaskService::new(self.store.clone(), self.queue.clone(), self.knowledge.clone())
            .with_expire_hours(self.config.dispatcher.expire_hours);
        match &self.traces {
            Some(traces) => service.with_trace_store(traces.clone()),
            None => service,
        }
    }

    pub fn collector(&self) -> Arc<Collector> {
        Arc::new(Collector::new(
            self.queue.clone(),
            self.cache.clone(),
            self.config.collector.clone(),
        ))
    }

    /// Importer over the configured trace store
    pub fn importer(&self) -> Result<Importer, PipelineError> {
        let traces = self
            .traces
            .clone()
            .ok_or_else(|| PipelineError::not_found("trace store"))?;
        Ok(Importer::new(
            traces,
            self.store.clone(),
            self.queue.clone(),
            self.cache.clone(),
            self.config.importer.rules.clone(),
        ))
    }

    /// Connect the queue and spawn stage consumers and the expiry sweeper
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        metrics().set_pipeline_state("starting");
        self.queue.connect().await?;

        let batch_size = self.config.runtime.batch_size;
        for processor in &self.processors {
            let stage = processor.stage();
            let handler = Arc::new(StageHandler::new(processor.clone()));
            for instance in 0..self.config.runtime.instances_per_stage {
                let queue = self.queue.clone();
                let handler = handler.clone();
                let shutdown = self.shutdown_tx.subscribe();
                let group = stage.consumer_group();
                self.handles.push(tokio::spawn(async move {
                    if let Err(e) = queue
                        .subscribe(stage.input_topic(), &group, handler, batch_size, shutdown)
                        .await
                    {
                        error!(stage = stage.as_str(), instance = instance, error = %e, "Stage consumer failed");
                    }
                }));
            }
            info!(
                stage = stage.as_str(),
                topic = %stage.input_topic(),
                instances = self.config.runtime.instances_per_stage,
                "Stage started"
            );
        }

        let sweeper = ExpirySweeper::new(
            self.store.clone(),
            Duration::from_secs(self.config.dispatcher.sweep_interval_secs.max(1)),
        )
        .with_reassignment(self.strategy.clone(), self.config.dispatcher.expire_hours);
        let shutdown = self.shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(async move { sweeper.run(shutdown).await }));

        metrics().set_pipeline_state("running");
        info!(instance_id = %self.config.runtime.instance_id, "Pipeline running");
        Ok(())
    }

    /// Stop consumers, drain in-flight batches and disconnect. Exceeding
    /// `shutdown_timeout_secs` aborts the remaining tasks and fails.
    pub async fn shutdown(&mut self) -> Result<(), PipelineError> {
        metrics().set_pipeline_state("stopping");
        info!("Pipeline shutdown initiated");
        let _ = self.shutdown_tx.send(true);

        let timeout = Duration::from_secs(self.config.runtime.shutdown_timeout_secs);
        let handles = std::mem::take(&mut self.handles);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = tokio::time::timeout(timeout, async {
            for handle in handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "Pipeline task ended abnormally");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            for abort in aborts {
                abort.abort();
            }
            metrics().set_pipeline_state("error");
            return Err(PipelineError::transient(format!(
                "shutdown did not complete within {}s",
                timeout.as_secs()
            )));
        }

        if let Err(e) = self.queue.disconnect().await {
            warn!(error = %e, "Queue disconnect failed");
        }
        metrics().set_pipeline_state("stopped");
        info!("Pipeline shutdown complete");
        Ok(())
    }
}

/// Open the configured task store
pub async fn open_task_store(section: &StoreSection) -> Result<Arc<dyn TaskStore>, PipelineError> {
    let store: Arc<dyn TaskStore> = match section.backend_kind()? {
        StoreBackendKind::Memory => Arc::new(MemoryTaskStore::new()),
        StoreBackendKind::Sqlite => Arc::new(SqliteTaskStore::open(&section.path).await?),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqSection;
    use crate::mq::memory::MemoryQueue;
    use crate::testing::mocks::MockKnowledgeSink;

    fn runtime() -> PipelineRuntime {
        let config = PipelineConfig::test_config();
        let parts = PipelineParts {
            queue: Arc::new(MemoryQueue::new(MqSection {
                poll_interval_ms: 5,
                ..MqSection::default()
            })),
            store: Arc::new(MemoryTaskStore::new()),
            cache: Arc::new(MemoryTraceCache::new(Duration::from_secs(60), 100)),
            enricher: Arc::new(PassthroughQuality),
            sink: Arc::new(MockKnowledgeSink::new()),
            traces: None,
        };
        PipelineRuntime::new(config, parts)
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut runtime = runtime();
        let mut signal = runtime.shutdown_signal();
        runtime.start().await.unwrap();
        assert!(runtime.queue().health_check().await);

        runtime.shutdown().await.unwrap();
        assert!(*signal.borrow_and_update());
        assert!(!runtime.queue().health_check().await);
    }

    #[tokio::test]
    async fn test_importer_requires_trace_store() {
        let runtime = runtime();
        assert!(matches!(runtime.importer(), Err(PipelineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_health_checks_registered() {
        let runtime = runtime();
        let results = runtime.health_checks().run_health_checks().await;
        let names: Vec<_> = results.iter().map(|r| r.component.as_str()).collect();
        assert_eq!(names, vec!["message_queue", "task_store"]);
    }

    #[tokio::test]
    async fn test_build_from_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::test_config();
        config.trace_store.path = dir.path().to_string_lossy().to_string();
        let runtime = PipelineRuntime::build(config).await.unwrap();
        assert!(runtime.importer().is_ok());
        assert_eq!(runtime.health_checks().run_health_checks().await.len(), 3);
    }

    #[tokio::test]
    async fn test_sqlite_store_selected_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let section = StoreSection {
            backend: "sqlite".to_string(),
            path: dir.path().join("tasks.db").to_string_lossy().to_string(),
        };
        let store = open_task_store(&section).await.unwrap();
        store.ping().await.unwrap();
        assert!(dir.path().join("tasks.db").exists());

        let unknown = StoreSection {
            backend: "redis".to_string(),
            ..StoreSection::default()
        };
        assert!(matches!(
            open_task_store(&unknown).await,
            Err(PipelineError::Configuration(_))
        ));
    }
}
