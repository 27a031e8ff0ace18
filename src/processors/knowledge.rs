//! Knowledge stage: final sink for approved units
//!
//! Each entry gets exactly one ingest attempt. Failures are recorded on the
//! unit as `kb_failed` and only a manual re-trigger sends it again.

use super::{Stage, StageProcessor};
use crate::config::KnowledgeSection;
use crate::error::PipelineError;
use crate::model::{KnowledgeEntry, TaskStatus};
use crate::mq::MqMessage;
use crate::observability::metrics::metrics;
use crate::store::{TaskStore, Transition};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Destination for reviewed QA pairs
#[async_trait]
pub trait KnowledgeSink: Send + Sync {
    /// Ingest one entry; returns the sink's document id when it reports one
    async fn ingest(&self, entry: &KnowledgeEntry) -> Result<Option<String>, PipelineError>;

    fn name(&self) -> &'static str;
}

/// Sink used when knowledge-base publishing is not configured
#[derive(Debug, Default)]
pub struct DisabledKnowledgeSink;

#[async_trait]
impl KnowledgeSink for DisabledKnowledgeSink {
    async fn ingest(&self, entry: &KnowledgeEntry) -> Result<Option<String>, PipelineError> {
        Err(PipelineError::validation(format!(
            "knowledge-base publishing is disabled; {} not ingested",
            entry.data_id
        )))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    question: &'a str,
    answer: &'a str,
    score: Option<f64>,
    caller: &'a str,
    callee: &'a str,
    remark: Option<&'a str>,
    source_trace_id: &'a str,
    source_request_id: &'a str,
    data_type: &'a str,
    priority: u8,
    category: Option<&'a str>,
}

impl<'a> From<&'a KnowledgeEntry> for IngestRequest<'a> {
    fn from(entry: &'a KnowledgeEntry) -> Self {
        Self {
            question: &entry.question,
            answer: &entry.answer,
            score: entry.score,
            caller: &entry.caller,
            callee: &entry.callee,
            remark: entry.remark.as_deref(),
            source_trace_id: &entry.source_trace_id,
            source_request_id: &entry.source_request_id,
            data_type: entry.source_type.as_str(),
            priority: entry.priority.value(),
            category: entry.category.as_deref(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct IngestResponse {
    doc_id: Option<String>,
    id: Option<String>,
}

/// Posts entries to `{endpoint}/api/v1/kb_base/{kb_id}/ingest_data`
pub struct HttpKnowledgeSink {
    client: Client,
    ingest_url: String,
    api_key: Option<String>,
}

impl HttpKnowledgeSink {
    pub fn new(
        endpoint: &str,
        kb_id: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let base = url::Url::parse(endpoint).map_err(|e| {
            PipelineError::validation(format!("invalid knowledge endpoint {endpoint}: {e}"))
        })?;
        let ingest_url = format!(
            "{}/api/v1/kb_base/{kb_id}/ingest_data",
            base.as_str().trim_end_matches('/')
        );
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::transient(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            ingest_url,
            api_key,
        })
    }

    /// Build from config; `None` when publishing is disabled
    pub fn from_config(
        config: &KnowledgeSection,
        api_key: Option<String>,
    ) -> Result<Option<Self>, PipelineError> {
        match (config.enabled, &config.endpoint, &config.kb_id) {
            (true, Some(endpoint), Some(kb_id)) => Ok(Some(Self::new(
                endpoint,
                kb_id,
                api_key,
                Duration::from_millis(config.timeout_ms),
            )?)),
            _ => Ok(None),
        }
    }

    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }
}

#[async_trait]
impl KnowledgeSink for HttpKnowledgeSink {
    async fn ingest(&self, entry: &KnowledgeEntry) -> Result<Option<String>, PipelineError> {
        let mut request = self
            .client
            .post(&self.ingest_url)
            .json(&IngestRequest::from(entry));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("knowledge-base request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::transient(format!(
                "knowledge base returned {status}: {body}"
            )));
        }

        // A success without a readable body still counts
        let parsed: IngestResponse = response.json().await.unwrap_or_default();
        Ok(parsed.doc_id.or(parsed.id))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

pub struct KnowledgeProcessor {
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn KnowledgeSink>,
}

impl KnowledgeProcessor {
    pub fn new(store: Arc<dyn TaskStore>, sink: Arc<dyn KnowledgeSink>) -> Self {
        Self { store, sink }
    }

    /// Ingest an approved unit; units in any other status are left alone
    pub async fn ingest(&self, entry: &KnowledgeEntry) -> Result<TaskStatus, PipelineError> {
        let unit = self
            .store
            .get_unit(&entry.data_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("unit {}", entry.data_id)))?;

        if unit.status != TaskStatus::Approved {
            debug!(data_id = %unit.data_id, status = %unit.status, "Entry already settled");
            return Ok(unit.status);
        }
        self.attempt(&unit.data_id, unit.status, entry).await
    }

    async fn attempt(
        &self,
        data_id: &str,
        from: TaskStatus,
        entry: &KnowledgeEntry,
    ) -> Result<TaskStatus, PipelineError> {
        match self.sink.ingest(entry).await {
            Ok(doc_id) => {
                self.store
                    .transition(data_id, &[from], Transition::to(TaskStatus::KbIngested))
                    .await?;
                metrics().kb_ingested();
                info!(
                    data_id = data_id,
                    sink = self.sink.name(),
                    doc_id = doc_id.as_deref().unwrap_or("-"),
                    "Unit ingested into knowledge base"
                );
                Ok(TaskStatus::KbIngested)
            }
            Err(e) => {
                metrics().kb_failed();
                warn!(data_id = data_id, sink = self.sink.name(), error = %e, "Knowledge-base ingest failed");
                // kb_failed cannot be re-entered, so a failed re-trigger keeps the first error
                if from == TaskStatus::Approved {
                    self.store
                        .transition(
                            data_id,
                            &[TaskStatus::Approved],
                            Transition::to(TaskStatus::KbFailed).kb_error(e.sanitized()),
                        )
                        .await?;
                }
                Ok(TaskStatus::KbFailed)
            }
        }
    }

    /// Manual re-send of a `kb_failed` unit from its latest annotation
    pub async fn retrigger(&self, data_id: &str) -> Result<TaskStatus, PipelineError> {
        let unit = self
            .store
            .get_unit(data_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("unit {data_id}")))?;
        if unit.status != TaskStatus::KbFailed {
            return Err(PipelineError::conflict(
                data_id,
                &[TaskStatus::KbFailed],
                unit.status,
            ));
        }

        let annotation = self
            .store
            .latest_annotation_for(data_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("annotation for unit {data_id}")))?;
        info!(data_id = data_id, "Re-triggering knowledge-base ingest");
        let entry = KnowledgeEntry::from_reviewed(&unit, &annotation);
        self.attempt(data_id, TaskStatus::KbFailed, &entry).await
    }
}

#[async_trait]
impl StageProcessor for KnowledgeProcessor {
    fn stage(&self) -> Stage {
        Stage::Knowledge
    }

    async fn process(&self, message: &MqMessage) -> Result<(), PipelineError> {
        let entry: KnowledgeEntry = message.decode()?;
        self.ingest(&entry).await.map(|_| ())
    }
}
