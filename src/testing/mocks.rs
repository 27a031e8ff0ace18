//! Mock implementations for testing
//!
//! Provides mock QualityScorer, KnowledgeSink, TraceStore and MessageHandler
//! implementations to exercise the pipeline without external services.

use crate::error::PipelineError;
use crate::model::{Category, KnowledgeEntry, QualityAssessment};
use crate::mq::{MessageHandler, MqMessage};
use crate::processors::{KnowledgeSink, QualityScorer};
use crate::trace::{CallRecord, RootRecord, TimeWindow, TraceStore};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Mock quality scorer returning a fixed score
#[derive(Debug, Default)]
pub struct MockQualityScorer {
    pub score: f64,
    pub calls: Arc<Mutex<Vec<(String, String)>>>,
    pub should_fail: bool,
}

impl MockQualityScorer {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            ..Default::default()
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl QualityScorer for MockQualityScorer {
    async fn score(&self, question: &str, answer: &str) -> Result<QualityAssessment, PipelineError> {
        self.calls
            .lock()
            .await
            .push((question.to_string(), answer.to_string()));

        if self.should_fail {
            return Err(PipelineError::transient("mock scorer unavailable"));
        }

        Ok(QualityAssessment {
            score: self.score,
            suggested_category: Some("general".to_string()),
            is_valid: true,
            summary: None,
        })
    }
}

/// Mock knowledge sink recording every ingested entry
#[derive(Debug, Default)]
pub struct MockKnowledgeSink {
    pub ingested: Arc<Mutex<Vec<KnowledgeEntry>>>,
    pub attempts: Arc<Mutex<usize>>,
    pub should_fail: bool,
}

impl MockKnowledgeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_ingested(&self) -> Vec<KnowledgeEntry> {
        self.ingested.lock().await.clone()
    }

    pub async fn attempts(&self) -> usize {
        *self.attempts.lock().await
    }
}

#[async_trait]
impl KnowledgeSink for MockKnowledgeSink {
    async fn ingest(&self, entry: &KnowledgeEntry) -> Result<Option<String>, PipelineError> {
        *self.attempts.lock().await += 1;
        if self.should_fail {
            return Err(PipelineError::transient("mock kb unavailable"));
        }
        self.ingested.lock().await.push(entry.clone());
        Ok(Some(format!("doc-{}", entry.data_id)))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Trace store whose every query fails
#[derive(Debug, Default)]
pub struct FailingTraceStore;

impl FailingTraceStore {
    pub fn new() -> Self {
        Self
    }

    fn failure<T>() -> Result<T, PipelineError> {
        Err(PipelineError::transient("mock trace store unreachable"))
    }
}

#[async_trait]
impl TraceStore for FailingTraceStore {
    async fn count_roots(&self, _window: &TimeWindow) -> Result<usize, PipelineError> {
        Self::failure()
    }

    async fn count_calls(
        &self,
        _window: &TimeWindow,
        _categories: &[Category],
    ) -> Result<usize, PipelineError> {
        Self::failure()
    }

    async fn query_roots(
        &self,
        _window: &TimeWindow,
        _limit: usize,
    ) -> Result<Vec<RootRecord>, PipelineError> {
        Self::failure()
    }

    async fn query_calls_for_trace(
        &self,
        _trace_id: &str,
    ) -> Result<Vec<CallRecord>, PipelineError> {
        Self::failure()
    }

    async fn query_calls(
        &self,
        _window: &TimeWindow,
        _categories: &[Category],
        _limit: usize,
    ) -> Result<Vec<CallRecord>, PipelineError> {
        Self::failure()
    }

    async fn available_range(&self) -> Result<Option<TimeWindow>, PipelineError> {
        Self::failure()
    }
}

/// Message handler recording deliveries; fails the first `fail_times` calls
#[derive(Debug, Default)]
pub struct MockHandler {
    pub received: Arc<Mutex<Vec<MqMessage>>>,
    pub fail_times: usize,
    pub retryable: bool,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every delivery with a retryable error
    pub fn always_failing() -> Self {
        Self {
            fail_times: usize::MAX,
            retryable: true,
            ..Default::default()
        }
    }

    /// Fail every delivery with a non-retryable error
    pub fn rejecting() -> Self {
        Self {
            fail_times: usize::MAX,
            retryable: false,
            ..Default::default()
        }
    }

    pub async fn get_received(&self) -> Vec<MqMessage> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl MessageHandler for MockHandler {
    async fn handle(&self, message: &MqMessage) -> Result<(), PipelineError> {
        let mut received = self.received.lock().await;
        received.push(message.clone());
        if received.len() <= self.fail_times {
            if self.retryable {
                return Err(PipelineError::transient("mock handler failure"));
            }
            return Err(PipelineError::validation("mock handler rejected message"));
        }
        Ok(())
    }
}
