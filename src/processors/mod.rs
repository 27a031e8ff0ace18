//! Stage processors
//!
//! Each stage consumes one topic as a consumer group and forwards to the next:
//!
//! | Stage      | Consumes    | Produces     |
//! |------------|-------------|--------------|
//! | quality    | `raw`       | `processed`  |
//! | dispatcher | `processed` | `pending`    |
//! | review     | `review`    | `knowledge`, `pending` |
//! | knowledge  | `knowledge` | (sink)       |
//!
//! Processors implement [`StageProcessor`]; [`StageHandler`] adapts one to the
//! queue's [`MessageHandler`] with a span and per-stage timing.

pub mod dispatcher;
pub mod knowledge;
pub mod quality;
pub mod review;

use crate::error::PipelineError;
use crate::mq::{MessageHandler, MqMessage, Topic};
use crate::observability::metrics::metrics;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, Instrument};

pub use dispatcher::{AssignmentStrategy, DispatcherProcessor, ExpirySweeper, RoundRobinStrategy};
pub use knowledge::{
    DisabledKnowledgeSink, HttpKnowledgeSink, KnowledgeProcessor, KnowledgeSink,
};
pub use quality::{
    HttpQualityScorer, PassthroughQuality, QualityEnricher, QualityProcessor, QualityScorer,
    ScoringQuality,
};
pub use review::ReviewProcessor;

/// Pipeline stages, in flow order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Quality,
    Dispatcher,
    Review,
    Knowledge,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Quality,
        Stage::Dispatcher,
        Stage::Review,
        Stage::Knowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Quality => "quality",
            Stage::Dispatcher => "dispatcher",
            Stage::Review => "review",
            Stage::Knowledge => "knowledge",
        }
    }

    pub fn input_topic(&self) -> Topic {
        match self {
            Stage::Quality => Topic::Raw,
            Stage::Dispatcher => Topic::Processed,
            Stage::Review => Topic::Review,
            Stage::Knowledge => Topic::Knowledge,
        }
    }

    /// Consumer group shared by every instance of the stage
    pub fn consumer_group(&self) -> String {
        format!("{}-processor", self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline stage's message handling
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Handle one delivery. Must be idempotent: the same message may arrive
    /// again after a crash or a failed ack.
    async fn process(&self, message: &MqMessage) -> Result<(), PipelineError>;
}

/// Adapts a [`StageProcessor`] to the queue's handler interface
pub struct StageHandler {
    processor: Arc<dyn StageProcessor>,
}

impl StageHandler {
    pub fn new(processor: Arc<dyn StageProcessor>) -> Self {
        Self { processor }
    }

    pub fn stage(&self) -> Stage {
        self.processor.stage()
    }
}

#[async_trait]
impl MessageHandler for StageHandler {
    async fn handle(&self, message: &MqMessage) -> Result<(), PipelineError> {
        let stage = self.processor.stage();
        let span = crate::stage_span!(
            stage = stage.as_str(),
            message_id = %message.message_id,
            retry_count = message.retry_count
        );

        async {
            let started = Instant::now();
            let result = self.processor.process(message).await;
            metrics().stage_processed(stage.as_str(), started.elapsed(), result.is_ok());
            if let Err(e) = &result {
                debug!(error = %e, retryable = e.is_retryable(), "Stage processing failed");
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    struct RecordingProcessor {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl StageProcessor for RecordingProcessor {
        fn stage(&self) -> Stage {
            Stage::Review
        }

        async fn process(&self, message: &MqMessage) -> Result<(), PipelineError> {
            self.seen.lock().await.push(message.message_id.clone());
            if self.fail {
                Err(PipelineError::transient("sink down"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_stage_topics_and_groups() {
        assert_eq!(Stage::Quality.input_topic(), Topic::Raw);
        assert_eq!(Stage::Dispatcher.input_topic(), Topic::Processed);
        assert_eq!(Stage::Knowledge.consumer_group(), "knowledge-processor");
        assert_eq!(Stage::ALL.len(), 4);
    }

    #[tokio::test]
    async fn test_handler_delegates_and_propagates_errors() {
        let processor = Arc::new(RecordingProcessor {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let handler = StageHandler::new(processor.clone());
        let message = MqMessage::new(Topic::Review, json!({}), 1);

        let result = handler.handle(&message).await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(processor.seen.lock().await.len(), 1);
        assert_eq!(handler.stage(), Stage::Review);
    }
}
