//! Quality stage: optional scoring between `raw` and `processed`

use super::{Stage, StageProcessor};
use crate::config::QualitySection;
use crate::error::PipelineError;
use crate::model::{QAUnit, QualityAssessment};
use crate::mq::{MessageQueue, MqMessage, Topic};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// External quality scoring service
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score(&self, question: &str, answer: &str) -> Result<QualityAssessment, PipelineError>;
}

/// How the quality stage enriches a unit
#[async_trait]
pub trait QualityEnricher: Send + Sync {
    async fn enrich(&self, unit: QAUnit) -> Result<QAUnit, PipelineError>;

    fn name(&self) -> &'static str;
}

/// Null object used when scoring is disabled
#[derive(Debug, Default)]
pub struct PassthroughQuality;

#[async_trait]
impl QualityEnricher for PassthroughQuality {
    async fn enrich(&self, unit: QAUnit) -> Result<QAUnit, PipelineError> {
        Ok(unit)
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// Scores each unit, retrying with linear backoff within a per-call timeout
pub struct ScoringQuality {
    scorer: Arc<dyn QualityScorer>,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl ScoringQuality {
    pub fn new(scorer: Arc<dyn QualityScorer>, config: &QualitySection) -> Self {
        Self {
            scorer,
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    async fn score_once(&self, unit: &QAUnit) -> Result<QualityAssessment, PipelineError> {
        match tokio::time::timeout(self.timeout, self.scorer.score(&unit.question, &unit.answer))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::transient(format!(
                "quality scorer timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Clamp into `[0, 1]`; a NaN or infinite score counts as zero
fn normalize_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[async_trait]
impl QualityEnricher for ScoringQuality {
    async fn enrich(&self, mut unit: QAUnit) -> Result<QAUnit, PipelineError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * attempt;
                debug!(
                    data_id = %unit.data_id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying quality scoring"
                );
                tokio::time::sleep(delay).await;
            }

            match self.score_once(&unit).await {
                Ok(mut assessment) => {
                    assessment.score = normalize_score(assessment.score);
                    unit.quality = Some(assessment);
                    return Ok(unit);
                }
                Err(e) => {
                    warn!(data_id = %unit.data_id, attempt = attempt, error = %e, "Quality scoring failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PipelineError::transient("quality scoring failed")))
    }

    fn name(&self) -> &'static str {
        "scoring"
    }
}

/// Consumes `raw`, enriches, publishes to `processed`
pub struct QualityProcessor {
    queue: Arc<dyn MessageQueue>,
    enricher: Arc<dyn QualityEnricher>,
}

impl QualityProcessor {
    pub fn new(queue: Arc<dyn MessageQueue>, enricher: Arc<dyn QualityEnricher>) -> Self {
        Self { queue, enricher }
    }

    pub fn enricher_name(&self) -> &'static str {
        self.enricher.name()
    }
}

#[async_trait]
impl StageProcessor for QualityProcessor {
    fn stage(&self) -> Stage {
        Stage::Quality
    }

    async fn process(&self, message: &MqMessage) -> Result<(), PipelineError> {
        let unit: QAUnit = message.decode()?;
        let data_id = unit.data_id.clone();

        let enriched = match self.enricher.enrich(unit).await {
            Ok(unit) => unit,
            Err(e) => {
                // Retries are spent inside the enricher; the payload goes to the
                // dead-letter topic as received.
                warn!(data_id = %data_id, error = %e, "Quality enrichment exhausted retries");
                self.queue
                    .publish_to_dead_letter(
                        Topic::Raw,
                        message.payload.clone(),
                        message.priority,
                        &e.sanitized(),
                        message.retry_count,
                    )
                    .await?;
                return Ok(());
            }
        };

        let payload = serde_json::to_value(&enriched)?;
        self.queue
            .publish(Topic::Processed, payload, enriched.priority.value(), None)
            .await?;
        debug!(
            data_id = %data_id,
            score = enriched.quality.as_ref().map(|q| q.score),
            "Unit forwarded to processed"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    question: &'a str,
    answer: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f64,
    #[serde(default, alias = "category")]
    suggested_category: Option<String>,
    #[serde(default = "default_valid")]
    is_valid: bool,
    #[serde(default)]
    summary: Option<String>,
}

fn default_valid() -> bool {
    true
}

/// Scorer posting `{question, answer}` as JSON to an HTTP endpoint
pub struct HttpQualityScorer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpQualityScorer {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        url::Url::parse(endpoint).map_err(|e| {
            PipelineError::validation(format!("invalid quality endpoint {endpoint}: {e}"))
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::transient(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl QualityScorer for HttpQualityScorer {
    async fn score(&self, question: &str, answer: &str) -> Result<QualityAssessment, PipelineError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&ScoreRequest { question, answer });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("quality scorer request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::transient(format!(
                "quality scorer returned {status}: {body}"
            )));
        }

        let parsed: ScoreResponse = response.json().await.map_err(|e| {
            PipelineError::transient(format!("quality scorer response unreadable: {e}"))
        })?;

        Ok(QualityAssessment {
            score: parsed.score,
            suggested_category: parsed.suggested_category,
            is_valid: parsed.is_valid,
            summary: parsed.summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqSection;
    use crate::model::{Category, UnitDraft};
    use crate::mq::memory::MemoryQueue;
    use crate::testing::mocks::MockQualityScorer;

    fn unit() -> QAUnit {
        UnitDraft {
            trace_id: "t".to_string(),
            request_id: "r".to_string(),
            group_id: String::new(),
            caller: "planner".to_string(),
            callee: "search".to_string(),
            caller_category: Category::Agent,
            callee_category: Category::Tool,
            call_chain: vec!["user".into(), "planner".into(), "search".into()],
            question: "population of Reykjavik".to_string(),
            answer: "About 140,000 people live there.".to_string(),
            batch_id: None,
            parent_id: None,
        }
        .into_unit()
    }

    fn quality_config() -> QualitySection {
        QualitySection {
            enabled: true,
            endpoint: Some("http://scorer".to_string()),
            timeout_ms: 200,
            max_retries: 2,
            backoff_ms: 1,
            ..QualitySection::default()
        }
    }

    async fn queue() -> Arc<MemoryQueue> {
        let queue = Arc::new(MemoryQueue::new(MqSection::default()));
        queue.connect().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn test_passthrough_forwards_unchanged() {
        let queue = queue().await;
        let processor = QualityProcessor::new(queue.clone(), Arc::new(PassthroughQuality));
        let unit = unit();
        let message = MqMessage::new(Topic::Raw, serde_json::to_value(&unit).unwrap(), 3);

        processor.process(&message).await.unwrap();
        let forwarded: QAUnit = queue.retained(Topic::Processed)[0].decode().unwrap();
        assert_eq!(forwarded, unit);
        assert_eq!(processor.enricher_name(), "passthrough");
    }

    #[tokio::test]
    async fn test_scoring_attaches_assessment() {
        let queue = queue().await;
        let scorer = Arc::new(MockQualityScorer::new(1.7));
        let enricher = Arc::new(ScoringQuality::new(scorer.clone(), &quality_config()));
        let processor = QualityProcessor::new(queue.clone(), enricher);
        let message = MqMessage::new(Topic::Raw, serde_json::to_value(unit()).unwrap(), 3);

        processor.process(&message).await.unwrap();
        let forwarded: QAUnit = queue.retained(Topic::Processed)[0].decode().unwrap();
        let quality = forwarded.quality.unwrap();
        assert_eq!(quality.score, 1.0);
        assert_eq!(scorer.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_non_finite_score_is_zero() {
        for raw in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let scorer = Arc::new(MockQualityScorer::new(raw));
            let enricher = ScoringQuality::new(scorer, &quality_config());
            let quality = enricher.enrich(unit()).await.unwrap().quality.unwrap();
            assert_eq!(quality.score, 0.0, "raw score {raw}");
        }
    }

    #[test]
    fn test_normalize_score() {
        assert_eq!(normalize_score(-0.5), 0.0);
        assert_eq!(normalize_score(0.42), 0.42);
        assert_eq!(normalize_score(3.0), 1.0);
        assert_eq!(normalize_score(f64::NAN), 0.0);
    }

    #[tokio::test]
    async fn test_retries_then_dead_letters() {
        let queue = queue().await;
        let scorer = Arc::new(MockQualityScorer::with_failure());
        let enricher = Arc::new(ScoringQuality::new(scorer.clone(), &quality_config()));
        let processor = QualityProcessor::new(queue.clone(), enricher);
        let payload = serde_json::to_value(unit()).unwrap();
        let message = MqMessage::new(Topic::Raw, payload.clone(), 3);

        processor.process(&message).await.unwrap();
        assert_eq!(scorer.call_count().await, 3);
        assert!(queue.retained(Topic::Processed).is_empty());

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].original_topic, Topic::Raw);
        assert_eq!(dead[0].payload, payload);
        assert!(dead[0].error.contains("scorer unavailable"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_retryable() {
        let queue = queue().await;
        let processor = QualityProcessor::new(queue, Arc::new(PassthroughQuality));
        let message = MqMessage::new(Topic::Raw, serde_json::json!({"bogus": true}), 0);
        let err = processor.process(&message).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_http_scorer_rejects_bad_endpoint() {
        assert!(HttpQualityScorer::new("not a url", None, Duration::from_secs(1)).is_err());
    }
}
