//! Configuration system for the QA annotation pipeline
//!
//! Configuration is read from a TOML file (`pipeline.toml` by default). Every
//! section and field has a default, so an empty file is a valid configuration
//! for an in-memory pipeline. Secrets are never stored in the file: fields
//! ending in `_env` name environment variables that are resolved at runtime.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Main pipeline configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub mq: MqSection,
    pub collector: CollectorSection,
    pub importer: ImporterSection,
    pub quality: QualitySection,
    pub dispatcher: DispatcherSection,
    pub review: ReviewSection,
    pub knowledge: KnowledgeSection,
    pub trace_store: TraceStoreSection,
    pub store: StoreSection,
    pub runtime: RuntimeSection,
}

/// Supported message queue backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqBackendKind {
    Memory,
    Mqtt,
}

impl FromStr for MqBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(MqBackendKind::Memory),
            "mqtt" => Ok(MqBackendKind::Mqtt),
            other => Err(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Message queue section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqSection {
    /// Backend name: "memory" or "mqtt"
    pub backend: String,
    /// Prefix applied to every topic at the backend boundary
    pub topic_prefix: String,
    /// Redeliveries allowed before a message is dead-lettered
    pub max_retries: u32,
    /// Redelivery delays in milliseconds; the last value repeats
    pub retry_backoff_ms: Vec<u64>,
    /// Idle wait between empty polls (memory backend)
    pub poll_interval_ms: u64,
    /// Maximum retained messages per topic log (memory backend)
    pub max_len: usize,
    /// Broker settings, required when `backend = "mqtt"`
    pub mqtt: Option<MqttSection>,
}

impl Default for MqSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            topic_prefix: "qa:".to_string(),
            max_retries: 3,
            retry_backoff_ms: vec![100, 500, 2000],
            poll_interval_ms: 200,
            max_len: 100_000,
            mqtt: None,
        }
    }
}

impl MqSection {
    /// Parsed backend kind
    pub fn backend_kind(&self) -> Result<MqBackendKind, ConfigError> {
        self.backend.parse()
    }

    /// Delay before redelivery number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let delay_ms = self
            .retry_backoff_ms
            .get(index)
            .or_else(|| self.retry_backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(delay_ms)
    }
}

/// MQTT broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Client id prefix; a per-connection suffix is appended
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long `connect` waits for the broker's ConnAck
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_client_id() -> String {
    "qa-pipeline".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

/// Length rules applied to extracted question/answer text
///
/// The defaults are the importer's: any non-empty answer is accepted. The
/// realtime collector carries its own stricter answer minimum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentRules {
    #[serde(default = "default_min_question_length")]
    pub min_question_length: usize,
    #[serde(default = "default_min_answer_length")]
    pub min_answer_length: usize,
    #[serde(default = "default_max_answer_length")]
    pub max_answer_length: usize,
}

fn default_min_question_length() -> usize {
    2
}

fn default_min_answer_length() -> usize {
    1
}

fn default_collector_min_answer_length() -> usize {
    10
}

fn default_max_answer_length() -> usize {
    50_000
}

impl Default for ContentRules {
    fn default() -> Self {
        Self {
            min_question_length: default_min_question_length(),
            min_answer_length: default_min_answer_length(),
            max_answer_length: default_max_answer_length(),
        }
    }
}

impl ContentRules {
    /// Reject text outside the configured lengths, counted in characters
    pub fn check(&self, question: &str, answer: &str) -> Result<(), PipelineError> {
        let question_len = question.trim().chars().count();
        let answer_len = answer.chars().count();
        if question_len < self.min_question_length {
            return Err(PipelineError::validation(format!(
                "question has {question_len} chars, minimum is {}",
                self.min_question_length
            )));
        }
        if answer_len < self.min_answer_length {
            return Err(PipelineError::validation(format!(
                "answer has {answer_len} chars, minimum is {}",
                self.min_answer_length
            )));
        }
        if answer_len > self.max_answer_length {
            return Err(PipelineError::validation(format!(
                "answer has {answer_len} chars, maximum is {}",
                self.max_answer_length
            )));
        }
        Ok(())
    }
}

/// Realtime collector section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectorSection {
    pub enabled: bool,
    /// Callee names never collected
    pub exclude_callees: Vec<String>,
    /// Callee categories never collected
    pub exclude_callee_types: Vec<String>,
    pub min_question_length: usize,
    pub min_answer_length: usize,
    pub max_answer_length: usize,
    /// Upper bound on the publish call made from the completion path
    pub publish_timeout_ms: u64,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_callees: vec!["retrieve_tools".to_string(), "default_llm".to_string()],
            exclude_callee_types: vec!["llm".to_string()],
            min_question_length: default_min_question_length(),
            min_answer_length: default_collector_min_answer_length(),
            max_answer_length: default_max_answer_length(),
            publish_timeout_ms: 500,
        }
    }
}

impl CollectorSection {
    pub fn rules(&self) -> ContentRules {
        ContentRules {
            min_question_length: self.min_question_length,
            min_answer_length: self.min_answer_length,
            max_answer_length: self.max_answer_length,
        }
    }
}

/// Batch importer section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImporterSection {
    pub default_limit: usize,
    pub include_sub_nodes: bool,
    pub include_agent_calls: bool,
    pub include_tool_calls: bool,
    #[serde(flatten)]
    pub rules: ContentRules,
}

impl Default for ImporterSection {
    fn default() -> Self {
        Self {
            default_limit: 1000,
            include_sub_nodes: true,
            include_agent_calls: true,
            include_tool_calls: false,
            rules: ContentRules::default(),
        }
    }
}

/// Quality enrichment section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualitySection {
    pub enabled: bool,
    /// Scorer endpoint, required when enabled
    pub endpoint: Option<String>,
    /// Environment variable holding the scorer API key
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key_env: None,
            timeout_ms: 5000,
            max_retries: 3,
            backoff_ms: 200,
        }
    }
}

/// Task dispatcher section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherSection {
    /// Annotator ids for round-robin assignment; empty keeps tasks pending
    pub annotators: Vec<String>,
    pub expire_hours: i64,
    /// Scores below this mark a unit `low_quality`
    pub quality_threshold: f64,
    /// Redeliveries spent waiting for a missing parent before storing the unit as an orphan
    pub parent_wait_retries: u32,
    pub sweep_interval_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            annotators: Vec::new(),
            expire_hours: 24,
            quality_threshold: 0.3,
            parent_wait_retries: 2,
            sweep_interval_secs: 300,
        }
    }
}

/// Review handler section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReviewSection {
    /// Returns to pending allowed; a rejection past this cancels the unit
    pub max_retry_count: u32,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self { max_retry_count: 3 }
    }
}

/// Knowledge base section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeSection {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub kb_id: Option<String>,
    /// Environment variable holding the knowledge-base API key
    pub api_key_env: Option<String>,
    pub timeout_ms: u64,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            kb_id: None,
            api_key_env: None,
            timeout_ms: 10_000,
        }
    }
}

/// Trace store section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TraceStoreSection {
    /// Directory holding `roots.jsonl` and `calls.jsonl`
    pub path: String,
}

impl Default for TraceStoreSection {
    fn default() -> Self {
        Self {
            path: "traces".to_string(),
        }
    }
}

/// Task store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    Memory,
    Sqlite,
}

impl FromStr for StoreBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackendKind::Memory),
            "sqlite" => Ok(StoreBackendKind::Sqlite),
            other => Err(ConfigError::InvalidConfig(format!(
                "unsupported task store backend: {other}"
            ))),
        }
    }
}

/// Task store section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSection {
    /// "memory" keeps tasks for the life of the process, "sqlite" persists them
    pub backend: String,
    /// Database file for the sqlite backend, created on first use
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: "qa-tasks.db".to_string(),
        }
    }
}

impl StoreSection {
    pub fn backend_kind(&self) -> Result<StoreBackendKind, ConfigError> {
        self.backend.parse()
    }
}

/// Runtime section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSection {
    pub instance_id: String,
    pub batch_size: usize,
    /// Consumer loops started per stage, all in the same consumer group
    pub instances_per_stage: usize,
    pub shutdown_timeout_secs: u64,
    /// Health server port; 0 disables the server
    pub health_port: u16,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            instance_id: "qa-pipeline".to_string(),
            batch_size: 10,
            instances_per_stage: 1,
            shutdown_timeout_secs: 30,
            health_port: 8080,
            cache_ttl_secs: 86_400,
            cache_max_entries: 100_000,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Unsupported message queue backend: {0}")]
    UnsupportedBackend(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency and value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let backend = self.mq.backend_kind()?;
        if backend == MqBackendKind::Mqtt && self.mq.mqtt.is_none() {
            return Err(ConfigError::InvalidConfig(
                "mqtt backend requires [mq.mqtt] configuration".to_string(),
            ));
        }
        if self.mq.topic_prefix.contains(['+', '#']) {
            return Err(ConfigError::InvalidConfig(
                "mq.topic_prefix must not contain MQTT wildcards".to_string(),
            ));
        }
        if self.store.backend_kind()? == StoreBackendKind::Sqlite
            && self.store.path.trim().is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "sqlite store requires store.path".to_string(),
            ));
        }
        if self.runtime.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "runtime.batch_size must be at least 1".to_string(),
            ));
        }
        if self.runtime.instances_per_stage == 0 {
            return Err(ConfigError::InvalidConfig(
                "runtime.instances_per_stage must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dispatcher.quality_threshold) {
            return Err(ConfigError::InvalidConfig(format!(
                "dispatcher.quality_threshold must be within [0, 1], got {}",
                self.dispatcher.quality_threshold
            )));
        }
        if self.dispatcher.expire_hours <= 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatcher.expire_hours must be positive".to_string(),
            ));
        }
        if self.quality.enabled && self.quality.endpoint.is_none() {
            return Err(ConfigError::InvalidConfig(
                "quality.enabled requires quality.endpoint".to_string(),
            ));
        }
        if self.knowledge.enabled
            && (self.knowledge.endpoint.is_none() || self.knowledge.kb_id.is_none())
        {
            return Err(ConfigError::InvalidConfig(
                "knowledge.enabled requires knowledge.endpoint and knowledge.kb_id".to_string(),
            ));
        }
        for rules in [self.importer.rules.clone(), self.collector.rules()] {
            if rules.min_answer_length > rules.max_answer_length {
                return Err(ConfigError::InvalidConfig(format!(
                    "min_answer_length {} exceeds max_answer_length {}",
                    rules.min_answer_length, rules.max_answer_length
                )));
            }
        }
        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        self.mq
            .mqtt
            .as_ref()
            .and_then(|m| Self::get_env_var_optional(m.username_env.as_ref()))
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        self.mq
            .mqtt
            .as_ref()
            .and_then(|m| Self::get_env_var_optional(m.password_env.as_ref()))
    }

    /// Get quality scorer API key from environment variable, if configured
    pub fn get_quality_api_key(&self) -> Result<Option<String>, ConfigError> {
        Self::get_env_var_required_if_named(self.quality.api_key_env.as_ref())
    }

    /// Get knowledge-base API key from environment variable, if configured
    pub fn get_knowledge_api_key(&self) -> Result<Option<String>, ConfigError> {
        Self::get_env_var_required_if_named(self.knowledge.api_key_env.as_ref())
    }

    fn get_env_var_required_if_named(
        env_var_name: Option<&String>,
    ) -> Result<Option<String>, ConfigError> {
        match env_var_name {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mq]
backend = "memory"
max_retries = 2
retry_backoff_ms = [1, 1]
poll_interval_ms = 5

[dispatcher]
annotators = ["alice", "bob"]

[runtime]
batch_size = 4
shutdown_timeout_secs = 5
health_port = 0
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}
