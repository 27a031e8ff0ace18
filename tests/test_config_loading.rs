//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use qa_pipeline::config::{ConfigError, MqBackendKind, PipelineConfig};
use qa_pipeline::mq::connect_backend;
use qa_pipeline::PipelineError;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[mq]
backend = "mqtt"
topic_prefix = "staging:"
max_retries = 5
retry_backoff_ms = [100, 500, 2000]

[mq.mqtt]
broker_url = "mqtt://broker.internal:1883"
username_env = "QA_MQTT_USER"

[collector]
exclude_callees = ["retrieve_tools"]
min_answer_length = 20

[dispatcher]
annotators = ["alice", "bob", "carol"]
expire_hours = 12
quality_threshold = 0.5

[knowledge]
enabled = true
endpoint = "https://kb.internal"
kb_id = "support"

[trace_store]
path = "/var/lib/qa/traces"

[runtime]
instances_per_stage = 3
health_port = 9090
"#,
    );

    let config = PipelineConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mq.backend_kind().unwrap(), MqBackendKind::Mqtt);
    assert_eq!(config.mq.topic_prefix, "staging:");
    assert_eq!(config.mq.max_retries, 5);
    let mqtt = config.mq.mqtt.as_ref().unwrap();
    assert_eq!(mqtt.broker_url, "mqtt://broker.internal:1883");
    assert_eq!(mqtt.client_id, "qa-pipeline");
    assert_eq!(config.collector.exclude_callees, vec!["retrieve_tools"]);
    assert_eq!(config.collector.rules().min_answer_length, 20);
    assert_eq!(config.importer.rules.min_answer_length, 1);
    assert_eq!(config.dispatcher.annotators.len(), 3);
    assert_eq!(config.dispatcher.expire_hours, 12);
    assert!(config.knowledge.enabled);
    assert_eq!(config.trace_store.path, "/var/lib/qa/traces");
    assert_eq!(config.runtime.instances_per_stage, 3);
    assert_eq!(config.runtime.health_port, 9090);
    // Untouched sections keep defaults
    assert_eq!(config.review.max_retry_count, 3);
    assert!(!config.quality.enabled);
}

#[test]
fn test_config_file_not_found() {
    let result = PipelineConfig::load_from_file(std::path::Path::new("/nonexistent/pipeline.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_invalid_toml_syntax() {
    let temp_file = write_config("[mq\nbackend = memory");
    let result = PipelineConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unsupported_backend_fails_at_startup() {
    let temp_file = write_config("[mq]\nbackend = \"kafka\"\n");
    let result = PipelineConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::UnsupportedBackend(ref name)) if name == "kafka"));

    // Bypassing validation still fails when the backend is built
    let mut config = PipelineConfig::from_toml_str("").unwrap();
    config.mq.backend = "kafka".to_string();
    assert!(matches!(
        connect_backend(&config.mq),
        Err(PipelineError::Configuration(ConfigError::UnsupportedBackend(_)))
    ));
}

#[test]
fn test_validation_errors_name_the_field() {
    let cases = [
        ("[dispatcher]\nexpire_hours = 0\n", "expire_hours"),
        ("[runtime]\ninstances_per_stage = 0\n", "instances_per_stage"),
        ("[mq]\ntopic_prefix = \"qa/#\"\n", "topic_prefix"),
        (
            "[importer]\nmin_answer_length = 100\nmax_answer_length = 10\n",
            "max_answer_length",
        ),
    ];
    for (toml, field) in cases {
        match PipelineConfig::from_toml_str(toml) {
            Err(ConfigError::InvalidConfig(message)) => {
                assert!(message.contains(field), "{message} should mention {field}")
            }
            other => panic!("expected InvalidConfig for {field}, got {other:?}"),
        }
    }
}

#[test]
fn test_secret_env_vars() {
    let config = PipelineConfig::from_toml_str(
        r#"
[quality]
enabled = true
endpoint = "http://scorer.internal/score"
api_key_env = "QA_TEST_QUALITY_KEY_PRESENT"

[knowledge]
api_key_env = "QA_TEST_KB_KEY_MISSING"
"#,
    )
    .unwrap();

    std::env::set_var("QA_TEST_QUALITY_KEY_PRESENT", "secret-value");
    assert_eq!(
        config.get_quality_api_key().unwrap().as_deref(),
        Some("secret-value")
    );

    std::env::remove_var("QA_TEST_KB_KEY_MISSING");
    assert!(matches!(
        config.get_knowledge_api_key(),
        Err(ConfigError::EnvVarNotFound(ref name)) if name == "QA_TEST_KB_KEY_MISSING"
    ));

    // No env var named means no key, not an error
    let plain = PipelineConfig::from_toml_str("").unwrap();
    assert_eq!(plain.get_quality_api_key().unwrap(), None);
    assert_eq!(plain.get_mqtt_username(), None);
}

#[test]
fn test_shown_config_parses_back() {
    let config = PipelineConfig::from_toml_str(
        r#"
[dispatcher]
annotators = ["alice"]

[runtime]
batch_size = 25
"#,
    )
    .unwrap();

    let shown = toml::to_string_pretty(&config).unwrap();
    let reparsed = PipelineConfig::from_toml_str(&shown).unwrap();
    assert_eq!(reparsed, config);
}
