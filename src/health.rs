//! Health check system for production monitoring
//!
//! Provides health check traits and implementations for the pipeline's
//! backing components: the message queue, the task store and the trace store.

use crate::error::PipelineResult;
use crate::mq::MessageQueue;
use crate::store::TaskStore;
use crate::trace::TraceStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub component: String,
    pub healthy: bool,
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
}

/// Trait for components that can be health checked
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check on this component
    async fn health_check(&self) -> HealthCheckResult;

    /// Get the component name for reporting
    fn component_name(&self) -> &str;
}

/// Message queue health check
pub struct MqHealthCheck {
    queue: Arc<dyn MessageQueue>,
}

impl MqHealthCheck {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl HealthCheck for MqHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let healthy = self.queue.health_check().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let message = if healthy {
            format!("{} queue healthy", self.queue.backend_name())
        } else {
            format!("{} queue unavailable", self.queue.backend_name())
        };

        debug!(
            backend = self.queue.backend_name(),
            healthy = healthy,
            response_time_ms = response_time_ms,
            "Message queue health check"
        );

        HealthCheckResult {
            component: self.component_name().to_string(),
            healthy,
            message: Some(message),
            response_time_ms: Some(response_time_ms),
        }
    }

    fn component_name(&self) -> &str {
        "message_queue"
    }
}

/// Task store health check
pub struct TaskStoreHealthCheck {
    store: Arc<dyn TaskStore>,
}

impl TaskStoreHealthCheck {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for TaskStoreHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let result = self.store.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => HealthCheckResult {
                component: self.component_name().to_string(),
                healthy: true,
                message: Some("Task store reachable".to_string()),
                response_time_ms: Some(response_time_ms),
            },
            Err(e) => {
                warn!(error = %e, "Task store health check failed");
                HealthCheckResult {
                    component: self.component_name().to_string(),
                    healthy: false,
                    message: Some(format!("Task store error: {}", e.sanitized())),
                    response_time_ms: Some(response_time_ms),
                }
            }
        }
    }

    fn component_name(&self) -> &str {
        "task_store"
    }
}

/// Trace store health check; a range query doubles as the check
pub struct TraceStoreHealthCheck {
    store: Arc<dyn TraceStore>,
}

impl TraceStoreHealthCheck {
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for TraceStoreHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let result = self.store.available_range().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let (healthy, message) = match result {
            Ok(Some(range)) => (
                true,
                format!("Trace records from {} to {}", range.start, range.end),
            ),
            Ok(None) => (true, "Trace store empty".to_string()),
            Err(e) => {
                warn!(error = %e, "Trace store health check failed");
                (false, format!("Trace store error: {}", e.sanitized()))
            }
        };

        HealthCheckResult {
            component: self.component_name().to_string(),
            healthy,
            message: Some(message),
            response_time_ms: Some(response_time_ms),
        }
    }

    fn component_name(&self) -> &str {
        "trace_store"
    }
}

/// Aggregated health check manager
pub struct HealthCheckManager {
    health_checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthCheckManager {
    pub fn new() -> Self {
        Self {
            health_checks: Vec::new(),
        }
    }

    /// Add a health check to the manager
    pub fn add_health_check(&mut self, health_check: Box<dyn HealthCheck>) {
        self.health_checks.push(health_check);
    }

    /// Run all health checks and return aggregated results
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(self.health_checks.len());
        for health_check in &self.health_checks {
            results.push(health_check.health_check().await);
        }
        results
    }

    /// Calculate overall health status from all components
    pub async fn calculate_overall_health(&self) -> PipelineResult<bool> {
        let results = self.run_health_checks().await;

        if results.is_empty() {
            warn!("No health checks configured - assuming healthy");
            return Ok(true);
        }

        let healthy_count = results.iter().filter(|r| r.healthy).count();
        let total_count = results.len();

        // All components must be healthy for overall health
        let overall_healthy = healthy_count == total_count;

        debug!(
            "Overall health check: {}/{} components healthy, overall={}",
            healthy_count, total_count, overall_healthy
        );

        Ok(overall_healthy)
    }
}

impl Default for HealthCheckManager {
    fn default() -> Self {
        Self::new()
    }
}
