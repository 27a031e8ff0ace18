//! Health check HTTP server for container orchestration
//!
//! Serves `/health`, `/metrics`, `/ready` and `/live` for operators and
//! orchestration platforms. Component checks come from a shared
//! [`HealthCheckManager`].

use crate::health::HealthCheckManager;
use crate::observability::metrics::{current_timestamp, metrics};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use warp::Filter;

const MESSAGE_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    instance_id: String,
    port: u16,
    mq_connected: Arc<AtomicBool>,
    last_message_processed: Arc<AtomicU64>,
    components: Arc<HealthCheckManager>,
}

impl HealthServer {
    /// Create new health server
    pub fn new(instance_id: String, port: u16, components: Arc<HealthCheckManager>) -> Self {
        Self {
            instance_id,
            port,
            mq_connected: Arc::new(AtomicBool::new(false)),
            last_message_processed: Arc::new(AtomicU64::new(0)),
            components,
        }
    }

    /// Update message queue connection status
    pub fn set_mq_connected(&self, connected: bool) {
        self.mq_connected.store(connected, Ordering::Relaxed);
    }

    /// Update last processed message timestamp
    pub fn set_last_message_processed(&self, timestamp: u64) {
        self.last_message_processed
            .store(timestamp, Ordering::Relaxed);
    }

    /// Refresh connection and activity state from component checks and metrics
    async fn refresh(&self) {
        let results = self.components.run_health_checks().await;
        let queue_ok = results
            .iter()
            .filter(|r| r.component == "message_queue")
            .all(|r| r.healthy);
        self.set_mq_connected(queue_ok);
        let last = metrics().last_message_processed();
        if last > 0 {
            self.set_last_message_processed(last);
        }
    }

    /// Serve until `shutdown` flips to true
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - comprehensive health status
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    warp::http::StatusCode::OK
                } else {
                    warp::http::StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
            let snapshot = metrics().get_metrics();
            warp::reply::json(&snapshot)
        });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                server.refresh().await;
                let ready = server.mq_connected.load(Ordering::Relaxed);
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    warp::http::StatusCode::OK
                } else {
                    warp::http::StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - liveness probe
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        let routes = health_route.or(metrics_route).or(ready_route).or(live_route);

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        tracing::info!(port = self.port, "Starting health server");

        let bound = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        });
        match bound {
            Ok((_, server)) => {
                server.await;
                tracing::info!("Health server stopped");
            }
            Err(e) => tracing::error!(port = self.port, error = %e, "Health server failed to bind"),
        }
    }

    async fn get_health_status(&self) -> HealthStatus {
        self.refresh().await;
        let now = current_timestamp();

        let mut checks = HashMap::new();
        for result in self.components.run_health_checks().await {
            let status = if result.healthy { "healthy" } else { "unhealthy" };
            checks.insert(
                result.component.clone(),
                HealthCheck {
                    status: status.to_string(),
                    message: result.message,
                    last_check: now,
                },
            );
        }
        checks.insert(
            "message_processing".to_string(),
            self.check_message_processing_health(),
        );

        // Stale processing is reported but does not degrade overall status
        let overall_healthy = checks
            .values()
            .all(|check| check.status != "unhealthy");
        metrics().update_health_status(overall_healthy);

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            instance_id: self.instance_id.clone(),
            uptime_seconds: metrics().get_metrics().runtime.uptime_seconds,
            checks,
        }
    }

    fn check_message_processing_health(&self) -> HealthCheck {
        let now = current_timestamp();
        let last = self.last_message_processed.load(Ordering::Relaxed);

        if last == 0 {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("No messages processed yet".to_string()),
                last_check: now,
            }
        } else if now.saturating_sub(last) > MESSAGE_STALENESS_THRESHOLD_SECONDS {
            let idle = now.saturating_sub(last);
            HealthCheck {
                status: "stale".to_string(),
                message: Some(format!("No message activity for {idle} seconds")),
                last_check: now,
            }
        } else {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("Recent message activity".to_string()),
                last_check: now,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    instance_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqSection;
    use crate::health::MqHealthCheck;
    use crate::mq::memory::MemoryQueue;
    use crate::mq::MessageQueue;

    fn server_with_queue(queue: Arc<MemoryQueue>) -> HealthServer {
        let mut manager = HealthCheckManager::new();
        manager.add_health_check(Box::new(MqHealthCheck::new(queue)));
        HealthServer::new("test-instance".to_string(), 0, Arc::new(manager))
    }

    #[tokio::test]
    async fn test_message_processing_staleness() {
        let server = HealthServer::new(
            "test-instance".to_string(),
            0,
            Arc::new(HealthCheckManager::new()),
        );
        assert_eq!(server.check_message_processing_health().status, "healthy");

        let now = current_timestamp();
        server.set_last_message_processed(now);
        assert_eq!(server.check_message_processing_health().status, "healthy");

        server.set_last_message_processed(now - 600);
        assert_eq!(server.check_message_processing_health().status, "stale");
    }

    #[tokio::test]
    async fn test_health_follows_queue_connection() {
        let queue = Arc::new(MemoryQueue::new(MqSection::default()));
        let server = server_with_queue(queue.clone());

        let status = server.get_health_status().await;
        assert_eq!(status.status, "degraded");
        assert!(!server.mq_connected.load(Ordering::Relaxed));

        queue.connect().await.unwrap();
        let status = server.get_health_status().await;
        assert_eq!(status.status, "healthy");
        assert_eq!(status.instance_id, "test-instance");
        assert!(status.checks.contains_key("message_queue"));
        assert!(status.checks.contains_key("message_processing"));
        assert!(server.mq_connected.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let server = Arc::new(HealthServer::new(
            "test-instance".to_string(),
            0,
            Arc::new(HealthCheckManager::new()),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.start(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
