//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! queue traffic, ingestion, stage processing and task lifecycle outcomes.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_TIMING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Queue traffic
    mq_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_consumed: AtomicU64,
    messages_acked: AtomicU64,
    messages_retried: AtomicU64,
    messages_dead_lettered: AtomicU64,
    last_message_processed: AtomicU64,

    // Ingestion
    units_imported: AtomicU64,
    units_skipped: AtomicU64,
    import_errors: AtomicU64,
    units_collected: AtomicU64,
    collector_dropped: AtomicU64,

    // Task lifecycle
    units_dispatched: AtomicU64,
    duplicates_skipped: AtomicU64,
    orphans_stored: AtomicU64,
    status_conflicts: AtomicU64,
    assignments_expired: AtomicU64,
    kb_ingested: AtomicU64,
    kb_failed: AtomicU64,

    // Batch timings in milliseconds
    batch_times: Mutex<Vec<u64>>,

    // Per-stage statistics
    stage_stats: Mutex<HashMap<String, StageStats>>,

    // Runtime
    pipeline_state: Mutex<String>,
    uptime_start: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();
        Self {
            mq_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_consumed: AtomicU64::new(0),
            messages_acked: AtomicU64::new(0),
            messages_retried: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            last_message_processed: AtomicU64::new(0),
            units_imported: AtomicU64::new(0),
            units_skipped: AtomicU64::new(0),
            import_errors: AtomicU64::new(0),
            units_collected: AtomicU64::new(0),
            collector_dropped: AtomicU64::new(0),
            units_dispatched: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            orphans_stored: AtomicU64::new(0),
            status_conflicts: AtomicU64::new(0),
            assignments_expired: AtomicU64::new(0),
            kb_ingested: AtomicU64::new(0),
            kb_failed: AtomicU64::new(0),
            batch_times: Mutex::new(Vec::new()),
            stage_stats: Mutex::new(HashMap::new()),
            pipeline_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Queue metrics
    pub fn mq_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mq_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mq_connected.store(true, Ordering::Relaxed);
    }

    pub fn mq_connection_lost(&self) {
        self.mq_connected.store(false, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_consumed(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_acked(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
        self.last_message_processed
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn message_retried(&self) {
        self.messages_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dead_lettered(&self) {
        self.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Unix timestamp of the last acked message, 0 if none
    pub fn last_message_processed(&self) -> u64 {
        self.last_message_processed.load(Ordering::Relaxed)
    }

    pub fn batch_completed(&self, duration: Duration) {
        if let Ok(mut times) = self.batch_times.lock() {
            push_bounded(&mut times, duration.as_millis() as u64);
        }
    }

    // Ingestion metrics
    pub fn units_imported(&self, count: u64) {
        self.units_imported.fetch_add(count, Ordering::Relaxed);
    }

    pub fn units_skipped(&self, count: u64) {
        self.units_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn import_errors(&self, count: u64) {
        self.import_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn unit_collected(&self) {
        self.units_collected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn collector_dropped(&self) {
        self.collector_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn unit_dispatched(&self) {
        self.units_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_skipped(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn orphan_stored(&self) {
        self.orphans_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status_conflict(&self) {
        self.status_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn assignments_expired(&self, count: u64) {
        self.assignments_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn kb_ingested(&self) {
        self.kb_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn kb_failed(&self) {
        self.kb_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Create or retrieve stage stats entry (pure function)
    fn get_or_create_stage_stats<'a>(
        stats: &'a mut HashMap<String, StageStats>,
        stage: &str,
    ) -> &'a mut StageStats {
        stats
            .entry(stage.to_string())
            .or_insert_with(|| StageStats {
                name: stage.to_string(),
                processed: 0,
                failures: 0,
                processing_times: Vec::new(),
                last_processed: 0,
            })
    }

    // Stage metrics
    pub fn stage_processed(&self, stage: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.stage_stats.lock() {
            let stage_stats = Self::get_or_create_stage_stats(&mut stats, stage);
            stage_stats.processed += 1;
            stage_stats.last_processed = current_timestamp();
            push_bounded(
                &mut stage_stats.processing_times,
                duration.as_millis() as u64,
            );
            if !success {
                stage_stats.failures += 1;
            }
        }
    }

    // Runtime metrics
    pub fn set_pipeline_state(&self, state: &str) {
        if let Ok(mut current_state) = self.pipeline_state.lock() {
            *current_state = state.to_string();
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_consumed,
            &self.messages_acked,
            &self.messages_retried,
            &self.messages_dead_lettered,
            &self.last_message_processed,
            &self.units_imported,
            &self.units_skipped,
            &self.import_errors,
            &self.units_collected,
            &self.collector_dropped,
            &self.units_dispatched,
            &self.duplicates_skipped,
            &self.orphans_stored,
            &self.status_conflicts,
            &self.assignments_expired,
            &self.kb_ingested,
            &self.kb_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        let now = current_timestamp();
        self.mq_connected.store(false, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);
        if let Ok(mut times) = self.batch_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats.clear();
        }
        self.set_pipeline_state("initializing");
    }

    /// Batch timing statistics (pure function)
    fn calculate_batch_time_statistics(&self) -> (f64, f64, f64) {
        match self.batch_times.lock() {
            Ok(times) if !times.is_empty() => {
                let mut sorted_times = times.clone();
                sorted_times.sort_unstable();
                let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
                (
                    avg,
                    percentile(&sorted_times, 50.0),
                    percentile(&sorted_times, 95.0),
                )
            }
            _ => (0.0, 0.0, 0.0),
        }
    }

    /// Create stage snapshot (pure function)
    fn create_stage_snapshot(stats: &StageStats) -> StageStatsSnapshot {
        let avg_processing_time_ms = if stats.processing_times.is_empty() {
            0.0
        } else {
            stats.processing_times.iter().sum::<u64>() as f64 / stats.processing_times.len() as f64
        };
        let success_rate = if stats.processed == 0 {
            0.0
        } else {
            (stats.processed - stats.failures) as f64 / stats.processed as f64
        };

        StageStatsSnapshot {
            name: stats.name.clone(),
            processed: stats.processed,
            failures: stats.failures,
            avg_processing_time_ms,
            last_processed: stats.last_processed,
            success_rate,
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_batch_time_ms, p50, p95) = self.calculate_batch_time_statistics();
        let stages = self
            .stage_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, s)| (name.clone(), Self::create_stage_snapshot(s)))
                    .collect()
            })
            .unwrap_or_default();
        let current_state = self
            .pipeline_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            queue: QueueMetrics {
                connected: self.mq_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
                messages_acked: self.messages_acked.load(Ordering::Relaxed),
                messages_retried: self.messages_retried.load(Ordering::Relaxed),
                messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
                avg_batch_time_ms,
                batch_time_p50_ms: p50,
                batch_time_p95_ms: p95,
            },
            ingestion: IngestionMetrics {
                units_imported: self.units_imported.load(Ordering::Relaxed),
                units_skipped: self.units_skipped.load(Ordering::Relaxed),
                import_errors: self.import_errors.load(Ordering::Relaxed),
                units_collected: self.units_collected.load(Ordering::Relaxed),
                collector_dropped: self.collector_dropped.load(Ordering::Relaxed),
            },
            tasks: TaskMetrics {
                units_dispatched: self.units_dispatched.load(Ordering::Relaxed),
                duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
                orphans_stored: self.orphans_stored.load(Ordering::Relaxed),
                status_conflicts: self.status_conflicts.load(Ordering::Relaxed),
                assignments_expired: self.assignments_expired.load(Ordering::Relaxed),
                kb_ingested: self.kb_ingested.load(Ordering::Relaxed),
                kb_failed: self.kb_failed.load(Ordering::Relaxed),
            },
            stages,
            runtime: RuntimeMetrics {
                current_state,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
                last_message_processed: self.last_message_processed(),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_TIMING_SAMPLES {
        samples.remove(0);
    }
}

// Internal stage statistics (with timing data)
#[derive(Debug)]
struct StageStats {
    name: String,
    processed: u64,
    failures: u64,
    processing_times: Vec<u64>,
    last_processed: u64,
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub queue: QueueMetrics,
    pub ingestion: IngestionMetrics,
    pub tasks: TaskMetrics,
    pub stages: HashMap<String, StageStatsSnapshot>,
    pub runtime: RuntimeMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct QueueMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_consumed: u64,
    pub messages_acked: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    pub avg_batch_time_ms: f64,
    pub batch_time_p50_ms: f64,
    pub batch_time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct IngestionMetrics {
    pub units_imported: u64,
    pub units_skipped: u64,
    pub import_errors: u64,
    pub units_collected: u64,
    pub collector_dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskMetrics {
    pub units_dispatched: u64,
    pub duplicates_skipped: u64,
    pub orphans_stored: u64,
    pub status_conflicts: u64,
    pub assignments_expired: u64,
    pub kb_ingested: u64,
    pub kb_failed: u64,
}

#[derive(Debug, Serialize)]
pub struct StageStatsSnapshot {
    pub name: String,
    pub processed: u64,
    pub failures: u64,
    pub avg_processing_time_ms: f64,
    pub last_processed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct RuntimeMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub healthy: bool,
    pub last_health_check: u64,
    pub last_message_processed: u64,
}

/// Calculate percentile from sorted data (pure function)
fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }
    let index = (percentile / 100.0 * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)] as f64
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_counters() {
        let collector = MetricsCollector::new();
        collector.message_published();
        collector.message_published();
        collector.message_consumed();
        collector.message_acked();
        collector.message_retried();
        collector.message_dead_lettered();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.queue.messages_published, 2);
        assert_eq!(snapshot.queue.messages_consumed, 1);
        assert_eq!(snapshot.queue.messages_acked, 1);
        assert_eq!(snapshot.queue.messages_retried, 1);
        assert_eq!(snapshot.queue.messages_dead_lettered, 1);
        assert!(snapshot.runtime.last_message_processed > 0);
    }

    #[test]
    fn test_connection_state_tracking() {
        let collector = MetricsCollector::new();
        collector.mq_connection_attempt();
        collector.mq_connection_established();
        assert!(collector.get_metrics().queue.connected);

        collector.mq_connection_lost();
        let snapshot = collector.get_metrics();
        assert!(!snapshot.queue.connected);
        assert_eq!(snapshot.queue.connection_attempts, 1);
    }

    #[test]
    fn test_stage_statistics() {
        let collector = MetricsCollector::new();
        collector.stage_processed("dispatcher", Duration::from_millis(10), true);
        collector.stage_processed("dispatcher", Duration::from_millis(30), false);

        let snapshot = collector.get_metrics();
        let stage = &snapshot.stages["dispatcher"];
        assert_eq!(stage.processed, 2);
        assert_eq!(stage.failures, 1);
        assert!((stage.avg_processing_time_ms - 20.0).abs() < f64::EPSILON);
        assert!((stage.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ingestion_and_lifecycle_counters() {
        let collector = MetricsCollector::new();
        collector.units_imported(3);
        collector.units_skipped(2);
        collector.unit_collected();
        collector.duplicate_skipped();
        collector.status_conflict();
        collector.assignments_expired(4);
        collector.kb_failed();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.ingestion.units_imported, 3);
        assert_eq!(snapshot.ingestion.units_skipped, 2);
        assert_eq!(snapshot.ingestion.units_collected, 1);
        assert_eq!(snapshot.tasks.duplicates_skipped, 1);
        assert_eq!(snapshot.tasks.status_conflicts, 1);
        assert_eq!(snapshot.tasks.assignments_expired, 4);
        assert_eq!(snapshot.tasks.kb_failed, 1);
    }

    #[test]
    fn test_batch_time_percentiles() {
        let collector = MetricsCollector::new();
        for ms in [10, 20, 30, 40, 50] {
            collector.batch_completed(Duration::from_millis(ms));
        }
        let snapshot = collector.get_metrics();
        assert!((snapshot.queue.avg_batch_time_ms - 30.0).abs() < f64::EPSILON);
        assert!((snapshot.queue.batch_time_p50_ms - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timing_samples_are_bounded() {
        let collector = MetricsCollector::new();
        for _ in 0..(MAX_TIMING_SAMPLES + 50) {
            collector.batch_completed(Duration::from_millis(1));
        }
        assert_eq!(collector.batch_times.lock().unwrap().len(), MAX_TIMING_SAMPLES);
    }

    #[test]
    fn test_reset() {
        let collector = MetricsCollector::new();
        collector.units_imported(5);
        collector.set_pipeline_state("running");
        collector.stage_processed("quality", Duration::from_millis(1), true);

        collector.reset();
        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.ingestion.units_imported, 0);
        assert!(snapshot.stages.is_empty());
        assert_eq!(snapshot.runtime.current_state, "initializing");
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[5], 99.0), 5.0);
        assert_eq!(percentile(&[1, 2, 3, 4], 100.0), 4.0);
    }
}
