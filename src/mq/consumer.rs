//! Backend-independent consumer loop
//!
//! Backends only supply batches through [`BatchSource`]; the loop runs the
//! handler over each batch concurrently and settles every delivery with an
//! ack or nack before pulling again.

use super::{MessageHandler, MessageQueue, MqError, MqMessage, Topic};
use crate::error::PipelineError;
use crate::observability::metrics::metrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Supplier of message batches for one topic/group subscription
#[async_trait::async_trait]
pub(crate) trait BatchSource: Send + Sync {
    /// Up to `max` messages; may return an empty batch after an idle wait
    async fn next_batch(&self, max: usize) -> Result<Vec<MqMessage>, MqError>;
}

/// Outcome of handling one delivery
pub(crate) type Outcome = (MqMessage, Result<(), PipelineError>);

/// Run the handler over a batch concurrently and collect every outcome.
/// A panicking handler counts as a retryable failure of its message.
pub(crate) async fn dispatch_batch(
    handler: &Arc<dyn MessageHandler>,
    batch: Vec<MqMessage>,
) -> Vec<Outcome> {
    let handles: Vec<_> = batch
        .into_iter()
        .map(|message| {
            let handler = handler.clone();
            let span = crate::mq_span!(
                topic = %message.topic,
                message_id = %message.message_id,
                retry_count = message.retry_count
            );
            let task_message = message.clone();
            let handle = tokio::spawn(
                async move { handler.handle(&task_message).await }.instrument(span),
            );
            (message, handle)
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for (message, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(PipelineError::transient(format!(
                "handler task failed: {join_error}"
            ))),
        };
        outcomes.push((message, result));
    }
    outcomes
}

/// Ack successes, requeue retryable failures, dead-letter the rest
pub(crate) async fn settle_batch(
    queue: &dyn MessageQueue,
    topic: Topic,
    group: &str,
    outcomes: Vec<Outcome>,
) {
    for (message, result) in outcomes {
        let settled = match &result {
            Ok(()) => {
                metrics().message_acked();
                queue.ack(topic, group, &message.message_id).await
            }
            Err(e) => {
                let requeue = e.is_retryable();
                warn!(
                    topic = %topic,
                    group = group,
                    message_id = %message.message_id,
                    retry_count = message.retry_count,
                    requeue = requeue,
                    error = %e,
                    "Message handling failed"
                );
                queue
                    .nack(topic, group, &message.message_id, requeue, &e.sanitized())
                    .await
            }
        };

        if let Err(e) = settled {
            warn!(
                topic = %topic,
                message_id = %message.message_id,
                error = %e,
                "Failed to settle message; it will be redelivered"
            );
        }
    }
}

/// Pull, handle and settle batches until shutdown is signalled
pub(crate) async fn consume(
    queue: &dyn MessageQueue,
    source: &dyn BatchSource,
    topic: Topic,
    group: &str,
    handler: Arc<dyn MessageHandler>,
    batch_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MqError> {
    let batch_size = batch_size.max(1);
    info!(
        topic = %topic,
        group = group,
        backend = queue.backend_name(),
        batch_size = batch_size,
        "Consumer started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            batch = source.next_batch(batch_size) => batch?,
        };

        if batch.is_empty() {
            continue;
        }

        debug!(topic = %topic, group = group, size = batch.len(), "Processing batch");
        let started = Instant::now();
        for _ in &batch {
            metrics().message_consumed();
        }
        let outcomes = dispatch_batch(&handler, batch).await;
        settle_batch(queue, topic, group, outcomes).await;
        metrics().batch_completed(started.elapsed());
    }

    info!(topic = %topic, group = group, "Consumer stopped");
    Ok(())
}
