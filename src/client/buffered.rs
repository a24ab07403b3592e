//! Buffering layer that coalesces deletes and visibility changes into batch calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::{BatchEntry, BatchEntryResult, QueueClient, ReceiveRequest, VisibilityBatchEntry};
use crate::errors::{GenericError, SqsListenerError};
use crate::message::{QueueMessage, ReceiptHandle};

/// SQS accepts at most ten entries per batch request.
pub const MAX_BATCH_SIZE: usize = 10;

/// Tuning for [`BufferedQueueClient`].
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Entries per batch call, capped at [`MAX_BATCH_SIZE`].
    pub max_batch_size: usize,
    /// How long the first entry of a batch may wait for batch-mates.
    pub max_batch_open: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            max_batch_size: MAX_BATCH_SIZE,
            max_batch_open: Duration::from_millis(200),
        }
    }
}

type Reply = oneshot::Sender<Result<(), SqsListenerError>>;

enum Command {
    Delete {
        queue_url: String,
        receipt_handle: ReceiptHandle,
        reply: Reply,
    },
    ChangeVisibility {
        queue_url: String,
        receipt_handle: ReceiptHandle,
        visibility_timeout_seconds: i32,
        reply: Reply,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BatchKind {
    Delete,
    ChangeVisibility,
}

struct PendingEntry {
    receipt_handle: ReceiptHandle,
    visibility_timeout_seconds: i32,
    reply: Reply,
}

struct PendingBatch {
    opened_at: Instant,
    entries: Vec<PendingEntry>,
}

/// A [`QueueClient`] that batches outgoing deletes and visibility changes.
///
/// Each caller still awaits its own entry's result, so one message's failure
/// never leaks into its batch-mates. Receives and sends pass straight through.
/// Call [`shutdown`](Self::shutdown) before dropping to flush pending entries.
pub struct BufferedQueueClient {
    inner: Arc<dyn QueueClient>,
    commands: mpsc::UnboundedSender<Command>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedQueueClient {
    /// Wraps `inner` and spawns the background flusher on the current runtime.
    pub fn new(inner: Arc<dyn QueueClient>, config: BufferConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let config = BufferConfig {
            max_batch_size: config.max_batch_size.clamp(1, MAX_BATCH_SIZE),
            ..config
        };
        let flusher = tokio::spawn(run_flusher(inner.clone(), config, receiver));

        BufferedQueueClient {
            inner,
            commands,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Flushes every pending entry and stops the background flusher.
    ///
    /// Operations issued afterwards are sent to the inner client unbatched.
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        let handle = self.flusher.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.commands.send(Command::Shutdown);
            if let Err(e) = handle.await {
                warn!(error = %e, "Buffered client flusher terminated abnormally");
            }
            info!("Buffered queue client flushed and shut down");
        }
    }

    async fn enqueue(
        &self,
        command: Command,
        reply: oneshot::Receiver<Result<(), SqsListenerError>>,
    ) -> Option<Result<(), SqsListenerError>> {
        if self.commands.send(command).is_err() {
            return None;
        }
        reply.await.ok()
    }
}

#[async_trait]
impl QueueClient for BufferedQueueClient {
    async fn get_queue_url(&self, queue_name: &str) -> Result<String, SqsListenerError> {
        self.inner.get_queue_url(queue_name).await
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>, SqsListenerError> {
        self.inner.receive_messages(queue_url, request).await
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
    ) -> Result<(), SqsListenerError> {
        let (reply, response) = oneshot::channel();
        let command = Command::Delete {
            queue_url: queue_url.to_string(),
            receipt_handle: receipt_handle.clone(),
            reply,
        };
        match self.enqueue(command, response).await {
            Some(result) => result,
            None => self.inner.delete_message(queue_url, receipt_handle).await,
        }
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
        visibility_timeout_seconds: i32,
    ) -> Result<(), SqsListenerError> {
        let (reply, response) = oneshot::channel();
        let command = Command::ChangeVisibility {
            queue_url: queue_url.to_string(),
            receipt_handle: receipt_handle.clone(),
            visibility_timeout_seconds,
            reply,
        };
        match self.enqueue(command, response).await {
            Some(result) => result,
            None => {
                self.inner
                    .change_message_visibility(queue_url, receipt_handle, visibility_timeout_seconds)
                    .await
            }
        }
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        message_attributes: &HashMap<String, String>,
    ) -> Result<String, SqsListenerError> {
        self.inner
            .send_message(queue_url, body, message_attributes)
            .await
    }
}

async fn run_flusher(
    inner: Arc<dyn QueueClient>,
    config: BufferConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut pending: HashMap<(BatchKind, String), PendingBatch> = HashMap::new();

    loop {
        let next_deadline = pending
            .values()
            .map(|batch| batch.opened_at + config.max_batch_open)
            .min();

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => {
                    if let Some(key) = push(&mut pending, command) {
                        let full = pending
                            .get(&key)
                            .is_some_and(|batch| batch.entries.len() >= config.max_batch_size);
                        if full {
                            if let Some(batch) = pending.remove(&key) {
                                flush(inner.as_ref(), key, batch).await;
                            }
                        }
                    }
                }
            },
            _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                let now = Instant::now();
                let expired: Vec<_> = pending
                    .iter()
                    .filter(|(_, batch)| batch.opened_at + config.max_batch_open <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in expired {
                    if let Some(batch) = pending.remove(&key) {
                        flush(inner.as_ref(), key, batch).await;
                    }
                }
            }
        }
    }

    // Drain whatever was queued behind the shutdown request.
    commands.close();
    while let Some(command) = commands.recv().await {
        push(&mut pending, command);
    }

    for (key, batch) in pending.drain() {
        for chunk in split(batch, config.max_batch_size) {
            flush(inner.as_ref(), key.clone(), chunk).await;
        }
    }
}

fn push(
    pending: &mut HashMap<(BatchKind, String), PendingBatch>,
    command: Command,
) -> Option<(BatchKind, String)> {
    let (key, entry) = match command {
        Command::Delete {
            queue_url,
            receipt_handle,
            reply,
        } => (
            (BatchKind::Delete, queue_url),
            PendingEntry {
                receipt_handle,
                visibility_timeout_seconds: 0,
                reply,
            },
        ),
        Command::ChangeVisibility {
            queue_url,
            receipt_handle,
            visibility_timeout_seconds,
            reply,
        } => (
            (BatchKind::ChangeVisibility, queue_url),
            PendingEntry {
                receipt_handle,
                visibility_timeout_seconds,
                reply,
            },
        ),
        Command::Shutdown => return None,
    };

    pending
        .entry(key.clone())
        .or_insert_with(|| PendingBatch {
            opened_at: Instant::now(),
            entries: Vec::new(),
        })
        .entries
        .push(entry);
    Some(key)
}

fn split(batch: PendingBatch, size: usize) -> Vec<PendingBatch> {
    let opened_at = batch.opened_at;
    let mut chunks = Vec::new();
    let mut entries = batch.entries.into_iter().peekable();
    while entries.peek().is_some() {
        chunks.push(PendingBatch {
            opened_at,
            entries: entries.by_ref().take(size).collect(),
        });
    }
    chunks
}

async fn flush(inner: &dyn QueueClient, (kind, queue_url): (BatchKind, String), batch: PendingBatch) {
    let count = batch.entries.len();
    debug!(queue = %queue_url, ?kind, count, "Flushing batch");

    let outcome = match kind {
        BatchKind::Delete => {
            let entries = batch
                .entries
                .iter()
                .enumerate()
                .map(|(i, entry)| BatchEntry {
                    id: i.to_string(),
                    receipt_handle: entry.receipt_handle.clone(),
                })
                .collect();
            inner.delete_message_batch(&queue_url, entries).await
        }
        BatchKind::ChangeVisibility => {
            let entries = batch
                .entries
                .iter()
                .enumerate()
                .map(|(i, entry)| VisibilityBatchEntry {
                    id: i.to_string(),
                    receipt_handle: entry.receipt_handle.clone(),
                    visibility_timeout_seconds: entry.visibility_timeout_seconds,
                })
                .collect();
            inner.change_message_visibility_batch(&queue_url, entries).await
        }
    };

    match outcome {
        Ok(results) => {
            let mut by_id: HashMap<String, Result<(), SqsListenerError>> = results
                .into_iter()
                .map(|BatchEntryResult { id, result }| (id, result))
                .collect();
            for (i, entry) in batch.entries.into_iter().enumerate() {
                let result = by_id.remove(&i.to_string()).unwrap_or_else(|| {
                    Err(GenericError::new(format!(
                        "{kind:?} batch response for {queue_url} has no result for entry {i}"
                    ))
                    .into())
                });
                let _ = entry.reply.send(result);
            }
        }
        Err(e) => {
            warn!(queue = %queue_url, ?kind, count, error = %e, "Batch call failed");
            for entry in batch.entries {
                let _ = entry.reply.send(Err(e.clone()));
            }
        }
    }
}
