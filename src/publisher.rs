// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbox message publisher.
//!
//! Messages are JSON files handed to [`MessagePublisher::enqueue`]. Each file
//! carries at minimum a `topic` and a `payload`, and optionally `priority`,
//! `priority_slot`, `compress` (`gzip`/`deflate`) and `qos`. Sequencing
//! metadata (topic, priority, slot, timestamp) is fixed at enqueue time from
//! the raw file; the letterhead applied later can never alter it.
//!
//! At dispatch the message is overlaid on a *letterhead* (a static JSON
//! file, or the output of a generator binary invoked per message) and the
//! resulting payload is flattened, optionally compressed, and published.
//! Transient publish failures are retried through the queue's bulk path up
//! to the configured budget; everything else fails the delivery.
//!
//! The embedding layer drives [`MessagePublisher::handle_connect`] and
//! [`MessagePublisher::handle_disconnect`]; the queue starts paused and only
//! dispatches while connected.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{LetterheadSource, PublisherConfig};
use crate::document::overlay;
use crate::queue::{DispatchQueue, QueueEntry, QueueEvent};
use crate::transport::{MessageTransport, PublishOptions, TransportError};

/// Timeout for a letterhead generator invocation.
const GENERATOR_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_QOS: u8 = 1;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("missing '{key}' in {path}, unable to publish")]
    MissingKey { key: &'static str, path: PathBuf },
    #[error("letterhead generation failed: {0}")]
    Letterhead(String),
    #[error("payload compression failed: {0}")]
    Compress(#[from] std::io::Error),
    #[error("publish failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        source: TransportError,
    },
}

/// Receives the final outcome of an enqueued message: `Ok(())` once
/// published, or the error that made the delivery fail for good.
pub type Delivery = oneshot::Receiver<Result<(), PublishError>>;

/// Sequencing-relevant fields of a raw message file.
#[derive(Debug, Deserialize)]
struct Preview {
    topic: Option<String>,
    priority: Option<i64>,
    priority_slot: Option<String>,
}

/// The merged letterhead + message document, as published.
#[derive(Debug, Deserialize)]
struct Letter {
    topic: Option<Value>,
    payload: Option<Value>,
    compress: Option<String>,
    qos: Option<u8>,
}

/// An enqueued outbox message.
pub struct OutboxMessage {
    path: PathBuf,
    name: String,
    timestamp: i64,
    priority: Option<i64>,
    priority_slot: Option<String>,
    topic: String,
    retries: AtomicU32,
    outcome: Mutex<Option<oneshot::Sender<Result<(), PublishError>>>>,
}

impl OutboxMessage {
    /// The decorated topic this message will be published on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn resolve(&self, result: Result<(), PublishError>) {
        if let Some(tx) = self.outcome.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl QueueEntry for OutboxMessage {
    fn name(&self) -> &str {
        &self.name
    }
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
    fn priority(&self) -> Option<i64> {
        self.priority
    }
    fn priority_slot(&self) -> Option<&str> {
        self.priority_slot.as_deref()
    }
}

/// Publishes outbox messages through a [`MessageTransport`], ordered and
/// throttled by a [`DispatchQueue`].
pub struct MessagePublisher {
    queue: DispatchQueue<OutboxMessage>,
    transport: Arc<dyn MessageTransport>,
    config: PublisherConfig,
    on_jam: Box<dyn Fn() + Send + Sync>,
}

impl MessagePublisher {
    /// Create a publisher. The queue starts paused; call
    /// [`handle_connect`](Self::handle_connect) once the transport is up.
    /// `on_jam` fires when the queue saturates for the configured timeout,
    /// a fatal condition the embedder is expected to escalate.
    pub fn new(
        config: PublisherConfig,
        transport: Arc<dyn MessageTransport>,
        on_jam: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (queue, rx) = DispatchQueue::new(&config.queue);
        queue.pause();
        let publisher = Arc::new(Self {
            queue,
            transport,
            config,
            on_jam: Box::new(on_jam),
        });
        let this = Arc::clone(&publisher);
        tokio::spawn(this.run(rx));
        publisher
    }

    /// Enqueue the message file at `path`.
    ///
    /// The file is read once here to fix its sequencing metadata. Returns a
    /// [`Delivery`] resolving when the message is finally published or
    /// failed; an unreadable or malformed file fails immediately.
    pub async fn enqueue(&self, path: impl Into<PathBuf>) -> Result<Delivery, PublishError> {
        let path = path.into();
        let raw = read_json(&path).await?;
        let preview: Preview = serde_json::from_value(raw).map_err(|source| {
            PublishError::Malformed {
                path: path.clone(),
                source,
            }
        })?;
        let Some(topic) = preview.topic else {
            return Err(PublishError::MissingKey {
                key: "topic",
                path,
            });
        };
        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map_err(|source| PublishError::Read {
                path: path.clone(),
                source,
            })?;
        let timestamp = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let (tx, rx) = oneshot::channel();
        let message = Arc::new(OutboxMessage {
            name: path.display().to_string(),
            path,
            timestamp,
            priority: preview.priority,
            priority_slot: preview.priority_slot,
            topic: format!(
                "{}{}{}",
                self.config.topic_prefix, topic, self.config.topic_suffix
            ),
            retries: AtomicU32::new(0),
            outcome: Mutex::new(Some(tx)),
        });
        debug!(name = %message.name, topic = %message.topic, "message enqueued");
        self.queue.add(message);
        Ok(rx)
    }

    /// The transport came up: start (or resume) dispatching.
    pub fn handle_connect(&self) {
        info!("transport connected, resuming message dispatch");
        self.queue.resume();
    }

    /// The transport went down: hold messages until reconnect.
    pub fn handle_disconnect(&self) {
        info!("transport disconnected, pausing message dispatch");
        self.queue.pause();
    }

    /// Messages dispatched but not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.queue.pending_count()
    }

    /// Messages still waiting for a concurrency slot.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.queue.queued_count()
    }

    async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<QueueEvent<OutboxMessage>>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                QueueEvent::Item { item, was_priority } => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.dispatch(item, was_priority).await;
                    });
                }
                QueueEvent::Jammed => {
                    error!("message queue jammed, escalating");
                    (self.on_jam)();
                }
            }
        }
    }

    async fn dispatch(&self, item: Arc<OutboxMessage>, was_priority: bool) {
        let (payload, options) = match self.prepare(&item, was_priority).await {
            Ok(prepared) => prepared,
            Err(e) => {
                // Free the concurrency slot before failing the delivery
                self.queue.complete(&item);
                warn!(name = %item.name, error = %e, "error loading letterhead/message");
                item.resolve(Err(e));
                return;
            }
        };

        match self.transport.publish(&item.topic, payload, options).await {
            Ok(()) => {
                self.queue.complete(&item);
                debug!(name = %item.name, topic = %item.topic, "message published");
                item.resolve(Ok(()));
            }
            Err(e) => {
                self.queue.complete(&item);
                let attempts = item.retries.fetch_add(1, Ordering::SeqCst) + 1;
                if attempts < self.config.max_retries {
                    warn!(name = %item.name, attempts, "publish failed, requeueing");
                    self.queue.requeue(item);
                } else {
                    warn!(name = %item.name, attempts, error = %e, "publish failed, giving up");
                    item.resolve(Err(PublishError::Exhausted {
                        attempts,
                        source: e,
                    }));
                }
            }
        }
    }

    /// Build the wire payload: letterhead underneath, message on top,
    /// payload flattened to bytes and optionally compressed.
    async fn prepare(
        &self,
        item: &OutboxMessage,
        was_priority: bool,
    ) -> Result<(Vec<u8>, PublishOptions), PublishError> {
        let letterhead = self.letterhead(item, was_priority).await?;
        let message = read_json(&item.path).await?;
        let merged = overlay(letterhead, message);
        let letter: Letter =
            serde_json::from_value(merged).map_err(|source| PublishError::Malformed {
                path: item.path.clone(),
                source,
            })?;

        if letter.topic.as_ref().map_or(true, |t| t.is_null()) {
            return Err(PublishError::MissingKey {
                key: "topic",
                path: item.path.clone(),
            });
        }
        let payload = match letter.payload {
            None | Some(Value::Null) => {
                return Err(PublishError::MissingKey {
                    key: "payload",
                    path: item.path.clone(),
                });
            }
            Some(Value::String(s)) => s.into_bytes(),
            // Structured payloads go out as their JSON text
            Some(other) => serde_json::to_vec(&other).map_err(|source| {
                PublishError::Malformed {
                    path: item.path.clone(),
                    source,
                }
            })?,
        };

        let payload = match letter.compress.as_deref() {
            Some("gzip") => {
                let mut enc = GzEncoder::new(Vec::new(), Compression::default());
                std::io::Write::write_all(&mut enc, &payload)?;
                enc.finish()?
            }
            Some("deflate") => {
                let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
                std::io::Write::write_all(&mut enc, &payload)?;
                enc.finish()?
            }
            Some(other) => {
                warn!(compress = other, "ignoring unsupported compression");
                payload
            }
            None => payload,
        };

        let options = PublishOptions {
            qos: letter.qos.unwrap_or(DEFAULT_QOS),
        };
        Ok((payload, options))
    }

    async fn letterhead(
        &self,
        item: &OutboxMessage,
        was_priority: bool,
    ) -> Result<Value, PublishError> {
        match &self.config.letterhead {
            None => Ok(Value::Object(serde_json::Map::new())),
            Some(LetterheadSource::File(path)) => read_json(path).await,
            Some(LetterheadSource::Generator(bin)) => {
                generate_letterhead(bin, item, was_priority).await
            }
        }
    }
}

async fn read_json(path: &Path) -> Result<Value, PublishError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| {
        PublishError::Read {
            path: path.to_path_buf(),
            source,
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|source| PublishError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Invoke the letterhead generator with the message metadata in its
/// environment and parse its stdout as JSON.
async fn generate_letterhead(
    bin: &Path,
    item: &OutboxMessage,
    was_priority: bool,
) -> Result<Value, PublishError> {
    let mut cmd = tokio::process::Command::new(bin);
    cmd.env("MESSAGE_TOPIC", &item.topic)
        .env("MESSAGE_TIMESTAMP", item.timestamp.to_string())
        .env("MESSAGE_TIMESTAMP_S", (item.timestamp / 1000).to_string())
        .env("MESSAGE_FILENAME", &item.name)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true);
    if let Some(priority) = item.priority {
        cmd.env("MESSAGE_PRIORITY", priority.to_string());
    }
    if let Some(slot) = &item.priority_slot {
        cmd.env("MESSAGE_PRIORITY_SLOT", slot);
    }
    if was_priority {
        cmd.env("MESSAGE_WAS_PRIORITISED", "1");
    }

    let output = tokio::time::timeout(GENERATOR_TIMEOUT, cmd.output())
        .await
        .map_err(|_| PublishError::Letterhead(format!("{} timed out", bin.display())))?
        .map_err(|e| PublishError::Letterhead(format!("{} failed to run: {e}", bin.display())))?;
    if !output.status.success() {
        return Err(PublishError::Letterhead(format!(
            "{} exited with {}",
            bin.display(),
            output.status
        )));
    }
    serde_json::from_slice(&output.stdout)
        .map_err(|e| PublishError::Letterhead(format!("{} produced invalid JSON: {e}", bin.display())))
}
