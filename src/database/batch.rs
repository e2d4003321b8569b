use std::collections::VecDeque;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::RecorderSettings;
use super::client::TimeSeriesDb;
use super::models::Record;
use super::DatabaseError;

/// Sink for one flushed batch. Implementations must write the whole batch
/// atomically or fail without side effects.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write_batch(&self, records: &[Record]) -> Result<u64, DatabaseError>;
}

#[async_trait]
impl BatchWriter for TimeSeriesDb {
    async fn write_batch(&self, records: &[Record]) -> Result<u64, DatabaseError> {
        TimeSeriesDb::write_batch(self, records).await
    }
}

/// A batch that could not be written after every retry
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub error: String,
    pub records: Vec<Record>,
}

/// Bounded holding area for exhausted batches, optionally mirrored to a JSONL file
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    path: Option<PathBuf>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize, path: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            path,
        }
    }

    pub async fn push(&self, letter: DeadLetter) {
        error!(
            batch_size = letter.records.len(),
            attempts = letter.attempts,
            error = %letter.error,
            "🚨 Batch dead-lettered after exhausting retries"
        );

        if let Some(path) = &self.path {
            if let Err(e) = append_json_line(path, &letter).await {
                error!("Failed to append dead letter to {}: {}", path.display(), e);
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                error!(
                    batch_size = evicted.records.len(),
                    failed_at = %evicted.failed_at,
                    "Dead-letter queue full, evicting oldest batch"
                );
            }
        }
        entries.push_back(letter);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every held batch, e.g. to replay it once the store recovers
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

async fn append_json_line(path: &Path, letter: &DeadLetter) -> Result<(), DatabaseError> {
    let mut line = serde_json::to_string(letter)
        .map_err(|e| DatabaseError::SerializationError(format!("Failed to serialize dead letter: {}", e)))?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| DatabaseError::InitializationError(format!("Failed to open dead-letter file: {}", e)))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to write dead letter: {}", e)))?;
    file.flush()
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to flush dead letter: {}", e)))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub records_written: u64,
    pub flushes: u64,
    pub failed_attempts: u64,
    pub dead_lettered_batches: u64,
}

struct RecorderInner {
    buffer: Mutex<Vec<Record>>,
    writer: Arc<dyn BatchWriter>,
    settings: RecorderSettings,
    flush_now: Notify,
    running: AtomicBool,
    dead_letters: DeadLetterQueue,
    records_written: AtomicU64,
    flushes: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered_batches: AtomicU64,
}

/// Buffers records in memory and flushes them to the store in the background.
///
/// `add` only takes a short-lived lock and never waits on I/O. The flush
/// task swaps the buffer out before writing, so producers keep appending
/// while a batch is in flight. Cloning yields another handle to the same
/// buffer.
#[derive(Clone)]
pub struct BatchRecorder {
    inner: Arc<RecorderInner>,
}

impl BatchRecorder {
    pub fn new(writer: Arc<dyn BatchWriter>, settings: RecorderSettings) -> Self {
        let dead_letters = DeadLetterQueue::new(settings.dead_letter_capacity, settings.dead_letter_path.clone());
        Self {
            inner: Arc::new(RecorderInner {
                buffer: Mutex::new(Vec::with_capacity(settings.max_buffer_size)),
                writer,
                settings,
                flush_now: Notify::new(),
                running: AtomicBool::new(true),
                dead_letters,
                records_written: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
                failed_attempts: AtomicU64::new(0),
                dead_lettered_batches: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue a record. Requests an immediate flush once the buffer reaches
    /// its size threshold.
    pub fn add(&self, record: Record) {
        let pending = {
            let mut buffer = self.inner.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(record);
            buffer.len()
        };

        if pending >= self.inner.settings.max_buffer_size {
            debug!(pending = pending, "Buffer threshold reached, requesting flush");
            self.inner.flush_now.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.inner.dead_letters
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            records_written: self.inner.records_written.load(Ordering::Relaxed),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            failed_attempts: self.inner.failed_attempts.load(Ordering::Relaxed),
            dead_lettered_batches: self.inner.dead_lettered_batches.load(Ordering::Relaxed),
        }
    }

    /// Start the periodic flush task
    pub fn spawn(&self) -> JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move { recorder.run().await })
    }

    #[instrument(skip(self))]
    async fn run(&self) {
        let flush_interval = Duration::from_millis(self.inner.settings.flush_interval_ms.max(1));
        let mut ticker = interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("📦 Batch recorder started (flush every {:?})", flush_interval);

        while self.inner.running.load(Ordering::Acquire) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.inner.flush_now.notified() => {}
            }
            if !self.inner.running.load(Ordering::Acquire) {
                break;
            }
            self.flush().await;
        }

        info!("📦 Batch recorder stopped");
    }

    /// Write everything buffered so far. Returns the number of records handed
    /// to the writer; an empty buffer is a no-op.
    pub async fn flush(&self) -> usize {
        let batch = {
            let mut buffer = self.inner.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return 0;
        }

        let batch_size = batch.len();
        let started = Instant::now();
        self.write_with_retry(batch).await;
        let elapsed = started.elapsed();

        let budget = Duration::from_millis(self.inner.settings.flush_interval_ms) / 2;
        if elapsed > budget {
            warn!(
                batch_size = batch_size,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow flush exceeded half the flush interval"
            );
        }
        batch_size
    }

    async fn write_with_retry(&self, batch: Vec<Record>) {
        let max_retries = self.inner.settings.max_retries;
        let mut attempt: u32 = 0;

        loop {
            match self.inner.writer.write_batch(&batch).await {
                Ok(inserted) => {
                    self.inner.flushes.fetch_add(1, Ordering::Relaxed);
                    self.inner.records_written.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!(batch_size = batch.len(), inserted = inserted, attempt = attempt, "Batch flushed");
                    return;
                }
                Err(e) => {
                    self.inner.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    if attempt >= max_retries {
                        self.inner.dead_lettered_batches.fetch_add(1, Ordering::Relaxed);
                        self.inner
                            .dead_letters
                            .push(DeadLetter {
                                failed_at: Utc::now(),
                                attempts: attempt + 1,
                                error: e.to_string(),
                                records: batch,
                            })
                            .await;
                        return;
                    }

                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        batch_size = batch.len(),
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Batch flush failed, retrying: {}",
                        e
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Delay before retry `n` (1-based): base, 2x base, 4x base ... capped
    fn backoff_delay(&self, retry: u32) -> Duration {
        let settings = &self.inner.settings;
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(settings.base_backoff_ms.saturating_mul(factor).min(settings.max_backoff_ms))
    }

    /// Stop the flush task and write whatever is still buffered
    pub async fn shutdown(&self) -> usize {
        self.inner.running.store(false, Ordering::Release);
        self.inner.flush_now.notify_one();
        let flushed = self.flush().await;
        info!(flushed = flushed, "📦 Batch recorder drained on shutdown");
        flushed
    }
}
