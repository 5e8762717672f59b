//! # Off-chain Action Records
//!
//! Analytics are fire-and-forget: [`RecordSink::record_action`] never blocks
//! and never reports failure back to the caller, so a broken analytics path
//! cannot change a mint outcome.

use anyhow::Result;
use serde_json::Value;
use smallvec::SmallVec;
use sqlx::sqlite::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub trait RecordSink: Send + Sync {
    fn record_action(&self, actor: &str, action: &str, payload: Value);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecordSink;

impl RecordSink for NoopRecordSink {
    fn record_action(&self, _actor: &str, _action: &str, _payload: Value) {}
}

/// Configuration for batched record writes
#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct RecordSinkConfig {
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for RecordSinkConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            batch_size: 200,
            flush_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub actor: String,
    pub action: String,
    pub payload: String,
    pub timestamp: i64,
}

/// Record sink writing to the `action_log` table through a bounded channel.
///
/// Not Clone because it owns the flush task; share it behind an `Arc`.
#[derive(Debug)]
pub struct SqliteRecordSink {
    sender: Option<mpsc::Sender<ActionRecord>>,
    flush_handle: Option<JoinHandle<()>>,
    queued: AtomicU64,
    dropped: AtomicU64,
}

impl SqliteRecordSink {
    pub fn spawn(pool: SqlitePool, config: RecordSinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let flush_handle = tokio::spawn(async move {
            record_flush_worker(rx, pool, config).await;
        });

        info!(
            "Action log enabled (channel: {}, batch: {}, interval: {}ms)",
            config.channel_capacity, config.batch_size, config.flush_interval_ms
        );

        Self {
            sender: Some(tx),
            flush_handle: Some(flush_handle),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// (queued, dropped) counts since start.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.queued.load(Ordering::SeqCst),
            self.dropped.load(Ordering::SeqCst),
        )
    }

    /// Flush pending records and stop the background worker.
    pub async fn shutdown(mut self) -> Result<()> {
        self.sender = None;

        if let Some(handle) = self.flush_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => info!("Action log flush completed"),
                Ok(Err(e)) => error!("Action log flush task error: {}", e),
                Err(_) => warn!("Action log flush timeout - some records may be lost"),
            }
        }
        Ok(())
    }
}

impl RecordSink for SqliteRecordSink {
    fn record_action(&self, actor: &str, action: &str, payload: Value) {
        let Some(sender) = &self.sender else {
            return;
        };

        let record = ActionRecord {
            actor: actor.to_string(),
            action: action.to_string(),
            payload: payload.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };

        match sender.try_send(record) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                warn!("Dropped action record '{}' (channel full)", action);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                debug!("Dropped action record '{}' (sink closed)", action);
            }
        }
    }
}

/// Records buffered between flushes; small batches stay off the heap.
type Batch = SmallVec<[ActionRecord; 32]>;

async fn record_flush_worker(
    mut rx: mpsc::Receiver<ActionRecord>,
    pool: SqlitePool,
    config: RecordSinkConfig,
) {
    let mut batch = Batch::new();
    let period = Duration::from_millis(config.flush_interval_ms.max(1));
    let mut flush_interval = tokio::time::interval_at(Instant::now() + period, period);
    flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(entry) = received else {
                    // Every sender is gone.
                    break;
                };
                batch.push(entry);

                if batch.len() >= config.batch_size {
                    flush_logged(&mut batch, &pool, "Failed to flush action records").await;
                }
            }

            _ = flush_interval.tick() => {
                flush_logged(&mut batch, &pool, "Failed to flush action records").await;
            }
        }
    }

    let remaining = batch.len();
    if remaining > 0 {
        flush_logged(&mut batch, &pool, "Final action log flush failed").await;
        info!("Final action log flush: {} entries", remaining);
    }
}

async fn flush_logged(batch: &mut Batch, pool: &SqlitePool, context: &str) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = flush_batch(batch, pool).await {
        error!("{}: {}", context, e);
    }
    batch.clear();
}

async fn flush_batch(batch: &[ActionRecord], pool: &SqlitePool) -> Result<()> {
    let start = Instant::now();

    let mut tx = pool.begin().await?;
    for row in batch {
        sqlx::query("INSERT INTO action_log (actor, action, payload, timestamp) VALUES (?, ?, ?, ?)")
            .bind(&row.actor)
            .bind(&row.action)
            .bind(&row.payload)
            .bind(row.timestamp)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    debug!(
        target: "database",
        "Flushed {} action records in {}ms",
        batch.len(),
        start.elapsed().as_millis()
    );

    Ok(())
}
