//! Buffered telemetry.
//!
//! Three event streams — the weighted activity log, outbound-HTTP log
//! lines, and internal metric points — share one in-memory buffer. The
//! request path appends to one of a handful of mutex shards (round-robin,
//! so a hot shard never serializes producers) and returns immediately; a
//! flusher task swaps the shards out on a timer or a high-water notify and
//! persists each batch as a single write-queue job.
//!
//! The buffer must never block or fail a request: when the queue reports
//! overload, events return to the buffer up to a hard ceiling, beyond which
//! the oldest are dropped and counted.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use fazt_storage::StorageBackend;

use crate::error::{QueueError, TelemetryError};
use crate::queue::WriteQueue;

const ACTIVITY_PREFIX: &str = "log/activity/";
const HTTP_PREFIX: &str = "log/http/";
const METRIC_PREFIX: &str = "log/metric/";

/// Who performed an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// `user`, `apikey`, `app`, or `system`.
    pub kind: String,
    pub id: String,
}

/// One weighted activity entry. Weight runs 0–9; higher is more important,
/// retained longer, and surfaced in admin views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub ts: DateTime<Utc>,
    pub actor: Actor,
    pub resource: String,
    pub action: String,
    pub result: String,
    pub weight: u8,
}

/// One outbound HTTP call made by a handler script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundHttpEntry {
    pub ts: DateTime<Utc>,
    pub app_id: String,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub duration_ms: u64,
}

/// One internal metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub ts: DateTime<Utc>,
    pub name: String,
    pub value: f64,
}

/// Any buffered event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Activity(ActivityEntry),
    Http(OutboundHttpEntry),
    Metric(MetricPoint),
}

impl TelemetryEvent {
    fn key_prefix(&self) -> &'static str {
        match self {
            Self::Activity(_) => ACTIVITY_PREFIX,
            Self::Http(_) => HTTP_PREFIX,
            Self::Metric(_) => METRIC_PREFIX,
        }
    }

    fn ts(&self) -> DateTime<Utc> {
        match self {
            Self::Activity(e) => e.ts,
            Self::Http(e) => e.ts,
            Self::Metric(e) => e.ts,
        }
    }
}

/// Counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryStats {
    pub buffered: usize,
    pub flushed: u64,
    pub dropped: u64,
}

/// The shared buffer.
pub struct TelemetryBuffer {
    shards: Vec<Mutex<Vec<TelemetryEvent>>>,
    next_shard: AtomicUsize,
    notify: Notify,
    /// Flush once any shard holds this many entries.
    high_water: usize,
    /// Total buffered events above which the oldest are dropped.
    ceiling: usize,
    seq: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
}

impl TelemetryBuffer {
    /// `high_water` is the per-shard flush trigger (spec default 1000);
    /// `ceiling` bounds retained events under persistent overload.
    #[must_use]
    pub fn new(shards: usize, high_water: usize, ceiling: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(Vec::new())).collect(),
            next_shard: AtomicUsize::new(0),
            notify: Notify::new(),
            high_water: high_water.max(1),
            ceiling: ceiling.max(1),
            seq: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an event. Never blocks on I/O, never fails.
    pub fn record(&self, event: TelemetryEvent) {
        let idx = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let len = {
            let mut shard = self.shards[idx]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            shard.push(event);
            shard.len()
        };
        if len >= self.high_water {
            self.notify.notify_one();
        }
    }

    /// Convenience: record an activity entry.
    pub fn activity(&self, actor: Actor, resource: &str, action: &str, result: &str, weight: u8) {
        self.record(TelemetryEvent::Activity(ActivityEntry {
            ts: Utc::now(),
            actor,
            resource: resource.to_owned(),
            action: action.to_owned(),
            result: result.to_owned(),
            weight: weight.min(9),
        }));
    }

    /// Convenience: record a metric sample.
    pub fn metric(&self, name: &str, value: f64) {
        self.record(TelemetryEvent::Metric(MetricPoint {
            ts: Utc::now(),
            name: name.to_owned(),
            value,
        }));
    }

    /// Swap every shard out and persist the batch as one queue job.
    ///
    /// On queue overload the events return to the buffer (bounded by the
    /// ceiling; oldest dropped beyond it). Returns the number persisted.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Storage`] when the commit itself fails.
    pub async fn flush(
        &self,
        storage: &Arc<dyn StorageBackend>,
        queue: &WriteQueue,
    ) -> Result<usize, TelemetryError> {
        let mut events: Vec<TelemetryEvent> = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            events.append(&mut guard);
        }
        if events.is_empty() {
            return Ok(0);
        }

        let mut batch: Vec<(String, Option<Vec<u8>>)> = Vec::with_capacity(events.len());
        for event in &events {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let micros = event.ts().timestamp_micros().max(0);
            let key = format!("{}{micros:020}-{seq:08}", event.key_prefix());
            match serde_json::to_vec(event) {
                Ok(bytes) => batch.push((key, Some(bytes))),
                Err(e) => {
                    // An unserializable event is a bug; drop it, keep the batch.
                    warn!(error = %e, "telemetry event dropped: serialization failed");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let count = batch.len();
        let storage = Arc::clone(storage);
        match queue
            .submit(move || async move { storage.put_batch(batch).await })
            .await
        {
            Ok(Ok(())) => {
                self.flushed.fetch_add(count as u64, Ordering::Relaxed);
                debug!(count, "telemetry flushed");
                Ok(count)
            }
            Ok(Err(e)) => Err(TelemetryError::Storage(e)),
            Err(QueueError::Overloaded | QueueError::ShutDown | QueueError::WorkerGone) => {
                self.requeue(events);
                Ok(0)
            }
        }
    }

    /// Put unflushed events back, respecting the ceiling.
    fn requeue(&self, mut events: Vec<TelemetryEvent>) {
        let mut shard = self.shards[0]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        events.append(&mut shard);
        if events.len() > self.ceiling {
            let overflow = events.len() - self.ceiling;
            events.drain(..overflow);
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
            warn!(dropped = overflow, "telemetry ceiling hit, oldest events dropped");
        }
        *shard = events;
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> TelemetryStats {
        let buffered = self
            .shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum();
        TelemetryStats {
            buffered,
            flushed: self.flushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TelemetryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBuffer")
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

/// The flusher worker. Runs until shutdown is signalled, then flushes one
/// final time; events recorded after that are discarded with the process.
pub async fn run_flusher(
    buffer: Arc<TelemetryBuffer>,
    storage: Arc<dyn StorageBackend>,
    queue: Arc<WriteQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = buffer.flush(&storage, &queue).await {
                    warn!(error = %e, "telemetry flush failed");
                }
            }
            () = buffer.notify.notified() => {
                if let Err(e) = buffer.flush(&storage, &queue).await {
                    warn!(error = %e, "telemetry flush failed");
                }
            }
            _ = shutdown.changed() => {
                if let Err(e) = buffer.flush(&storage, &queue).await {
                    warn!(error = %e, "final telemetry flush failed");
                }
                debug!("telemetry flusher stopped");
                return;
            }
        }
    }
}

/// Read stored activity entries with at least `min_weight`, most recent
/// last, capped at `limit`.
///
/// # Errors
///
/// Returns [`TelemetryError::Storage`] or [`TelemetryError::Corrupt`].
pub async fn read_activity(
    storage: &Arc<dyn StorageBackend>,
    min_weight: u8,
    limit: usize,
) -> Result<Vec<ActivityEntry>, TelemetryError> {
    let pairs = storage.scan(ACTIVITY_PREFIX).await?;
    let mut entries = Vec::new();
    for (key, bytes) in pairs {
        let event: TelemetryEvent =
            serde_json::from_slice(&bytes).map_err(|e| TelemetryError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if let TelemetryEvent::Activity(entry) = event {
            if entry.weight >= min_weight {
                entries.push(entry);
            }
        }
    }
    let skip = entries.len().saturating_sub(limit);
    Ok(entries.split_off(skip))
}

/// Prune stored activity entries: everything with weight **at or below**
/// `max_weight` that is older than `cutoff` is removed. Returns the number
/// pruned.
///
/// # Errors
///
/// Returns [`TelemetryError::Queue`] or [`TelemetryError::Storage`].
pub async fn prune_activity(
    storage: &Arc<dyn StorageBackend>,
    queue: &WriteQueue,
    max_weight: u8,
    cutoff: DateTime<Utc>,
) -> Result<usize, TelemetryError> {
    let pairs = storage.scan(ACTIVITY_PREFIX).await?;
    let mut doomed = Vec::new();
    for (key, bytes) in pairs {
        let event: TelemetryEvent =
            serde_json::from_slice(&bytes).map_err(|e| TelemetryError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if let TelemetryEvent::Activity(entry) = event {
            if entry.weight <= max_weight && entry.ts < cutoff {
                doomed.push(key);
            }
        }
    }
    if doomed.is_empty() {
        return Ok(0);
    }

    let count = doomed.len();
    let storage = Arc::clone(storage);
    queue
        .submit(move || async move {
            let batch = doomed.into_iter().map(|k| (k, None)).collect();
            storage.put_batch(batch).await
        })
        .await??;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fazt_storage::MemoryBackend;

    fn actor() -> Actor {
        Actor {
            kind: "system".to_owned(),
            id: "boot".to_owned(),
        }
    }

    #[tokio::test]
    async fn flush_persists_buffered_events() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        let buffer = TelemetryBuffer::new(4, 1000, 10_000);

        buffer.activity(actor(), "app/blog", "deploy", "ok", 5);
        buffer.metric("request_ms", 12.5);

        let flushed = buffer.flush(&storage, &queue).await.unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(buffer.stats().buffered, 0);

        assert_eq!(storage.list(ACTIVITY_PREFIX).await.unwrap().len(), 1);
        assert_eq!(storage.list(METRIC_PREFIX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flush_of_empty_buffer_is_zero() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        let buffer = TelemetryBuffer::new(4, 1000, 10_000);
        assert_eq!(buffer.flush(&storage, &queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_activity_filters_by_weight() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        let buffer = TelemetryBuffer::new(1, 1000, 10_000);

        buffer.activity(actor(), "a", "x", "ok", 1);
        buffer.activity(actor(), "b", "y", "ok", 7);
        buffer.flush(&storage, &queue).await.unwrap();

        let high = read_activity(&storage, 5, 100).await.unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].resource, "b");

        let all = read_activity(&storage, 0, 100).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn read_activity_caps_at_limit_keeping_recent() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        let buffer = TelemetryBuffer::new(1, 1000, 10_000);

        for i in 0..5 {
            buffer.activity(actor(), &format!("r{i}"), "x", "ok", 5);
        }
        buffer.flush(&storage, &queue).await.unwrap();

        let last_two = read_activity(&storage, 0, 2).await.unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].resource, "r4");
    }

    #[tokio::test]
    async fn prune_removes_old_low_weight_entries() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(64);
        let buffer = TelemetryBuffer::new(1, 1000, 10_000);

        buffer.activity(actor(), "low", "x", "ok", 1);
        buffer.activity(actor(), "high", "x", "ok", 9);
        buffer.flush(&storage, &queue).await.unwrap();

        let pruned = prune_activity(&storage, &queue, 3, Utc::now()).await.unwrap();
        assert_eq!(pruned, 1);

        let remaining = read_activity(&storage, 0, 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].resource, "high");
    }

    #[tokio::test]
    async fn overloaded_queue_requeues_up_to_ceiling() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let queue = WriteQueue::start(8);
        // Drain the queue so every submit reports ShutDown (stands in for
        // persistent overload).
        queue.drain().await;

        let buffer = TelemetryBuffer::new(1, 1000, 3);
        for i in 0..5 {
            buffer.metric(&format!("m{i}"), 1.0);
        }

        let flushed = buffer.flush(&storage, &queue).await.unwrap();
        assert_eq!(flushed, 0);
        let stats = buffer.stats();
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.dropped, 2);
    }
}
