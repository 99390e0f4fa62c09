//! Component D: the synchronizer loop.
//!
//! Runs the periodic split/segment pulls and the telemetry pushes as
//! independent `tokio` tasks, each with its own backoff cursor, committing
//! into the split/segment stores and notifying the surrogate cache of the
//! resulting purges.

use crate::backoff::Backoff;
use crate::cache::{tags, SurrogateCache};
use crate::config::ImpressionsMode;
use crate::error::SyncError;
use crate::eviction::EvictionCalculator;
use crate::queue::TelemetryQueue;
use crate::segments::SegmentStore;
use crate::splits::{SplitMutation, SplitStore};
use crate::upstream::UpstreamFetcher;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub split_refresh: Duration,
    pub segment_refresh: Duration,
    pub segment_worker_count: usize,
    pub telemetry_push_interval: Duration,
    pub impressions_batch_size: usize,
    pub events_batch_size: usize,
    pub impressions_mode: ImpressionsMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            split_refresh: Duration::from_secs(60),
            segment_refresh: Duration::from_secs(60),
            segment_worker_count: 10,
            telemetry_push_interval: Duration::from_secs(30),
            impressions_batch_size: 500,
            events_batch_size: 500,
            impressions_mode: ImpressionsMode::Optimized,
        }
    }
}

/// Collapses impressions that share the same feature, key, and treatment
/// into one record carrying a `count`, the optimized-mode behavior
/// documented for `sync.impressionsMode` (§6): redundant evaluations of the
/// same feature/key/treatment within a push batch are common (polling
/// clients, repeated page loads) and the upstream only needs one sample per
/// combination plus how many times it happened. `debug` mode forwards every
/// impression unchanged.
fn dedup_impressions(batch: Vec<serde_json::Value>, mode: ImpressionsMode) -> Vec<serde_json::Value> {
    if mode == ImpressionsMode::Debug {
        return batch;
    }

    let mut order: Vec<String> = Vec::new();
    let mut by_fingerprint: HashMap<String, serde_json::Value> = HashMap::new();

    for record in batch {
        let fingerprint = impression_fingerprint(&record);
        match by_fingerprint.get_mut(&fingerprint) {
            Some(existing) => {
                let count = existing
                    .get("count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1);
                if let Some(obj) = existing.as_object_mut() {
                    obj.insert("count".to_string(), serde_json::json!(count + 1));
                }
            }
            None => {
                let mut record = record;
                if let Some(obj) = record.as_object_mut() {
                    obj.entry("count").or_insert(serde_json::json!(1));
                }
                order.push(fingerprint.clone());
                by_fingerprint.insert(fingerprint, record);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|fingerprint| by_fingerprint.remove(&fingerprint))
        .collect()
}

/// Identifies an impression by feature name, key, and treatment when those
/// fields are present, falling back to the whole record so malformed or
/// unfamiliar shapes are never silently merged.
fn impression_fingerprint(record: &serde_json::Value) -> String {
    match (record.get("f"), record.get("k"), record.get("t")) {
        (Some(f), Some(k), Some(t)) => format!("{f}\u{1}{k}\u{1}{t}"),
        _ => record.to_string(),
    }
}

/// Process readiness, reported exactly once on the lifecycle's status
/// channel (§4.G).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ready,
    Error(String),
}

pub struct Synchronizer {
    pub splits: Arc<SplitStore>,
    pub segments: Arc<SegmentStore>,
    pub cache: Arc<SurrogateCache>,
    pub impressions: Arc<TelemetryQueue>,
    pub events: Arc<TelemetryQueue>,
    /// Drain-rate estimators for the two telemetry queues (§4.E); fed from
    /// the push tasks below and surfaced through the `/metrics` endpoint.
    pub impressions_eviction: Arc<EvictionCalculator>,
    pub events_eviction: Arc<EvictionCalculator>,
    fetcher: Arc<dyn UpstreamFetcher>,
    config: SyncConfig,
}

impl Synchronizer {
    pub fn new(
        splits: Arc<SplitStore>,
        segments: Arc<SegmentStore>,
        cache: Arc<SurrogateCache>,
        impressions: Arc<TelemetryQueue>,
        events: Arc<TelemetryQueue>,
        impressions_eviction: Arc<EvictionCalculator>,
        events_eviction: Arc<EvictionCalculator>,
        fetcher: Arc<dyn UpstreamFetcher>,
        config: SyncConfig,
    ) -> Self {
        Synchronizer {
            splits,
            segments,
            cache,
            impressions,
            events,
            impressions_eviction,
            events_eviction,
            fetcher,
            config,
        }
    }

    /// Runs one split sync attempt: fetch since our current change-number,
    /// commit, and purge the `splits` surrogate tag. Returns the fetched
    /// batch's `till` on success.
    pub async fn run_split_sync_once(&self) -> Result<i64, SyncError> {
        let since = self.splits.current_change_number();
        let changes = self.fetcher.split_changes(since).await?;
        let till = changes.till;

        self.splits.update(mutations_from_wire(&changes));
        self.cache.purge_by_tag(tags::SPLITS);

        Ok(till)
    }

    /// Runs one segment sync attempt across every segment referenced by a
    /// live split, bounded to `segment_worker_count` concurrent fetches.
    pub async fn run_segment_sync_once(&self) -> Result<(), SyncError> {
        use futures::stream::StreamExt;

        let names = self.splits.names_of_registered_segments();
        let worker_count = self.config.segment_worker_count.max(1);

        let results: Vec<(String, Result<(), SyncError>)> = futures::stream::iter(names)
            .map(|name| async move {
                let result = self.sync_one_segment(name.clone()).await;
                (name, result)
            })
            .buffer_unordered(worker_count)
            .collect()
            .await;

        // A single segment's transient failure shouldn't fail the whole
        // cycle; every failure is logged, and the first hard failure
        // (auth/rejected) is still surfaced to the caller.
        let mut hard_failure = None;
        for (name, result) in results {
            if let Err(err) = result {
                tracing::warn!(segment = %name, error = %err, "segment sync failed");
                if hard_failure.is_none()
                    && matches!(err, SyncError::Authentication(_) | SyncError::Rejected(_))
                {
                    hard_failure = Some(err);
                }
            }
        }
        if let Some(err) = hard_failure {
            return Err(err);
        }
        Ok(())
    }

    async fn sync_one_segment(&self, name: String) -> Result<(), SyncError> {
        let since = self.segments.change_number(&name).unwrap_or(-1);
        let changes = self.fetcher.segment_changes(&name, since).await?;

        self.segments.update(
            &name,
            changes.added.into_iter().collect(),
            changes.removed.into_iter().collect(),
            changes.till,
        );

        self.cache.purge_by_tag(&tags::segment(&name));
        // Conservative: any segment change invalidates every mySegments
        // entry rather than tracking per-key reverse dependencies (§9).
        self.cache.purge_by_prefix(tags::MY_SEGMENTS_PREFIX);

        Ok(())
    }

    /// Drains and pushes up to one batch of impressions, deduplicating per
    /// §6 `sync.impressionsMode` before the upstream call.
    pub async fn run_impressions_push_once(&self) -> Result<usize, SyncError> {
        let batch = self.impressions.drain(self.config.impressions_batch_size);
        if batch.is_empty() {
            return Ok(0);
        }
        let n = batch.len();
        let batch = dedup_impressions(batch, self.config.impressions_mode);
        self.fetcher.push_impressions(batch).await?;
        self.impressions_eviction
            .store_data_flushed(Instant::now(), n as u64);
        metrics::gauge!("eviction_rate_per_minute", "queue" => "impressions")
            .set(self.impressions_eviction.rate());
        Ok(n)
    }

    /// Drains and pushes up to one batch of events.
    pub async fn run_events_push_once(&self) -> Result<usize, SyncError> {
        let batch = self.events.drain(self.config.events_batch_size);
        if batch.is_empty() {
            return Ok(0);
        }
        let n = batch.len();
        self.fetcher.push_events(batch).await?;
        self.events_eviction
            .store_data_flushed(Instant::now(), n as u64);
        metrics::gauge!("eviction_rate_per_minute", "queue" => "events")
            .set(self.events_eviction.rate());
        Ok(n)
    }

    /// Spawns every periodic task and returns once initial split and
    /// segment syncs have both completed (successfully or not). The caller
    /// uses the result to decide whether to report `Ready` or `Error` on
    /// the lifecycle status channel (§4.G).
    pub async fn initial_sync(&self) -> Result<(), SyncError> {
        self.run_split_sync_once().await?;
        self.run_segment_sync_once().await?;
        Ok(())
    }

    /// Spawns the long-running periodic tasks (split sync, segment sync,
    /// impressions push, events push), each independently backed off and
    /// cancellable via `stop`.
    pub fn spawn_periodic_tasks(self: &Arc<Self>, stop: CancellationToken) {
        spawn_periodic(
            self.clone(),
            stop.clone(),
            self.config.split_refresh,
            "split_sync",
            |s| Box::pin(async move { s.run_split_sync_once().await.map(|_| ()) }),
        );
        spawn_periodic(
            self.clone(),
            stop.clone(),
            self.config.segment_refresh,
            "segment_sync",
            |s| Box::pin(async move { s.run_segment_sync_once().await }),
        );
        spawn_periodic(
            self.clone(),
            stop.clone(),
            self.config.telemetry_push_interval,
            "impressions_push",
            |s| Box::pin(async move { s.run_impressions_push_once().await.map(|_| ()) }),
        );
        spawn_periodic(
            self.clone(),
            stop,
            self.config.telemetry_push_interval,
            "events_push",
            |s| Box::pin(async move { s.run_events_push_once().await.map(|_| ()) }),
        );
    }
}

/// Converts a fetched `SplitChanges` batch into the store's mutation log
/// entries, shared by the periodic split-sync task and the controller's
/// `ErrSummaryNotCached` direct-fetch fallback (§4.F).
pub fn mutations_from_wire(changes: &crate::splits::SplitChanges) -> Vec<SplitMutation> {
    changes
        .splits
        .iter()
        .map(|payload| SplitMutation {
            change_number: payload
                .get("changeNumber")
                .and_then(|v| v.as_i64())
                .unwrap_or(changes.till),
            name: payload
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            previous_change_number: None,
            payload: if payload.get("status").and_then(|v| v.as_str()) == Some("ARCHIVED") {
                None
            } else {
                Some(payload.clone())
            },
            recorded_at: std::time::Instant::now(),
        })
        .collect()
}

type TaskFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SyncError>> + Send>>;

fn spawn_periodic(
    synchronizer: Arc<Synchronizer>,
    stop: CancellationToken,
    period: Duration,
    task_name: &'static str,
    run_once: impl Fn(Arc<Synchronizer>) -> TaskFuture + Send + Sync + 'static,
) {
    tokio::spawn(async move {
        // Jitter the first tick so many replicas don't thunder-herd the
        // control plane on simultaneous startup.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..period.as_millis() as u64).max(1));
        tokio::time::sleep(jitter).await;

        let mut backoff = Backoff::default();
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.cancelled() => {
                    tracing::info!(task = task_name, "synchronizer task stopping");
                    return;
                }
            }

            match run_once(synchronizer.clone()).await {
                Ok(()) => backoff.reset(),
                Err(err) if err.is_retryable() => {
                    let delay = backoff.next_delay();
                    tracing::warn!(task = task_name, error = %err, ?delay, "transient sync failure, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.cancelled() => return,
                    }
                }
                Err(err) => {
                    tracing::error!(task = task_name, error = %err, "non-retryable sync failure, skipping this cycle");
                }
            }
        }
    });
}
