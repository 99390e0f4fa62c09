//! Component G: lifecycle and readiness.
//!
//! Bootstraps the synchronizer (D) before the HTTP listeners accept
//! traffic, reports `Ready`/`Error` exactly once on a single-capacity
//! status channel, and drains in-flight telemetry on shutdown within a
//! bounded grace period.

use crate::error::StartupError;
use crate::sync::{Status, Synchronizer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Holds the process's readiness channel and flag. `status` is consulted
/// exactly once by the caller driving startup; `ready` backs the
/// `/healthcheck` handler and is safe to poll repeatedly from any worker.
pub struct Lifecycle {
    status_tx: watch::Sender<Option<Status>>,
    pub ready: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (status_tx, _rx) = watch::channel(None);
        Lifecycle {
            status_tx,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status_receiver(&self) -> watch::Receiver<Option<Status>> {
        self.status_tx.subscribe()
    }

    /// Runs one split sync and one segment sync, then sends exactly one
    /// `Ready`/`Error` value on the status channel (§4.D Initial
    /// synchronization). Returns the same outcome as a `Result` so the
    /// caller can map it to a process exit code.
    pub async fn run_initial_sync(&self, synchronizer: &Synchronizer) -> Result<(), StartupError> {
        match synchronizer.initial_sync().await {
            Ok(()) => {
                self.ready.store(true, Ordering::Release);
                let _ = self.status_tx.send(Some(Status::Ready));
                Ok(())
            }
            Err(err) => {
                let _ = self.status_tx.send(Some(Status::Error(err.to_string())));
                Err(if err.is_retryable() {
                    StartupError::TaskInit(err.into())
                } else {
                    StartupError::InvalidApiKey(err.to_string())
                })
            }
        }
    }

    /// Cancels in-flight synchronizer work and drains the impression/event
    /// queues, giving up after `grace_period` so shutdown is always
    /// bounded (§4.G).
    pub async fn shutdown(
        &self,
        synchronizer: &Synchronizer,
        cancel: &CancellationToken,
        grace_period: Duration,
    ) {
        cancel.cancel();

        let drain = async {
            loop {
                let impressions = synchronizer.run_impressions_push_once().await;
                let events = synchronizer.run_events_push_once().await;
                if synchronizer.impressions.is_empty() && synchronizer.events.is_empty() {
                    return;
                }
                if impressions.is_err() || events.is_err() {
                    // Upstream may be transiently unreachable; back off
                    // instead of busy-looping the remaining grace period
                    // against it. The outer timeout still bounds shutdown.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        };

        if tokio::time::timeout(grace_period, drain).await.is_err() {
            tracing::warn!(
                remaining_impressions = synchronizer.impressions.len(),
                remaining_events = synchronizer.events.len(),
                "shutdown grace period elapsed with telemetry still queued"
            );
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SurrogateCache;
    use crate::queue::TelemetryQueue;
    use crate::segments::SegmentStore;
    use crate::splits::SplitStore;
    use crate::sync::SyncConfig;
    use crate::upstream::fake::{FakeUpstream, SyncErrorKind};

    fn synchronizer(fetcher: Arc<FakeUpstream>) -> Synchronizer {
        Synchronizer::new(
            Arc::new(SplitStore::default()),
            Arc::new(SegmentStore::default()),
            Arc::new(SurrogateCache::default()),
            Arc::new(TelemetryQueue::new("impressions", 100)),
            Arc::new(TelemetryQueue::new("events", 100)),
            Arc::new(crate::eviction::EvictionCalculator::new(10, 500.0)),
            Arc::new(crate::eviction::EvictionCalculator::new(10, 500.0)),
            fetcher,
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn successful_initial_sync_reports_ready_exactly_once() {
        let fetcher = Arc::new(FakeUpstream::default());
        let sync = synchronizer(fetcher);
        let lifecycle = Lifecycle::new();
        let mut status = lifecycle.status_receiver();

        lifecycle.run_initial_sync(&sync).await.unwrap();

        assert!(lifecycle.ready.load(Ordering::Acquire));
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), Some(Status::Ready));
    }

    #[tokio::test]
    async fn auth_failure_reports_error_and_never_ready() {
        // S5 from the design doc.
        let fetcher = Arc::new(FakeUpstream::default());
        fetcher.fail_next_with(SyncErrorKind::Authentication);
        let sync = synchronizer(fetcher);
        let lifecycle = Lifecycle::new();
        let mut status = lifecycle.status_receiver();

        let result = lifecycle.run_initial_sync(&sync).await;
        assert!(result.is_err());
        assert!(!lifecycle.ready.load(Ordering::Acquire));

        status.changed().await.unwrap();
        assert!(matches!(*status.borrow(), Some(Status::Error(_))));
    }

    #[tokio::test]
    async fn shutdown_drains_queued_telemetry_within_grace_period() {
        let fetcher = Arc::new(FakeUpstream::default());
        let sync = synchronizer(fetcher.clone());
        sync.impressions.push(serde_json::json!({"f": "a"}));
        sync.events.push(serde_json::json!({"f": "b"}));

        let lifecycle = Lifecycle::new();
        let cancel = CancellationToken::new();
        lifecycle
            .shutdown(&sync, &cancel, Duration::from_secs(5))
            .await;

        assert!(cancel.is_cancelled());
        assert!(sync.impressions.is_empty());
        assert!(sync.events.is_empty());
        assert_eq!(fetcher.pushed_impressions.lock().unwrap().len(), 1);
    }
}
