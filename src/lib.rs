//! A caching edge proxy in front of a feature-flag control plane: it
//! mirrors splits and segments into memory (A/B), re-serves them to SDKs
//! behind a surrogate cache (C/F), and forwards SDK telemetry upstream in
//! the background (D/H).

pub mod backoff;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod eviction;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod segments;
pub mod splits;
pub mod sync;
pub mod upstream;

use cache::SurrogateCache;
use lifecycle::Lifecycle;
use queue::TelemetryQueue;
use segments::SegmentStore;
use splits::SplitStore;
use std::sync::Arc;
use sync::Synchronizer;
use upstream::UpstreamFetcher;

/// The process's shared state, handed to both the SDK-facing router
/// (component F) and the admin/metrics router.
pub struct App {
    pub splits: Arc<SplitStore>,
    pub segments: Arc<SegmentStore>,
    pub cache: Arc<SurrogateCache>,
    pub impressions: Arc<TelemetryQueue>,
    pub events: Arc<TelemetryQueue>,
    pub fetcher: Arc<dyn UpstreamFetcher>,
    pub synchronizer: Arc<Synchronizer>,
    pub lifecycle: Lifecycle,
}
