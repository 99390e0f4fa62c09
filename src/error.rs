use thiserror::Error;

/// Errors returned by the split history store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SplitStoreError {
    /// `since` is older than the oldest mutation retained by the log; the
    /// caller must fall back to an authoritative upstream fetch.
    #[error("summary not cached for changeNumber")]
    NotCached,
}

/// Errors returned by the segment store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SegmentStoreError {
    #[error("segment not found: {0}")]
    NotFound(String),
}

/// Error kinds surfaced by the synchronizer and upstream fetcher, matching
/// the error taxonomy in the design's §7 Error Handling section.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Upstream rejected our credentials. Fatal at startup; logged and
    /// retried on every later cycle.
    #[error("upstream authentication failed: {0}")]
    Authentication(String),

    /// A network error, 5xx, 429, or timeout. Retried with backoff.
    #[error("transient upstream error: {0}")]
    Transient(#[source] anyhow::Error),

    /// A non-retryable 4xx response other than 429.
    #[error("upstream rejected request: {0}")]
    Rejected(String),
}

impl SyncError {
    /// Whether this failure should trigger the task's backoff-and-retry
    /// path, as opposed to being logged and skipped until the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

/// Fatal startup errors, mapped to process exit codes by `main`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),

    #[error("invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("task initialization failed: {0}")]
    TaskInit(#[source] anyhow::Error),
}

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 1;
pub const EXIT_INVALID_API_KEY: i32 = 2;
pub const EXIT_TASK_INIT_FAILED: i32 = 3;

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => EXIT_CONFIG_ERROR,
            StartupError::InvalidApiKey(_) => EXIT_INVALID_API_KEY,
            StartupError::TaskInit(_) => EXIT_TASK_INIT_FAILED,
        }
    }
}
