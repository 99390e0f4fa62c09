//! Component I: the upstream control-plane fetcher.
//!
//! Captures the handful of calls the synchronizer needs behind a trait so
//! tests can substitute an in-memory fake rather than talking to a real
//! control plane.

use crate::error::SyncError;
use crate::segments::SegmentChanges;
use crate::splits::SplitChanges;
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn split_changes(&self, since: i64) -> Result<SplitChanges, SyncError>;
    async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges, SyncError>;
    async fn push_impressions(&self, batch: Vec<serde_json::Value>) -> Result<(), SyncError>;
    async fn push_events(&self, batch: Vec<serde_json::Value>) -> Result<(), SyncError>;
}

/// `reqwest`-backed implementation of [`UpstreamFetcher`], authenticating
/// with a bearer API key and enforcing the per-request timeout (§5).
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: reqwest::Url,
    api_key: String,
}

impl HttpFetcher {
    pub fn new(base_url: reqwest::Url, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpFetcher {
            client,
            base_url,
            api_key,
        })
    }

    fn map_status(status: reqwest::StatusCode, body: String) -> SyncError {
        if status.as_u16() == 401 || status.as_u16() == 403 {
            SyncError::Authentication(body)
        } else if status.as_u16() == 429 || status.is_server_error() {
            SyncError::Transient(anyhow::anyhow!("upstream returned {status}: {body}"))
        } else {
            SyncError::Rejected(format!("{status}: {body}"))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| SyncError::Rejected(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Transient(e.into()))
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<(), SyncError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| SyncError::Rejected(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        Ok(())
    }
}

#[async_trait]
impl UpstreamFetcher for HttpFetcher {
    async fn split_changes(&self, since: i64) -> Result<SplitChanges, SyncError> {
        #[derive(serde::Deserialize)]
        struct Wire {
            since: i64,
            till: i64,
            splits: Vec<serde_json::Value>,
        }
        let wire: Wire = self
            .get_json(&format!("api/splitChanges?since={since}"))
            .await?;
        Ok(SplitChanges {
            since: wire.since,
            till: wire.till,
            splits: wire.splits,
        })
    }

    async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges, SyncError> {
        #[derive(serde::Deserialize)]
        struct Wire {
            name: String,
            since: i64,
            till: i64,
            added: Vec<String>,
            removed: Vec<String>,
        }
        let wire: Wire = self
            .get_json(&format!("api/segmentChanges/{name}?since={since}"))
            .await?;
        Ok(SegmentChanges {
            name: wire.name,
            since: wire.since,
            till: wire.till,
            added: wire.added,
            removed: wire.removed,
        })
    }

    async fn push_impressions(&self, batch: Vec<serde_json::Value>) -> Result<(), SyncError> {
        self.post_json("api/testImpressions/bulk", &serde_json::Value::Array(batch))
            .await
    }

    async fn push_events(&self, batch: Vec<serde_json::Value>) -> Result<(), SyncError> {
        self.post_json("api/events/bulk", &serde_json::Value::Array(batch))
            .await
    }
}

/// An in-memory [`UpstreamFetcher`] used by unit and integration tests in
/// place of a real control plane.
pub mod fake {
    use super::*;
    use crate::segments::SegmentChanges;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeUpstream {
        split_batches: Mutex<Vec<SplitChanges>>,
        segment_batches: Mutex<std::collections::HashMap<String, Vec<SegmentChanges>>>,
        pub pushed_impressions: Mutex<Vec<serde_json::Value>>,
        pub pushed_events: Mutex<Vec<serde_json::Value>>,
        fail_with: Mutex<Option<SyncErrorKind>>,
    }

    #[derive(Clone, Copy)]
    pub enum SyncErrorKind {
        Authentication,
        Transient,
        Rejected,
    }

    impl FakeUpstream {
        pub fn push_split_batch(&self, batch: SplitChanges) {
            self.split_batches.lock().unwrap().push(batch);
        }

        pub fn push_segment_batch(&self, name: &str, batch: SegmentChanges) {
            self.segment_batches
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push(batch);
        }

        pub fn fail_next_with(&self, kind: SyncErrorKind) {
            *self.fail_with.lock().unwrap() = Some(kind);
        }

        fn take_failure(&self) -> Option<SyncError> {
            self.fail_with.lock().unwrap().take().map(|kind| match kind {
                SyncErrorKind::Authentication => SyncError::Authentication("denied".into()),
                SyncErrorKind::Transient => SyncError::Transient(anyhow::anyhow!("unreachable")),
                SyncErrorKind::Rejected => SyncError::Rejected("bad request".into()),
            })
        }
    }

    #[async_trait]
    impl UpstreamFetcher for FakeUpstream {
        async fn split_changes(&self, since: i64) -> Result<SplitChanges, SyncError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let batches = self.split_batches.lock().unwrap();
            Ok(batches
                .iter()
                .rev()
                .find(|b| b.since <= since)
                .cloned()
                .unwrap_or(SplitChanges {
                    since,
                    till: since,
                    splits: Vec::new(),
                }))
        }

        async fn segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges, SyncError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let batches = self.segment_batches.lock().unwrap();
            Ok(batches
                .get(name)
                .and_then(|bs| bs.iter().rev().find(|b| b.since <= since))
                .cloned()
                .unwrap_or(SegmentChanges {
                    name: name.to_string(),
                    since,
                    till: since,
                    added: Vec::new(),
                    removed: Vec::new(),
                }))
        }

        async fn push_impressions(&self, batch: Vec<serde_json::Value>) -> Result<(), SyncError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            self.pushed_impressions.lock().unwrap().extend(batch);
            Ok(())
        }

        async fn push_events(&self, batch: Vec<serde_json::Value>) -> Result<(), SyncError> {
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            self.pushed_events.lock().unwrap().extend(batch);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_classifies_error_kinds() {
        assert!(matches!(
            HttpFetcher::map_status(reqwest::StatusCode::UNAUTHORIZED, String::new()),
            SyncError::Authentication(_)
        ));
        assert!(matches!(
            HttpFetcher::map_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            SyncError::Transient(_)
        ));
        assert!(matches!(
            HttpFetcher::map_status(reqwest::StatusCode::BAD_GATEWAY, String::new()),
            SyncError::Transient(_)
        ));
        assert!(matches!(
            HttpFetcher::map_status(reqwest::StatusCode::BAD_REQUEST, String::new()),
            SyncError::Rejected(_)
        ));
    }
}
