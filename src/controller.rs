//! Component F: the SDK-facing HTTP controller.
//!
//! Thin `axum` handlers that read the split/segment stores (A/B) and tag
//! their responses for the surrogate cache (C) via request extensions
//! (the idiomatic-Rust analogue of the teacher's dynamic context-map
//! pattern). [`cache_middleware`] is the one place that actually consults
//! and populates the cache; handlers only ever set markers on the response.

use crate::cache::{tags, RequestFingerprint};
use crate::error::{SegmentStoreError, SplitStoreError};
use crate::App;
use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

/// Set by a handler to mark its response safe to store and replay until
/// its tags are purged (§6 `StickyContextKey`).
#[derive(Clone, Copy)]
struct Sticky(bool);

/// Set by a handler alongside [`Sticky`] to name the surrogate tag
/// families covering its response (§6 `SurrogateContextKey`).
#[derive(Clone)]
struct Surrogate(Vec<String>);

fn tagged(status: StatusCode, body: serde_json::Value, tags: Vec<String>, sticky: bool) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.extensions_mut().insert(Surrogate(tags));
    response.extensions_mut().insert(Sticky(sticky));
    response
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    tracing::warn!(%message, %status, "request failed");
    (status, Json(serde_json::json!({"error": message.to_string()}))).into_response()
}

pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/api/splitChanges", get(split_changes))
        .route("/api/segmentChanges/:name", get(segment_changes))
        .route("/api/mySegments/:key", get(my_segments))
        .route("/api/testImpressions/bulk", post(impressions_bulk))
        .route("/api/events/bulk", post(events_bulk))
        .route("/version", get(version))
        .route("/healthcheck", get(healthcheck))
        .layer(axum::middleware::from_fn_with_state(
            app.clone(),
            cache_middleware,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

#[derive(serde::Deserialize)]
struct SinceQuery {
    #[serde(default = "default_since")]
    since: i64,
}

fn default_since() -> i64 {
    -1
}

/// `/splitChanges?since=S`. Falls back to the upstream fetcher directly on
/// `ErrSummaryNotCached`, re-registering the result into the store so later
/// queries in that window are served from memory (§4.F).
#[tracing::instrument(skip(app))]
async fn split_changes(
    State(app): State<Arc<App>>,
    Query(SinceQuery { since }): Query<SinceQuery>,
) -> Response {
    match app.splits.changes_since(since) {
        Ok(changes) => tagged(
            StatusCode::OK,
            serde_json::json!({"since": changes.since, "till": changes.till, "splits": changes.splits}),
            vec![tags::SPLITS.to_string()],
            true,
        ),
        Err(SplitStoreError::NotCached) => match app.fetcher.split_changes(since).await {
            Ok(fetched) => {
                let mutations = crate::sync::mutations_from_wire(&fetched);
                app.splits.update(mutations);
                tagged(
                    StatusCode::OK,
                    serde_json::json!({"since": fetched.since, "till": fetched.till, "splits": fetched.splits}),
                    vec![tags::SPLITS.to_string()],
                    true,
                )
            }
            Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
        },
    }
}

/// `/segmentChanges/<name>?since=S`.
#[tracing::instrument(skip(app))]
async fn segment_changes(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Query(SinceQuery { since }): Query<SinceQuery>,
) -> Response {
    match app.segments.changes_since(&name, since) {
        Ok(changes) => tagged(
            StatusCode::OK,
            serde_json::json!({
                "name": changes.name,
                "since": changes.since,
                "till": changes.till,
                "added": changes.added,
                "removed": changes.removed,
            }),
            vec![tags::segment(&name)],
            true,
        ),
        Err(SegmentStoreError::NotFound(name)) => {
            error_response(StatusCode::NOT_FOUND, format!("segment not found: {name}"))
        }
    }
}

/// `/mySegments/<key>`.
#[tracing::instrument(skip(app))]
async fn my_segments(State(app): State<Arc<App>>, Path(key): Path<String>) -> Response {
    let mut names = app.segments.segments_for(&key);
    names.sort();
    let dto: Vec<_> = names
        .into_iter()
        .map(|name| serde_json::json!({"name": name}))
        .collect();

    tagged(
        StatusCode::OK,
        serde_json::json!({"mySegments": dto}),
        vec![tags::my_segments(&key)],
        true,
    )
}

async fn version() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")})),
    )
        .into_response()
}

/// Reflects lifecycle readiness (component G): 200 once initial
/// synchronization has completed, 200 with `healthy: false` otherwise (the
/// process is still starting or initial sync failed but has not yet
/// exited).
async fn healthcheck(State(app): State<Arc<App>>) -> Response {
    let healthy = app.lifecycle.ready.load(std::sync::atomic::Ordering::Acquire);
    (StatusCode::OK, Json(serde_json::json!({"healthy": healthy}))).into_response()
}

/// Accepts a JSON array of impression (or event) batches and enqueues each
/// element verbatim; on queue-full the oldest entry is dropped and a
/// counter incremented (§5 Backpressure), never surfaced to the caller as
/// an error, matching the at-least-once/best-effort telemetry contract.
async fn impressions_bulk(State(app): State<Arc<App>>, Json(batch): Json<serde_json::Value>) -> Response {
    push_batch(&app.impressions, batch);
    StatusCode::OK.into_response()
}

async fn events_bulk(State(app): State<Arc<App>>, Json(batch): Json<serde_json::Value>) -> Response {
    push_batch(&app.events, batch);
    StatusCode::OK.into_response()
}

fn push_batch(queue: &crate::queue::TelemetryQueue, batch: serde_json::Value) {
    match batch {
        serde_json::Value::Array(records) => {
            for record in records {
                queue.push(record);
            }
        }
        other => queue.push(other),
    }
}

/// The one place that reads and populates the surrogate cache (component
/// C). Only GET requests are cache candidates; a response is stored only
/// when the wrapped handler both succeeded (2xx) and marked itself
/// [`Sticky`] (§4.C Cacheability).
async fn cache_middleware(State(app): State<Arc<App>>, req: Request, next: Next) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let fingerprint = fingerprint_of(&req);
    if let Some(body) = app.cache.get(&fingerprint) {
        return Response::builder()
            .status(StatusCode::OK)
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("building cached response never fails");
    }

    let response = next.run(req).await;
    if !response.status().is_success() {
        return response;
    }

    let sticky = response.extensions().get::<Sticky>().map(|s| s.0).unwrap_or(false);
    if !sticky {
        return response;
    }
    let surrogate_tags = response
        .extensions()
        .get::<Surrogate>()
        .map(|s| s.0.clone())
        .unwrap_or_default();

    let (parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return Response::from_parts(parts, Body::empty());
    };
    app.cache.insert(fingerprint, bytes.clone(), surrogate_tags);
    Response::from_parts(parts, Body::from(bytes))
}

/// Request fingerprint = method + path + sorted query string (§4.C).
fn fingerprint_of(req: &Request) -> RequestFingerprint {
    let mut pairs: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    pairs.sort();
    let sorted_query = pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    RequestFingerprint::new(req.method().as_str(), req.uri().path(), &sorted_query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Lifecycle;
    use crate::segments::SegmentStore;
    use crate::splits::{SplitMutation, SplitStore};
    use crate::sync::{SyncConfig, Synchronizer};
    use crate::upstream::fake::FakeUpstream;
    use axum::body::to_bytes;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_app() -> (Arc<App>, Arc<FakeUpstream>) {
        let fetcher = Arc::new(FakeUpstream::default());
        let splits = Arc::new(SplitStore::default());
        let segments = Arc::new(SegmentStore::default());
        let cache = Arc::new(crate::cache::SurrogateCache::default());
        let impressions = Arc::new(crate::queue::TelemetryQueue::new("impressions", 100));
        let events = Arc::new(crate::queue::TelemetryQueue::new("events", 100));
        let synchronizer = Arc::new(Synchronizer::new(
            splits.clone(),
            segments.clone(),
            cache.clone(),
            impressions.clone(),
            events.clone(),
            Arc::new(crate::eviction::EvictionCalculator::new(10, 500.0)),
            Arc::new(crate::eviction::EvictionCalculator::new(10, 500.0)),
            fetcher.clone(),
            SyncConfig::default(),
        ));
        let app = Arc::new(App {
            splits,
            segments,
            cache,
            impressions,
            events,
            fetcher: fetcher.clone(),
            synchronizer,
            lifecycle: {
                let lifecycle = Lifecycle::new();
                lifecycle.ready.store(true, std::sync::atomic::Ordering::Release);
                lifecycle
            },
        });
        (app, fetcher)
    }

    #[tokio::test]
    async fn split_changes_served_from_store() {
        let (app, _fetcher) = test_app();
        app.splits.update([SplitMutation {
            change_number: 5,
            name: "f".into(),
            previous_change_number: None,
            payload: Some(serde_json::json!({"name": "f", "changeNumber": 5})),
            recorded_at: std::time::Instant::now(),
        }]);

        let router = build_router(app);
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/splitChanges?since=-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["till"], 5);
        assert_eq!(json["splits"][0]["name"], "f");
    }

    #[tokio::test]
    async fn repeat_request_is_served_from_cache() {
        // S4 from the design doc.
        let (app, _fetcher) = test_app();
        app.splits.update([SplitMutation {
            change_number: 1,
            name: "f".into(),
            previous_change_number: None,
            payload: Some(serde_json::json!({"name": "f"})),
            recorded_at: std::time::Instant::now(),
        }]);
        let cache = app.cache.clone();
        let router = build_router(app);

        let req = || {
            HttpRequest::builder()
                .uri("/api/splitChanges?since=-1")
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(cache.len(), 0);
        let first = router.clone().oneshot(req()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(cache.len(), 1);

        let second = router.clone().oneshot(req()).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn unknown_segment_is_404() {
        let (app, _fetcher) = test_app();
        let router = build_router(app);
        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/segmentChanges/nope?since=-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn my_segments_reflects_membership() {
        let (app, _fetcher) = test_app();
        app.segments
            .update("vip", ["alice".to_string()].into_iter().collect(), Default::default(), 1);
        let router = build_router(app);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/mySegments/alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["mySegments"][0]["name"], "vip");
    }

    #[tokio::test]
    async fn impressions_bulk_enqueues_records() {
        let (app, _fetcher) = test_app();
        let impressions = app.impressions.clone();
        let router = build_router(app);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/testImpressions/bulk")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!([{"f": "a"}, {"f": "b"}]).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(impressions.len(), 2);
    }

    #[tokio::test]
    async fn healthcheck_reflects_readiness() {
        let (app, _fetcher) = test_app();
        app.lifecycle.ready.store(false, std::sync::atomic::Ordering::Release);
        let router = build_router(app);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/healthcheck")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["healthy"], false);
    }
}
