//! Component K: metrics.
//!
//! Installs a `metrics-exporter-prometheus` recorder and serves it at
//! `/metrics` on the admin port, matching the teacher's
//! `metrics_server::build_router` pattern.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

pub fn build_router(handle: PrometheusHandle) -> axum::Router<()> {
    use axum::routing::get;

    axum::Router::new()
        .route("/metrics", get(prometheus_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(handle)
}

#[tracing::instrument(skip_all)]
async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<PrometheusHandle>,
) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::OK, handle.render())
}
