//! Component K: structured logging install.
//!
//! A `tracing-subscriber` `fmt` layer over stderr, filtered by `EnvFilter`
//! (default `INFO`), installed once at process start. This is the ambient
//! logging stack every production service in the teacher's ecosystem
//! installs, minus the task-log-forwarding machinery that is specific to
//! the teacher's own domain and has no counterpart here.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub fn install() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    tracing_subscriber::registry().with(fmt_layer).init();
}
