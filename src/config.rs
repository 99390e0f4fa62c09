//! Component J: configuration and CLI.
//!
//! A `clap`-derived [`Cli`] layered the way the original source's
//! `PopulateDefaults -> PopulateConfigFromFile -> PopulateFromArguments`
//! does: built-in default, then an optional config file, then environment
//! variables, then explicit CLI flags, each able to override the last.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn humantime_ms(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// A proxy in front of a feature-flag control plane, caching and
/// re-serving its split and segment definitions to SDKs.
#[derive(Debug, Parser, Serialize, Deserialize)]
#[command(about, version)]
pub struct Cli {
    /// Path to a JSON config file merged beneath environment and CLI
    /// values.
    #[arg(long)]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Writes the default configuration as JSON to the given path and
    /// exits.
    #[arg(long)]
    #[serde(skip)]
    pub write_default_conf: Option<PathBuf>,

    /// Upstream control-plane base URL.
    #[arg(long, env = "SPLIT_PROXY_UPSTREAM_URL", default_value = "https://sdk.split.io")]
    pub upstream_url: reqwest::Url,

    /// Credential sent as a bearer token to the upstream control plane.
    #[arg(long, env = "SPLITIO_API_KEY")]
    pub apikey: String,

    /// Host the SDK-facing HTTP server binds to.
    #[arg(long, env = "SPLIT_PROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port the SDK-facing HTTP server binds to.
    #[arg(long, env = "SPLIT_PROXY_PORT", default_value = "3000")]
    pub port: u16,

    /// Host the admin/metrics server binds to.
    #[arg(long, env = "SPLIT_PROXY_ADMIN_HOST", default_value = "0.0.0.0")]
    pub admin_host: String,
    /// Port the admin/metrics server binds to.
    #[arg(long, env = "SPLIT_PROXY_ADMIN_PORT", default_value = "3010")]
    pub admin_port: u16,

    /// Period of the split sync task.
    #[arg(long, env = "SPLIT_PROXY_SPLIT_REFRESH_RATE_MS", value_parser = humantime_ms, default_value = "60s")]
    pub split_refresh_rate: Duration,
    /// Period of the segment sync task.
    #[arg(long, env = "SPLIT_PROXY_SEGMENT_REFRESH_RATE_MS", value_parser = humantime_ms, default_value = "60s")]
    pub segment_refresh_rate: Duration,
    /// Bounded worker-pool size for segment sync.
    #[arg(long, env = "SPLIT_PROXY_SEGMENT_WORKER_COUNT", default_value = "10")]
    pub segment_worker_count: usize,

    /// `optimized` enables per-feature impression dedup; `debug` sends all.
    #[arg(long, env = "SPLIT_PROXY_IMPRESSIONS_MODE", default_value = "optimized")]
    pub impressions_mode: ImpressionsMode,
    /// Enables push-based (streaming) updates in place of polling.
    #[arg(long, env = "SPLIT_PROXY_STREAMING_ENABLED", default_value = "false")]
    pub streaming_enabled: bool,
    /// Capacity of the impressions queue.
    #[arg(long, env = "SPLIT_PROXY_IMPRESSIONS_QUEUE_SIZE", default_value = "100000")]
    pub impressions_queue_size: usize,
    /// Capacity of the events queue.
    #[arg(long, env = "SPLIT_PROXY_EVENTS_QUEUE_SIZE", default_value = "100000")]
    pub events_queue_size: usize,
    /// Period of the impressions/events telemetry push tasks.
    #[arg(long, env = "SPLIT_PROXY_TELEMETRY_PUSH_INTERVAL_MS", value_parser = humantime_ms, default_value = "30s")]
    pub telemetry_push_interval: Duration,

    /// Surrogate cache absolute TTL.
    #[arg(long, env = "SPLIT_PROXY_CACHE_TTL_SECONDS", value_parser = humantime_ms, default_value = "5s")]
    pub cache_ttl: Duration,
    /// Surrogate cache LRU capacity.
    #[arg(long, env = "SPLIT_PROXY_CACHE_MAX_ENTRIES", default_value = "10000")]
    pub cache_max_entries: usize,

    /// Forwards each pushed impression batch to this webhook. Accepted for
    /// configuration-compatibility; no sender is implemented (see
    /// DESIGN.md).
    #[arg(long, env = "SPLIT_PROXY_IMPRESSION_LISTENER_ENDPOINT")]
    pub impression_listener_endpoint: Option<reqwest::Url>,

    /// Per-request timeout for upstream calls.
    #[arg(long, env = "SPLIT_PROXY_UPSTREAM_TIMEOUT_MS", value_parser = humantime_ms, default_value = "30s")]
    pub upstream_timeout: Duration,

    /// Grace period allowed for in-flight work to drain on shutdown.
    #[arg(long, env = "SPLIT_PROXY_SHUTDOWN_GRACE_PERIOD_MS", value_parser = humantime_ms, default_value = "30s")]
    pub shutdown_grace_period: Duration,
}

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImpressionsMode {
    Optimized,
    Debug,
}

impl Cli {
    /// Parses CLI flags, applies environment variables through `clap`'s own
    /// `env` resolution, then overlays any value present in `--config-file`
    /// that was not explicitly set on the command line or environment.
    ///
    /// `clap` already gives us flag > env > built-in default; the config
    /// file sits as the last, lowest-precedence layer, read after parsing
    /// so its presence can be validated against the already-parsed CLI.
    pub fn load() -> anyhow::Result<Self> {
        use clap::{CommandFactory, FromArgMatches};

        let matches = Cli::command().get_matches();
        let mut cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

        if let Some(path) = &cli.config_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let file_defaults: FileConfig = serde_json::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            file_defaults.apply_as_fallback(&mut cli, &matches);
        }

        Ok(cli)
    }
}

/// The subset of [`Cli`] fields that may be sourced from a config file,
/// serialized by `--write-default-conf`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileConfig {
    upstream_url: Option<reqwest::Url>,
    apikey: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    admin_host: Option<String>,
    admin_port: Option<u16>,
}

impl FileConfig {
    /// Only fills in values the CLI/env layers left at their built-in
    /// default, so a config file can never out-rank an explicit flag or
    /// environment variable.
    fn apply_as_fallback(self, cli: &mut Cli, matches: &clap::ArgMatches) {
        use clap::parser::ValueSource;

        let overridable = |id: &str| {
            !matches!(
                matches.value_source(id),
                Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
            )
        };

        if overridable("upstream_url") {
            if let Some(v) = self.upstream_url {
                cli.upstream_url = v;
            }
        }
        if overridable("apikey") {
            if let Some(v) = self.apikey {
                cli.apikey = v;
            }
        }
        if overridable("host") {
            if let Some(v) = self.host {
                cli.host = v;
            }
        }
        if overridable("port") {
            if let Some(v) = self.port {
                cli.port = v;
            }
        }
        if overridable("admin_host") {
            if let Some(v) = self.admin_host {
                cli.admin_host = v;
            }
        }
        if overridable("admin_port") {
            if let Some(v) = self.admin_port {
                cli.admin_port = v;
            }
        }
    }
}

impl From<&Cli> for FileConfig {
    fn from(cli: &Cli) -> Self {
        FileConfig {
            upstream_url: Some(cli.upstream_url.clone()),
            apikey: Some(cli.apikey.clone()),
            host: Some(cli.host.clone()),
            port: Some(cli.port),
            admin_host: Some(cli.admin_host.clone()),
            admin_port: Some(cli.admin_port),
        }
    }
}
