use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "warn,orchestrator_live=info";
const DEFAULT_LOG_FILE: &str = "orchestrator-live.logs.jsonl";

/// Where log records go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogSink {
    /// Compact human-readable lines on stderr, so run output on stdout stays clean.
    Stderr,
    /// JSON lines appended to a file.
    JsonFile(PathBuf),
    Off,
}

/// Logging choices resolved from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub sink: LogSink,
    /// `EnvFilter` directives; `None` falls back to `RUST_LOG`, then the default.
    pub filter: Option<String>,
}

impl LogSettings {
    /// Reads:
    /// - `ORCHESTRATOR_LIVE_LOG`: `off` disables logging entirely.
    /// - `ORCHESTRATOR_LIVE_LOG_LEVEL`: filter directives, e.g. `orchestrator_live=debug`.
    /// - `ORCHESTRATOR_LIVE_JSON_LOG_PATH`: write JSON lines to this file instead of stderr.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("ORCHESTRATOR_LIVE_LOG")
            .and_then(|value| parse_switch(&value))
            .unwrap_or(true);
        let filter = lookup("ORCHESTRATOR_LIVE_LOG_LEVEL").filter(|v| !v.trim().is_empty());
        let sink = if !enabled {
            LogSink::Off
        } else {
            match lookup("ORCHESTRATOR_LIVE_JSON_LOG_PATH").filter(|v| !v.trim().is_empty()) {
                Some(path) => LogSink::JsonFile(PathBuf::from(path)),
                None => LogSink::Stderr,
            }
        };
        Self { sink, filter }
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(directives) = &self.filter
            && let Ok(filter) = EnvFilter::try_new(directives)
        {
            return filter;
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// Splits a log path into the appender's directory and file name.
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file)
}

/// Installs the global subscriber from [`LogSettings::from_env`].
/// Later calls, and calls after another subscriber was installed, do nothing.
pub fn init_observability() {
    init_with(LogSettings::from_env());
}

/// Installs the global subscriber from explicit settings, once per process.
pub fn init_with(settings: LogSettings) {
    INIT.get_or_init(|| {
        let filter = settings.env_filter();
        match &settings.sink {
            LogSink::Off => {}
            LogSink::Stderr => {
                let layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init();
            }
            LogSink::JsonFile(path) => {
                let (dir, file) = split_log_path(path);
                let _ = std::fs::create_dir_all(&dir);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(tracing_appender::rolling::never(dir, file));
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init();
            }
        }
    });
}
