use std::time::Duration;

use tracing::warn;

use crate::errors::ClientError;
use crate::model::RunId;

/// Configuration for the run/patch client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the workflow server.
    pub base_url: String,
    /// Path of the endpoint that starts or resumes a run and streams its events.
    pub stream_path: String,
    /// Path of the runs collection (`<runs>/<id>`, `<runs>/<id>/cancel`, ...).
    pub runs_path: String,
    /// Poll `<runs>/<id>/status` instead of `<runs>/<id>`.
    pub status_suffix: bool,
    /// How long a stream may stay silent before polling takes over.
    pub health_window: Duration,
    /// Watchdog tick period.
    pub poll_interval: Duration,
    /// Timeout for one-shot requests (poll, commands, patches).
    ///
    /// The stream itself only has a connect timeout.
    pub request_timeout: Duration,
    /// Optional bearer token attached to every request.
    pub bearer_token: Option<String>,
}

impl ClientConfig {
    /// Creates a config with defaults for the given server.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stream_path: "/api/workflows/run".to_string(),
            runs_path: "/api/runs".to_string(),
            status_suffix: false,
            health_window: Duration::from_secs(15),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            bearer_token: None,
        }
    }

    /// Builds a config from `ORCHESTRATOR_LIVE_*` environment variables.
    ///
    /// - `ORCHESTRATOR_LIVE_BASE_URL` (required)
    /// - `ORCHESTRATOR_LIVE_TOKEN`
    /// - `ORCHESTRATOR_LIVE_HEALTH_WINDOW_SECS`
    /// - `ORCHESTRATOR_LIVE_POLL_INTERVAL_SECS`
    pub fn from_env() -> Result<Self, ClientError> {
        let base_url = std::env::var("ORCHESTRATOR_LIVE_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ClientError::Config(
                "missing ORCHESTRATOR_LIVE_BASE_URL".into(),
            ));
        }
        let mut config = Self::new(base_url);
        if let Ok(token) = std::env::var("ORCHESTRATOR_LIVE_TOKEN")
            && !token.trim().is_empty()
        {
            config.bearer_token = Some(token);
        }
        if let Some(secs) = env_secs("ORCHESTRATOR_LIVE_HEALTH_WINDOW_SECS")? {
            config.health_window = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("ORCHESTRATOR_LIVE_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the stream endpoint path.
    pub fn stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    /// Overrides the runs collection path.
    pub fn runs_path(mut self, path: impl Into<String>) -> Self {
        self.runs_path = path.into();
        self
    }

    /// Polls `<runs>/<id>/status` instead of `<runs>/<id>`.
    pub fn status_suffix(mut self, enabled: bool) -> Self {
        self.status_suffix = enabled;
        self
    }

    /// Overrides the stream health window.
    pub fn health_window(mut self, window: Duration) -> Self {
        self.health_window = window;
        self
    }

    /// Overrides the watchdog tick period.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the one-shot request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the bearer token.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.base_url.trim().is_empty() {
            return Err(ClientError::Config("base_url must not be empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ClientError::Config(
                "poll_interval must be greater than 0".into(),
            ));
        }
        if self.health_window.is_zero() {
            return Err(ClientError::Config(
                "health_window must be greater than 0".into(),
            ));
        }
        if self.health_window < self.poll_interval {
            warn!(
                health_window_ms = self.health_window.as_millis() as u64,
                poll_interval_ms = self.poll_interval.as_millis() as u64,
                "health window is shorter than the poll interval; every tick may poll"
            );
        }
        Ok(())
    }

    pub(crate) fn stream_url(&self) -> String {
        self.join(&self.stream_path)
    }

    pub(crate) fn run_status_url(&self, run_id: &RunId) -> String {
        let base = self.run_url(run_id);
        if self.status_suffix {
            format!("{base}/status")
        } else {
            base
        }
    }

    pub(crate) fn run_command_url(&self, run_id: &RunId, command: &str) -> String {
        format!("{}/{command}", self.run_url(run_id))
    }

    pub(crate) fn patch_url(&self, resource: &str) -> String {
        format!("{}/patch", self.join(resource))
    }

    fn run_url(&self, run_id: &RunId) -> String {
        format!(
            "{}/{}",
            self.join(&self.runs_path),
            run_id.as_str().trim_matches('/')
        )
    }

    fn join(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/').trim_end_matches('/')
        )
    }
}

fn env_secs(key: &str) -> Result<Option<u64>, ClientError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ClientError::Config(format!("invalid {key}: {e}"))),
        _ => Ok(None),
    }
}
