use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::{ClientError, PollError, extract_error_message};
use crate::model::{RunId, WorkflowId};

/// Server-reported run status, normalized from the common spellings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
    Other(String),
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl From<&str> for RunStatus {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "created" => Self::Pending,
            "running" | "in_progress" | "started" => Self::Running,
            "paused" => Self::Paused,
            "succeeded" | "success" | "completed" | "complete" | "done" => Self::Succeeded,
            "failed" | "failure" | "error" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for RunStatus {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

/// Point-in-time run status returned by a poll.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "id")]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
}

/// One-shot commands sent outside the stream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    Pause,
    Cancel,
}

impl RunCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Cancel => "cancel",
        }
    }
}

/// Request/response access to the runs collection.
///
/// No retries happen here; the controller's watchdog decides the cadence.
#[async_trait::async_trait]
pub trait RunsApi: Send + Sync {
    async fn fetch(&self, run_id: &RunId) -> Result<RunSnapshot, PollError>;

    async fn send_command(&self, run_id: &RunId, command: RunCommand) -> Result<(), ClientError>;
}

/// HTTP implementation of `RunsApi`.
pub struct HttpRunsApi {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpRunsApi {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build runs client: {e}")))?;
        Ok(Self { client, config })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl RunsApi for HttpRunsApi {
    async fn fetch(&self, run_id: &RunId) -> Result<RunSnapshot, PollError> {
        let url = self.config.run_status_url(run_id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| PollError::Transient(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            debug!(%run_id, status = status.as_u16(), "run record not found");
            return Err(PollError::NotFound {
                run_id: run_id.clone(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PollError::Transient(extract_error_message(
                status.as_u16(),
                &body,
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| PollError::Transient(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| PollError::Malformed(e.to_string()))
    }

    async fn send_command(&self, run_id: &RunId, command: RunCommand) -> Result<(), ClientError> {
        let url = self.config.run_command_url(run_id, command.as_str());
        debug!(%run_id, command = command.as_str(), "sending run command");
        let response = self
            .authorize(self.client.post(&url))
            .send()
            .await
            .map_err(|e| ClientError::Command(format!("{} request failed: {e}", command.as_str())))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Command(format!(
                "{} rejected: {}",
                command.as_str(),
                extract_error_message(status.as_u16(), &body)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn api(server: &MockServer) -> HttpRunsApi {
        HttpRunsApi::new(ClientConfig::new(server.uri())).expect("api")
    }

    #[test]
    fn status_spellings_normalize() {
        assert_eq!(RunStatus::from("COMPLETED"), RunStatus::Succeeded);
        assert_eq!(RunStatus::from("canceled"), RunStatus::Cancelled);
        assert_eq!(RunStatus::from("error"), RunStatus::Failed);
        assert_eq!(RunStatus::from("warming"), RunStatus::Other("warming".into()));
    }

    #[tokio::test]
    async fn fetch_decodes_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/runs/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "running",
                "progress": 40,
                "current_node": "summarize"
            })))
            .mount(&server)
            .await;

        let snapshot = api(&server).await.fetch(&RunId::new("r1")).await.expect("snapshot");
        assert_eq!(snapshot.status, RunStatus::Running);
        assert_eq!(snapshot.progress, Some(40.0));
        assert_eq!(snapshot.current_node.as_deref(), Some("summarize"));
        assert_eq!(snapshot.error, None);
    }

    #[tokio::test]
    async fn not_found_is_distinct_from_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/runs/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/runs/busy"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream busy"))
            .mount(&server)
            .await;

        let api = api(&server).await;
        assert_eq!(
            api.fetch(&RunId::new("gone")).await,
            Err(PollError::NotFound {
                run_id: RunId::new("gone")
            })
        );
        assert_eq!(
            api.fetch(&RunId::new("busy")).await,
            Err(PollError::Transient("upstream busy".into()))
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let config = ClientConfig::new("http://127.0.0.1:9")
            .request_timeout(std::time::Duration::from_secs(2));
        let api = HttpRunsApi::new(config).expect("api");
        let err = api.fetch(&RunId::new("r1")).await.expect_err("no server");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_snapshot_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"progress\": 3}"))
            .mount(&server)
            .await;
        let err = api(&server).await.fetch(&RunId::new("r1")).await.expect_err("missing status");
        assert!(matches!(err, PollError::Malformed(_)));
    }

    #[tokio::test]
    async fn commands_post_to_run_subresource() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/runs/r1/pause"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/runs/r1/cancel"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(serde_json::json!({"error": "already finished"})),
            )
            .mount(&server)
            .await;

        let api = api(&server).await;
        api.send_command(&RunId::new("r1"), RunCommand::Pause)
            .await
            .expect("pause");
        let err = api
            .send_command(&RunId::new("r1"), RunCommand::Cancel)
            .await
            .expect_err("cancel rejected");
        assert!(matches!(err, ClientError::Command(msg) if msg.contains("already finished")));
    }
}
