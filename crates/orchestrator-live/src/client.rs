use std::sync::Arc;

use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::model::{RevisionToken, RunId, WorkflowId};
use crate::patch::{EditSession, HttpPatchApi, PatchApi, PatchCoordinator};
use crate::run::{
    ControllerHandle, ControllerSettings, HttpRunsApi, RunController, RunSnapshot, RunsApi,
};
use crate::stream::{RunStreamOpener, StreamTransport};

pub(crate) struct ClientInner {
    config: ClientConfig,
    opener: Arc<dyn RunStreamOpener>,
    runs: Arc<dyn RunsApi>,
    patches: Arc<dyn PatchApi>,
}

/// Entry point for driving runs and editing documents against one server.
#[derive(Clone)]
pub struct RunClient {
    inner: Arc<ClientInner>,
}

impl RunClient {
    /// Starts a builder over `config`.
    pub fn builder(config: ClientConfig) -> RunClientBuilder {
        RunClientBuilder::new(config)
    }

    /// Builds a client with HTTP backends from `ORCHESTRATOR_LIVE_*` variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::builder(ClientConfig::from_env()?).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Spawns an idle controller. Must be called inside a tokio runtime.
    pub fn controller(&self) -> ControllerHandle {
        RunController::spawn(
            ControllerSettings::from(&self.inner.config),
            self.inner.opener.clone(),
            self.inner.runs.clone(),
        )
    }

    /// Spawns a controller and starts `workflow_id` on it.
    pub async fn start_run(
        &self,
        workflow_id: WorkflowId,
        inputs: Option<serde_json::Value>,
    ) -> Result<ControllerHandle, ClientError> {
        let handle = self.controller();
        handle.start(workflow_id, inputs).await?;
        Ok(handle)
    }

    /// Polls a run's status once.
    pub async fn fetch_run(&self, run_id: &RunId) -> Result<RunSnapshot, ClientError> {
        Ok(self.inner.runs.fetch(run_id).await?)
    }

    /// Coordinator for patches against `resource`, e.g. `workflows/<id>`.
    pub fn patches(&self, resource: impl Into<String>) -> PatchCoordinator {
        PatchCoordinator::new(self.inner.patches.clone(), resource)
    }

    /// Opens an editing session starting from `revision`.
    pub fn edit_session(&self, resource: impl Into<String>, revision: RevisionToken) -> EditSession {
        EditSession::new(self.patches(resource), revision)
    }
}

/// Builder for [`RunClient`]. Any backend left unset uses its HTTP
/// implementation.
pub struct RunClientBuilder {
    config: ClientConfig,
    opener: Option<Arc<dyn RunStreamOpener>>,
    runs: Option<Arc<dyn RunsApi>>,
    patches: Option<Arc<dyn PatchApi>>,
}

impl RunClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            opener: None,
            runs: None,
            patches: None,
        }
    }

    pub fn stream_opener(mut self, opener: Arc<dyn RunStreamOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn runs_api(mut self, runs: Arc<dyn RunsApi>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn patch_api(mut self, patches: Arc<dyn PatchApi>) -> Self {
        self.patches = Some(patches);
        self
    }

    /// Validates the config and builds the client.
    pub fn build(self) -> Result<RunClient, ClientError> {
        self.config.validate()?;
        let opener: Arc<dyn RunStreamOpener> = match self.opener {
            Some(opener) => opener,
            None => Arc::new(StreamTransport::new(&self.config)?),
        };
        let runs: Arc<dyn RunsApi> = match self.runs {
            Some(runs) => runs,
            None => Arc::new(HttpRunsApi::new(self.config.clone())?),
        };
        let patches: Arc<dyn PatchApi> = match self.patches {
            Some(patches) => patches,
            None => Arc::new(HttpPatchApi::new(self.config.clone())?),
        };
        Ok(RunClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                opener,
                runs,
                patches,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{PatchError, PollError, TransportError};
    use crate::patch::{PatchResponse, ProposedPatch};
    use crate::run::{RunCommand, RunPhase, RunStatus};
    use crate::stream::{StreamHandle, StreamObserver, StreamRequest};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct OneShotStream;

    #[async_trait::async_trait]
    impl RunStreamOpener for OneShotStream {
        async fn open(
            &self,
            _request: &StreamRequest,
            observer: Box<dyn StreamObserver>,
        ) -> Result<StreamHandle, TransportError> {
            let body = "data: {\"type\":\"start\",\"run_id\":\"r1\"}\n\n\
                        data: {\"type\":\"run_finished\"}\n\n";
            let chunks = futures::stream::iter(vec![Ok(bytes::Bytes::from_static(body.as_bytes()))]);
            Ok(StreamHandle::spawn(chunks, observer))
        }
    }

    struct UnusedRuns;

    #[async_trait::async_trait]
    impl RunsApi for UnusedRuns {
        async fn fetch(&self, run_id: &RunId) -> Result<RunSnapshot, PollError> {
            Err(PollError::NotFound {
                run_id: run_id.clone(),
            })
        }

        async fn send_command(&self, _run_id: &RunId, _command: RunCommand) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct EchoPatches;

    #[async_trait::async_trait]
    impl PatchApi for EchoPatches {
        async fn submit(
            &self,
            _resource: &str,
            _patch: &ProposedPatch,
            dry_run: bool,
        ) -> Result<PatchResponse, PatchError> {
            Ok(PatchResponse {
                success: true,
                new_revision: (!dry_run).then(|| RevisionToken::new("r2")),
                ..PatchResponse::default()
            })
        }
    }

    #[test]
    fn build_rejects_invalid_config() {
        let result = RunClient::builder(ClientConfig::new("")).build();
        assert!(matches!(result, Err(ClientError::Config(_))));

        let result = RunClient::builder(
            ClientConfig::new("http://localhost:8080").poll_interval(Duration::ZERO),
        )
        .build();
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn injected_backends_drive_runs_and_patches() {
        let client = RunClient::builder(ClientConfig::new("http://localhost:8080"))
            .stream_opener(Arc::new(OneShotStream))
            .runs_api(Arc::new(UnusedRuns))
            .patch_api(Arc::new(EchoPatches))
            .build()
            .expect("client");

        let handle = client
            .start_run(WorkflowId::new("wf-1"), None)
            .await
            .expect("start");
        let state = handle.wait_for_terminal().await.expect("terminal");
        assert_eq!(state.phase(), RunPhase::Succeeded);
        assert_eq!(state.id(), Some(&RunId::new("r1")));

        let mut session = client.edit_session("workflows/wf-1", RevisionToken::new("r1"));
        session
            .apply(vec![crate::patch::PatchOp::full_replace("name: demo")])
            .await
            .expect("apply");
        assert_eq!(session.revision(), &RevisionToken::new("r2"));
        assert_eq!(session.coordinator().resource(), "workflows/wf-1");
    }

    #[tokio::test]
    async fn fetch_run_uses_http_backend_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/runs/r1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "completed", "progress": 100})),
            )
            .mount(&server)
            .await;

        let client = RunClient::builder(ClientConfig::new(server.uri()))
            .build()
            .expect("client");
        let snapshot = client.fetch_run(&RunId::new("r1")).await.expect("snapshot");
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert_eq!(snapshot.progress, Some(100.0));
    }
}
