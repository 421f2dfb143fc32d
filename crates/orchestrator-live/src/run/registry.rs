use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use super::controller::ControllerHandle;
use super::state::RunState;
use crate::model::{RunId, RunKey};

/// Counts reported by [`RunRegistry::summary`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub tracked: usize,
    /// Not yet terminal.
    pub active: usize,
    pub streaming: usize,
    pub terminal: usize,
}

/// Controllers keyed by their client-side run key.
///
/// Lets an application track several runs at once and find the controller
/// for a run id reported by the server.
#[derive(Default)]
pub struct RunRegistry {
    runs: HashMap<RunKey, ControllerHandle>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `handle`, returning the handle it replaced, if any.
    pub fn insert(&mut self, handle: ControllerHandle) -> Option<ControllerHandle> {
        self.runs.insert(handle.key(), handle)
    }

    pub fn get(&self, key: &RunKey) -> Option<&ControllerHandle> {
        self.runs.get(key)
    }

    pub fn remove(&mut self, key: &RunKey) -> Option<ControllerHandle> {
        self.runs.remove(key)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = RunKey> + '_ {
        self.runs.keys().copied()
    }

    /// Finds the controller whose state carries `run_id`.
    pub fn find_by_run_id(&self, run_id: &RunId) -> Option<&ControllerHandle> {
        self.runs
            .values()
            .find(|handle| handle.view().state.id() == Some(run_id))
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            tracked: self.runs.len(),
            ..RegistrySummary::default()
        };
        for handle in self.runs.values() {
            let view = handle.view();
            if view.state.phase().is_terminal() {
                summary.terminal += 1;
            } else {
                summary.active += 1;
            }
            if view.streaming {
                summary.streaming += 1;
            }
        }
        summary
    }

    /// Shuts down and forgets every controller whose run is terminal,
    /// returning their final states.
    pub async fn retire_terminal(&mut self) -> Vec<RunState> {
        let finished: Vec<RunKey> = self
            .runs
            .iter()
            .filter(|(_, handle)| handle.view().state.phase().is_terminal() || handle.is_closed())
            .map(|(key, _)| *key)
            .collect();

        let mut retired = Vec::with_capacity(finished.len());
        for key in finished {
            if let Some(handle) = self.runs.remove(&key) {
                // A closed controller cannot answer; its last view is final.
                let last_seen = handle.view().state;
                let state = handle.shutdown().await.unwrap_or(last_seen);
                debug!(%key, phase = %state.phase(), "retired run controller");
                retired.push(state);
            }
        }
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ClientError, PollError, TransportError};
    use crate::model::WorkflowId;
    use crate::run::controller::{ControllerSettings, RunController};
    use crate::run::poller::{RunCommand, RunSnapshot, RunsApi};
    use crate::stream::{RunStreamOpener, StreamHandle, StreamObserver, StreamRequest};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type ByteTx = futures::channel::mpsc::UnboundedSender<Result<bytes::Bytes, TransportError>>;

    #[derive(Default)]
    struct ScriptedOpener {
        senders: Mutex<Vec<ByteTx>>,
    }

    #[async_trait::async_trait]
    impl RunStreamOpener for ScriptedOpener {
        async fn open(
            &self,
            request: &StreamRequest,
            observer: Box<dyn StreamObserver>,
        ) -> Result<StreamHandle, TransportError> {
            let (tx, rx) = futures::channel::mpsc::unbounded();
            let frame = format!(
                "data: {}\n\n",
                serde_json::json!({"type": "start", "run_id": format!("run-{}", request.workflow_id)})
            );
            let _ = tx.unbounded_send(Ok(bytes::Bytes::from(frame)));
            self.senders.lock().expect("lock").push(tx);
            Ok(StreamHandle::spawn(rx, observer))
        }
    }

    struct NoopApi;

    #[async_trait::async_trait]
    impl RunsApi for NoopApi {
        async fn fetch(&self, _run_id: &RunId) -> Result<RunSnapshot, PollError> {
            Err(PollError::Transient("unused".into()))
        }

        async fn send_command(&self, _run_id: &RunId, _command: RunCommand) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn spawn(opener: &Arc<ScriptedOpener>) -> ControllerHandle {
        RunController::spawn(
            ControllerSettings {
                health_window: Duration::from_secs(15),
                poll_interval: Duration::from_secs(5),
            },
            opener.clone(),
            Arc::new(NoopApi),
        )
    }

    async fn running(handle: &ControllerHandle, workflow: &str) {
        handle
            .start(WorkflowId::new(workflow), None)
            .await
            .expect("start");
        let mut rx = handle.subscribe();
        rx.wait_for(|v| v.state.id().is_some())
            .await
            .expect("run id adopted");
    }

    #[tokio::test]
    async fn tracks_runs_and_finds_by_run_id() {
        let opener = Arc::new(ScriptedOpener::default());
        let mut registry = RunRegistry::new();
        let first = spawn(&opener);
        let second = spawn(&opener);
        let first_key = first.key();
        registry.insert(first.clone());
        registry.insert(second.clone());
        running(&first, "alpha").await;
        running(&second, "beta").await;

        let found = registry
            .find_by_run_id(&RunId::new("run-alpha"))
            .expect("found");
        assert_eq!(found.key(), first_key);
        assert!(registry.find_by_run_id(&RunId::new("run-gamma")).is_none());

        assert_eq!(
            registry.summary(),
            RegistrySummary {
                tracked: 2,
                active: 2,
                streaming: 2,
                terminal: 0,
            }
        );
    }

    #[tokio::test]
    async fn retire_terminal_keeps_active_runs() {
        let opener = Arc::new(ScriptedOpener::default());
        let mut registry = RunRegistry::new();
        let done = spawn(&opener);
        let live = spawn(&opener);
        registry.insert(done.clone());
        registry.insert(live.clone());
        running(&done, "alpha").await;
        running(&live, "beta").await;

        done.cancel().await.expect("cancel");
        assert_eq!(registry.summary().terminal, 1);

        let retired = registry.retire_terminal().await;
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].id(), Some(&RunId::new("run-alpha")));
        assert!(retired[0].phase().is_terminal());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&live.key()).is_some());
        assert!(registry.get(&done.key()).is_none());
        assert!(matches!(done.pause().await, Err(ClientError::ControllerClosed)));
    }
}
