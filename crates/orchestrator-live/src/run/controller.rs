use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::poller::{RunCommand, RunSnapshot, RunsApi};
use super::schedule::RepeatingTask;
use super::state::{RunState, Transition};
use crate::config::ClientConfig;
use crate::errors::{ClientError, PollError, TransportError};
use crate::model::{RunKey, WorkflowId};
use crate::stream::{
    EventFrame, RunEvent, RunStreamOpener, StreamHandle, StreamObserver, StreamRequest,
    StreamSignal,
};

const COMMAND_BUFFER: usize = 16;

/// Timing knobs for one controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    /// A stream silent for longer than this is treated as possibly dead.
    pub health_window: Duration,
    /// Watchdog tick period.
    pub poll_interval: Duration,
}

impl From<&ClientConfig> for ControllerSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            health_window: config.health_window,
            poll_interval: config.poll_interval,
        }
    }
}

/// Read-only view of a controller, republished after every change.
#[derive(Clone, Debug, PartialEq)]
pub struct RunView {
    pub key: RunKey,
    pub state: RunState,
    pub can_start: bool,
    pub can_pause: bool,
    pub can_resume: bool,
    /// A stream connection is open.
    pub streaming: bool,
    /// The polling watchdog is armed.
    pub polling: bool,
}

enum Command {
    Start {
        workflow_id: WorkflowId,
        inputs: Option<serde_json::Value>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Shutdown {
        reply: oneshot::Sender<RunState>,
    },
}

enum Internal {
    Stream { generation: u64, signal: StreamSignal },
    Tick { generation: u64 },
    Polled {
        generation: u64,
        result: Result<RunSnapshot, PollError>,
    },
}

struct GenerationObserver {
    generation: u64,
    tx: mpsc::UnboundedSender<Internal>,
}

impl GenerationObserver {
    fn forward(&self, signal: StreamSignal) {
        let _ = self.tx.send(Internal::Stream {
            generation: self.generation,
            signal,
        });
    }
}

impl StreamObserver for GenerationObserver {
    fn on_frame(&mut self, frame: EventFrame) {
        self.forward(StreamSignal::Frame(frame));
    }

    fn on_close(&mut self) {
        self.forward(StreamSignal::Closed);
    }

    fn on_error(&mut self, error: TransportError) {
        self.forward(StreamSignal::Failed(error));
    }
}

/// Handle to a running controller.
///
/// Commands are guarded: a command refused in the current phase returns
/// `ClientError::InvalidState` and changes nothing. When the last handle is
/// dropped the controller tears down its stream and watchdog.
#[derive(Clone)]
pub struct ControllerHandle {
    key: RunKey,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<RunView>,
}

impl ControllerHandle {
    pub fn key(&self) -> RunKey {
        self.key
    }

    /// Current view.
    pub fn view(&self) -> RunView {
        self.view.borrow().clone()
    }

    /// Receiver that observes every published view.
    pub fn subscribe(&self) -> watch::Receiver<RunView> {
        self.view.clone()
    }

    pub fn can_start(&self) -> bool {
        self.view.borrow().can_start
    }

    pub fn can_pause(&self) -> bool {
        self.view.borrow().can_pause
    }

    pub fn can_resume(&self) -> bool {
        self.view.borrow().can_resume
    }

    /// Starts a new run of `workflow_id`.
    ///
    /// Returns once the stream is open; the server confirms the run id with
    /// its first `start` frame.
    pub async fn start(
        &self,
        workflow_id: WorkflowId,
        inputs: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        self.request(|reply| Command::Start {
            workflow_id,
            inputs,
            reply,
        })
        .await?
    }

    pub async fn pause(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Pause { reply }).await?
    }

    /// Re-opens the stream for a paused run.
    pub async fn resume(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    pub async fn cancel(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Cancel { reply }).await?
    }

    /// Waits until the run reaches a terminal phase.
    pub async fn wait_for_terminal(&self) -> Result<RunState, ClientError> {
        let mut rx = self.view.clone();
        let view = rx
            .wait_for(|view| view.state.phase().is_terminal())
            .await
            .map_err(|_| ClientError::ControllerClosed)?;
        Ok(view.state.clone())
    }

    /// Stops the controller, cancelling its stream and watchdog, and returns
    /// the final state.
    pub async fn shutdown(self) -> Result<RunState, ClientError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ClientError::ControllerClosed)?;
        rx.await.map_err(|_| ClientError::ControllerClosed)
    }
}

/// Owns one run's state, its stream connection, and its polling watchdog.
///
/// All three are touched only from the controller task, so every transition
/// is applied in order without locking.
pub struct RunController {
    key: RunKey,
    state: RunState,
    settings: ControllerSettings,
    opener: Arc<dyn RunStreamOpener>,
    api: Arc<dyn RunsApi>,
    stream: Option<StreamHandle>,
    stream_generation: u64,
    watchdog: Option<RepeatingTask>,
    watchdog_generation: u64,
    /// At most one status fetch runs at a time.
    poll: Option<JoinHandle<()>>,
    last_frame_at: Instant,
    internal_tx: mpsc::UnboundedSender<Internal>,
    view_tx: watch::Sender<RunView>,
}

impl RunController {
    /// Spawns a controller task and returns its handle.
    pub fn spawn(
        settings: ControllerSettings,
        opener: Arc<dyn RunStreamOpener>,
        api: Arc<dyn RunsApi>,
    ) -> ControllerHandle {
        let key = RunKey::new();
        let state = RunState::idle();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(RunView {
            key,
            can_start: state.can_start(),
            can_pause: false,
            can_resume: false,
            streaming: false,
            polling: false,
            state: state.clone(),
        });

        let controller = Self {
            key,
            state,
            settings,
            opener,
            api,
            stream: None,
            stream_generation: 0,
            watchdog: None,
            watchdog_generation: 0,
            poll: None,
            last_frame_at: Instant::now(),
            internal_tx,
            view_tx,
        };
        tokio::spawn(controller.run(command_rx, internal_rx));

        ControllerHandle {
            key,
            commands: command_tx,
            view: view_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        debug!(key = %self.key, "run controller started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(self.state.clone());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message),
            }
        }
        self.teardown();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                workflow_id,
                inputs,
                reply,
            } => {
                let result = self.start(workflow_id, inputs).await;
                let _ = reply.send(result);
            }
            Command::Pause { reply } => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let result = self.cancel().await;
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(self.state.clone());
            }
        }
        self.publish();
    }

    fn can_start(&self) -> bool {
        self.state.can_start() && self.stream.is_none()
    }

    fn refuse(&self, command: &'static str) -> ClientError {
        ClientError::InvalidState {
            command,
            phase: self.state.phase(),
        }
    }

    async fn start(
        &mut self,
        workflow_id: WorkflowId,
        inputs: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        if !self.can_start() {
            return Err(self.refuse("start"));
        }
        if workflow_id.as_str().trim().is_empty() {
            return Err(ClientError::Validation(
                "workflow id must not be empty".into(),
            ));
        }

        self.stop_watchdog();
        self.state = RunState::placeholder(workflow_id.clone());
        info!(key = %self.key, %workflow_id, "starting run");
        let request = StreamRequest::start(workflow_id, inputs);
        match self.open_stream(&request).await {
            Ok(()) => {
                self.arm_watchdog();
                Ok(())
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "run stream rejected");
                self.state.note_error(err.to_string());
                Err(err)
            }
        }
    }

    async fn pause(&mut self) -> Result<(), ClientError> {
        if !self.state.can_pause() {
            return Err(self.refuse("pause"));
        }
        let Some(run_id) = self.state.id().cloned() else {
            return Err(ClientError::Command(
                "run id not confirmed by the server yet".into(),
            ));
        };
        self.api.send_command(&run_id, RunCommand::Pause).await?;
        info!(key = %self.key, %run_id, "run paused");
        let t = self.state.apply_event(&RunEvent::Paused);
        self.after_transition(t);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), ClientError> {
        if !self.state.can_resume() {
            return Err(self.refuse("resume"));
        }
        let (Some(workflow_id), Some(run_id)) =
            (self.state.workflow_id().cloned(), self.state.id().cloned())
        else {
            return Err(self.refuse("resume"));
        };
        info!(key = %self.key, %run_id, "resuming run");
        self.open_stream(&StreamRequest::resume(workflow_id, run_id))
            .await?;
        let t = self.state.mark_resumed();
        self.after_transition(t);
        self.arm_watchdog();
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), ClientError> {
        if self.state.phase().is_terminal()
            || (self.stream.is_none() && self.state.id().is_none())
        {
            return Err(self.refuse("cancel"));
        }
        let t = match self.state.id().cloned() {
            Some(run_id) => {
                self.api.send_command(&run_id, RunCommand::Cancel).await?;
                info!(key = %self.key, %run_id, "run cancelled");
                self.state.apply_event(&RunEvent::Cancelled)
            }
            None => {
                info!(key = %self.key, "cancelling unconfirmed run locally");
                self.state.cancel()
            }
        };
        self.after_transition(t);
        Ok(())
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Stream { generation, signal } => {
                if generation != self.stream_generation || self.stream.is_none() {
                    debug!(key = %self.key, generation, "dropping signal from stale stream");
                    return;
                }
                self.handle_stream_signal(signal);
            }
            Internal::Tick { generation } => {
                if generation != self.watchdog_generation || self.watchdog.is_none() {
                    return;
                }
                self.handle_tick();
            }
            Internal::Polled { generation, result } => {
                if generation != self.watchdog_generation {
                    debug!(key = %self.key, generation, "dropping stale poll result");
                    return;
                }
                self.poll = None;
                self.handle_poll_result(result);
            }
        }
        self.publish();
    }

    fn handle_stream_signal(&mut self, signal: StreamSignal) {
        match signal {
            StreamSignal::Frame(frame) => {
                self.last_frame_at = Instant::now();
                if let Some(event) = RunEvent::from_frame(&frame) {
                    let t = self.state.apply_event(&event);
                    self.after_transition(t);
                }
            }
            StreamSignal::Closed => {
                debug!(key = %self.key, phase = %self.state.phase(), "run stream closed");
                self.close_stream();
                self.fail_if_unconfirmed("stream ended before the server confirmed a run id".into());
            }
            StreamSignal::Failed(err) => {
                // The server may still be executing; polling settles the outcome.
                warn!(key = %self.key, error = %err, "run stream failed");
                self.close_stream();
                self.fail_if_unconfirmed(format!(
                    "stream failed before the server confirmed a run id: {err}"
                ));
            }
        }
    }

    // Polling needs a run id; without one a lost stream can never be settled.
    fn fail_if_unconfirmed(&mut self, message: String) {
        if self.state.id().is_some() || self.state.phase().is_terminal() {
            return;
        }
        warn!(key = %self.key, %message, "no run id to poll, failing run");
        self.stop_watchdog();
        let t = self.state.fail(message);
        self.after_transition(t);
    }

    fn handle_tick(&mut self) {
        if self.state.phase().is_terminal() {
            self.stop_watchdog();
            return;
        }
        if self.poll.is_some() {
            debug!(key = %self.key, "previous poll still in flight, skipping tick");
            return;
        }
        if self.stream.is_some() && self.last_frame_at.elapsed() < self.settings.health_window {
            return;
        }
        let Some(run_id) = self.state.id().cloned() else {
            debug!(key = %self.key, "stream unhealthy but run id unknown, skipping poll");
            return;
        };

        debug!(key = %self.key, %run_id, "polling run status");
        let api = self.api.clone();
        let tx = self.internal_tx.clone();
        let generation = self.watchdog_generation;
        self.poll = Some(tokio::spawn(async move {
            let result = api.fetch(&run_id).await;
            let _ = tx.send(Internal::Polled { generation, result });
        }));
    }

    fn handle_poll_result(&mut self, result: Result<RunSnapshot, PollError>) {
        match result {
            Ok(snapshot) => {
                let t = self.state.apply_snapshot(&snapshot);
                self.after_transition(t);
            }
            Err(PollError::NotFound { run_id }) => {
                warn!(key = %self.key, %run_id, "run record is gone, stopping watchdog");
                self.stop_watchdog();
                let t = self.state.fail("run record no longer exists");
                self.after_transition(t);
            }
            Err(err) => {
                debug!(key = %self.key, error = %err, "poll failed, retrying next tick");
            }
        }
    }

    fn after_transition(&mut self, t: Transition) {
        if t.close_stream {
            self.close_stream();
        }
        if t.changed && self.state.phase().is_terminal() {
            info!(
                key = %self.key,
                run_id = ?self.state.id(),
                phase = %self.state.phase(),
                "run reached terminal phase"
            );
            self.close_stream();
            self.stop_watchdog();
        }
    }

    async fn open_stream(&mut self, request: &StreamRequest) -> Result<(), ClientError> {
        self.close_stream();
        let observer = GenerationObserver {
            generation: self.stream_generation,
            tx: self.internal_tx.clone(),
        };
        let handle = self.opener.open(request, Box::new(observer)).await?;
        self.stream = Some(handle);
        self.last_frame_at = Instant::now();
        Ok(())
    }

    fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.cancel();
        }
        self.stream_generation += 1;
    }

    fn arm_watchdog(&mut self) {
        self.stop_watchdog();
        let generation = self.watchdog_generation;
        let tx = self.internal_tx.clone();
        self.watchdog = Some(RepeatingTask::spawn(self.settings.poll_interval, move || {
            tx.send(Internal::Tick { generation }).is_ok()
        }));
    }

    fn stop_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
        self.watchdog_generation += 1;
    }

    fn teardown(&mut self) {
        debug!(key = %self.key, "run controller shutting down");
        self.close_stream();
        self.stop_watchdog();
        self.publish();
    }

    fn publish(&self) {
        let view = RunView {
            key: self.key,
            can_start: self.can_start(),
            can_pause: self.state.can_pause(),
            can_resume: self.state.can_resume(),
            streaming: self.stream.is_some(),
            polling: self.watchdog.is_some(),
            state: self.state.clone(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
