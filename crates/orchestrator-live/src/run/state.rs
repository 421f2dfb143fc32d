use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::poller::{RunSnapshot, RunStatus};
use crate::model::{RunId, WorkflowId};
use crate::stream::RunEvent;

/// Lifecycle phase of a run.
///
/// `Pending` is the idle state: a placeholder before the server confirms a
/// run, or a run that never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// How a step record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOrigin {
    /// Seen starting on a live stream.
    Live,
    /// First seen as a completion, e.g. replayed after a resume.
    Replayed,
    /// Synthesized from a progress frame or a polled snapshot.
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub node_id: String,
    pub status: StepStatus,
    pub origin: StepOrigin,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl StepRecord {
    fn new(node_id: &str, status: StepStatus, origin: StepOrigin) -> Self {
        Self {
            node_id: node_id.to_string(),
            status,
            origin,
            error: None,
            output: None,
        }
    }
}

/// What a state change asks of the owner.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub changed: bool,
    pub close_stream: bool,
}

impl Transition {
    fn changed() -> Self {
        Self {
            changed: true,
            close_stream: false,
        }
    }

    fn closing() -> Self {
        Self {
            changed: true,
            close_stream: true,
        }
    }
}

impl std::ops::BitOrAssign for Transition {
    fn bitor_assign(&mut self, rhs: Self) {
        self.changed |= rhs.changed;
        self.close_stream |= rhs.close_stream;
    }
}

/// Authoritative client-side view of one run.
///
/// Only the transition methods in this module change `phase`; consumers get
/// clones through the controller's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    id: Option<RunId>,
    workflow_id: Option<WorkflowId>,
    phase: RunPhase,
    progress: Option<f64>,
    current_step: Option<String>,
    error: Option<String>,
    steps: Vec<StepRecord>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::idle()
    }
}

impl RunState {
    /// A run that has not been started.
    pub fn idle() -> Self {
        Self {
            id: None,
            workflow_id: None,
            phase: RunPhase::Pending,
            progress: None,
            current_step: None,
            error: None,
            steps: Vec::new(),
        }
    }

    /// Placeholder created when a start is requested, before the server
    /// confirms a run id.
    pub fn placeholder(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Self::idle()
        }
    }

    pub fn id(&self) -> Option<&RunId> {
        self.id.as_ref()
    }

    pub fn workflow_id(&self) -> Option<&WorkflowId> {
        self.workflow_id.as_ref()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn step(&self, node_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }

    /// True once any step or the run itself reported an error.
    pub fn has_error(&self) -> bool {
        self.error.is_some() || self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// Idle or terminal.
    pub fn can_start(&self) -> bool {
        self.phase == RunPhase::Pending || self.phase.is_terminal()
    }

    pub fn can_pause(&self) -> bool {
        self.phase == RunPhase::Running
    }

    /// Paused, with both ids known.
    pub fn can_resume(&self) -> bool {
        self.phase == RunPhase::Paused && self.id.is_some() && self.workflow_id.is_some()
    }

    pub(crate) fn apply_event(&mut self, event: &RunEvent) -> Transition {
        if self.phase.is_terminal() {
            debug!(phase = %self.phase, ?event, "ignoring event after terminal phase");
            return Transition::default();
        }
        if self.phase == RunPhase::Paused && !event.is_terminal_signal() {
            return Transition::default();
        }

        let mut t = Transition::default();
        match event {
            RunEvent::Start { run_id, node_id } => {
                t |= self.adopt_run_id(run_id.as_ref());
                if self.phase == RunPhase::Pending {
                    t |= self.set_phase(RunPhase::Running);
                }
                if let Some(node_id) = node_id {
                    t |= self.enter_step(node_id, StepOrigin::Live);
                }
            }
            RunEvent::Progress { progress, node_id } => {
                t |= self.set_progress(*progress);
                if let Some(node_id) = node_id {
                    t |= self.enter_step(node_id, StepOrigin::Inferred);
                }
            }
            RunEvent::Complete { node_id, output } => {
                t |= self.complete_step(node_id, output.clone());
            }
            RunEvent::Error { node_id, error } => {
                t |= self.record_error(node_id.as_deref(), error);
            }
            RunEvent::RunFinished { status } => {
                let target = match status.as_deref().map(RunStatus::from) {
                    Some(RunStatus::Failed) => RunPhase::Failed,
                    Some(RunStatus::Cancelled) => RunPhase::Cancelled,
                    _ => self.finished_phase(),
                };
                t |= self.set_phase(target);
            }
            RunEvent::Paused => {
                if self.phase == RunPhase::Running {
                    t |= self.set_phase(RunPhase::Paused);
                }
            }
            RunEvent::Cancelled => {
                t |= self.set_phase(RunPhase::Cancelled);
            }
            RunEvent::Unknown { kind, .. } => {
                debug!(%kind, "ignoring unknown run event");
            }
        }
        t
    }

    /// Applies a polled snapshot as a replay of the current truth.
    ///
    /// Applying the same snapshot twice leaves the state unchanged.
    /// While paused only a terminal status is taken, matching how stream
    /// frames are treated in that phase.
    pub(crate) fn apply_snapshot(&mut self, snapshot: &RunSnapshot) -> Transition {
        if self.phase.is_terminal() {
            return Transition::default();
        }
        if self.phase == RunPhase::Paused && !snapshot.status.is_terminal() {
            return Transition::default();
        }

        let mut t = self.adopt_run_id(snapshot.run_id.as_ref());
        if self.workflow_id.is_none()
            && let Some(workflow_id) = &snapshot.workflow_id
        {
            self.workflow_id = Some(workflow_id.clone());
            t.changed = true;
        }
        t |= self.set_progress(snapshot.progress);
        if let Some(node_id) = &snapshot.current_node {
            t |= self.enter_step(node_id, StepOrigin::Inferred);
        }
        if let Some(error) = &snapshot.error
            && self.error.as_deref() != Some(error.as_str())
        {
            self.error = Some(error.clone());
            t.changed = true;
        }

        match &snapshot.status {
            RunStatus::Pending => {}
            RunStatus::Running => {
                // Only an explicit resume leaves `paused`.
                if self.phase == RunPhase::Pending {
                    t |= self.set_phase(RunPhase::Running);
                }
            }
            RunStatus::Paused => {
                if self.phase == RunPhase::Running {
                    t |= self.set_phase(RunPhase::Paused);
                }
            }
            RunStatus::Succeeded => {
                let target = self.finished_phase();
                t |= self.set_phase(target);
            }
            RunStatus::Failed => {
                if self.error.is_none() {
                    self.error = Some("run failed".to_string());
                }
                t |= self.set_phase(RunPhase::Failed);
            }
            RunStatus::Cancelled => {
                t |= self.set_phase(RunPhase::Cancelled);
            }
            RunStatus::Other(status) => {
                debug!(%status, "ignoring unrecognized snapshot status");
            }
        }
        t
    }

    pub(crate) fn mark_resumed(&mut self) -> Transition {
        if self.phase != RunPhase::Paused {
            return Transition::default();
        }
        self.set_phase(RunPhase::Running)
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) -> Transition {
        if self.phase.is_terminal() {
            return Transition::default();
        }
        self.error = Some(message.into());
        self.set_phase(RunPhase::Failed)
    }

    pub(crate) fn cancel(&mut self) -> Transition {
        if self.phase.is_terminal() {
            return Transition::default();
        }
        self.set_phase(RunPhase::Cancelled)
    }

    pub(crate) fn note_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    fn finished_phase(&self) -> RunPhase {
        if self.has_error() {
            RunPhase::Failed
        } else {
            RunPhase::Succeeded
        }
    }

    fn set_phase(&mut self, phase: RunPhase) -> Transition {
        if self.phase == phase {
            return Transition::default();
        }
        debug!(run_id = ?self.id, from = %self.phase, to = %phase, "run phase transition");
        self.phase = phase;
        if phase == RunPhase::Paused || phase.is_terminal() {
            Transition::closing()
        } else {
            Transition::changed()
        }
    }

    fn adopt_run_id(&mut self, run_id: Option<&RunId>) -> Transition {
        match (run_id, &self.id) {
            (Some(id), None) => {
                self.id = Some(id.clone());
                Transition::changed()
            }
            (Some(id), Some(current)) if id != current => {
                debug!(%id, %current, "ignoring conflicting run id");
                Transition::default()
            }
            _ => Transition::default(),
        }
    }

    fn set_progress(&mut self, progress: Option<f64>) -> Transition {
        let Some(value) = progress.filter(|p| p.is_finite()) else {
            return Transition::default();
        };
        let value = value.clamp(0.0, 100.0);
        if self.progress == Some(value) {
            return Transition::default();
        }
        self.progress = Some(value);
        Transition::changed()
    }

    fn enter_step(&mut self, node_id: &str, origin: StepOrigin) -> Transition {
        let mut t = Transition::default();
        if self.current_step.as_deref() != Some(node_id) {
            self.current_step = Some(node_id.to_string());
            t.changed = true;
        }
        if self.step(node_id).is_none() {
            self.steps
                .push(StepRecord::new(node_id, StepStatus::Running, origin));
            t.changed = true;
        }
        t
    }

    fn complete_step(&mut self, node_id: &str, output: Option<serde_json::Value>) -> Transition {
        match self.steps.iter_mut().find(|s| s.node_id == node_id) {
            Some(step) if step.status == StepStatus::Completed => Transition::default(),
            Some(step) => {
                step.status = StepStatus::Completed;
                step.output = output;
                Transition::changed()
            }
            None => {
                debug!(%node_id, "synthesizing replayed completion");
                let mut step = StepRecord::new(node_id, StepStatus::Completed, StepOrigin::Replayed);
                step.output = output;
                self.steps.push(step);
                Transition::changed()
            }
        }
    }

    fn record_error(&mut self, node_id: Option<&str>, error: &str) -> Transition {
        let mut t = Transition::default();
        if let Some(node_id) = node_id {
            if self.step(node_id).is_none() {
                self.steps
                    .push(StepRecord::new(node_id, StepStatus::Failed, StepOrigin::Inferred));
                t.changed = true;
            }
            if let Some(step) = self.steps.iter_mut().find(|s| s.node_id == node_id)
                && (step.status != StepStatus::Failed || step.error.as_deref() != Some(error))
            {
                step.status = StepStatus::Failed;
                step.error = Some(error.to_string());
                t.changed = true;
            }
        }
        if self.error.as_deref() != Some(error) {
            self.error = Some(error.to_string());
            t.changed = true;
        }
        t
    }
}
