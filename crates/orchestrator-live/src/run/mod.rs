//! Run lifecycle: the state machine, the polling fallback, and the controller
//! task that keeps both in step with the live stream.
mod controller;
mod poller;
mod registry;
mod schedule;
mod state;

pub use controller::{ControllerHandle, ControllerSettings, RunController, RunView};
pub use poller::{HttpRunsApi, RunCommand, RunSnapshot, RunStatus, RunsApi};
pub use registry::{RegistrySummary, RunRegistry};
pub use schedule::RepeatingTask;
pub use state::{RunPhase, RunState, StepOrigin, StepRecord, StepStatus};
