//! Live client for a workflow server: streams run events, keeps a run's state
//! consistent when the stream drops, and edits workflow documents under a
//! compare-and-swap revision protocol.
//!
//! # Watching a run
//!
//! ```no_run
//! use orchestrator_live::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let client = RunClient::builder(ClientConfig::new("http://localhost:8080")).build()?;
//!
//! let run = client.start_run(WorkflowId::new("daily-report"), None).await?;
//! let mut views = run.subscribe();
//! while views.changed().await.is_ok() {
//!     let view = views.borrow_and_update().clone();
//!     println!("{} {:?}", view.state.phase(), view.state.progress());
//!     if view.state.phase().is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Proposing a patch
//!
//! ```no_run
//! use orchestrator_live::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let client = RunClient::builder(ClientConfig::new("http://localhost:8080")).build()?;
//! let mut session = client.edit_session("api/workflows/daily-report", RevisionToken::new("rev-41"));
//!
//! let ops = vec![PatchOp::full_replace("name: daily-report\nsteps: []\n")];
//! let preview = session.preview(ops.clone()).await?;
//! if preview.valid {
//!     match session.apply(ops).await? {
//!         ApplyOutcome::Applied { new_revision, .. } => println!("saved as {new_revision}"),
//!         ApplyOutcome::Rebased { preview } => println!("document moved, review: {:?}", preview.diff),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Client entry point and builder.
pub mod client;
/// Endpoint, timing, and auth configuration.
pub mod config;
/// Error types for every layer.
pub mod errors;
/// Identifier newtypes.
pub mod model;
/// Process-wide tracing setup.
pub mod observability;
/// Revision-gated patch preview/apply.
pub mod patch;
/// Common imports for typical usage.
pub mod prelude;
/// Run state machine, polling fallback, controller, and registry.
pub mod run;
/// Event stream decoding and transport.
pub mod stream;

pub use client::{RunClient, RunClientBuilder};
pub use config::ClientConfig;
pub use errors::{ClientError, PatchError, PollError, TransportError};
pub use model::{RevisionToken, RunId, RunKey, WorkflowId};
pub use observability::{LogSettings, LogSink, init_observability, init_with};
pub use patch::{
    ApplyOutcome, EditSession, HttpPatchApi, PatchApi, PatchCoordinator, PatchOp, PreviewOutcome,
    ProposedPatch,
};
pub use run::{
    ControllerHandle, ControllerSettings, HttpRunsApi, RegistrySummary, RepeatingTask,
    RunCommand, RunController, RunPhase, RunRegistry, RunSnapshot, RunState, RunStatus, RunView,
    RunsApi, StepOrigin, StepRecord, StepStatus,
};
pub use stream::{
    EventFrame, FrameDecoder, RunEvent, RunStreamOpener, StreamHandle, StreamObserver,
    StreamRequest, StreamSignal, StreamTransport,
};
