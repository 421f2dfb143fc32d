//! Common imports for typical client usage.
pub use crate::{
    ApplyOutcome, ClientConfig, ClientError, ControllerHandle, EditSession, PatchCoordinator,
    PatchError, PatchOp, PreviewOutcome, ProposedPatch, RevisionToken, RunClient,
    RunClientBuilder, RunId, RunPhase, RunRegistry, RunState, RunView, WorkflowId,
};
