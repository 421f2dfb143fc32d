//! Revision-gated patch preview/apply.
mod coordinator;
mod http;
mod model;

pub use coordinator::{ApplyOutcome, EditSession, PatchCoordinator, PreviewOutcome};
pub use http::{HttpPatchApi, PatchApi, PatchResponse, PatchValidation, REVISION_MISMATCH};
pub use model::{PatchOp, ProposedPatch};
