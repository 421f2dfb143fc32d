use std::sync::Arc;

use tracing::{debug, info, warn};

use super::http::{PatchApi, PatchResponse};
use super::model::{PatchOp, ProposedPatch};
use crate::errors::PatchError;
use crate::model::RevisionToken;

/// Result of a dry run.
#[derive(Clone, Debug, PartialEq)]
pub struct PreviewOutcome {
    pub diff: Option<serde_json::Value>,
    pub valid: bool,
    pub error: Option<String>,
    pub validation_errors: Vec<String>,
    /// Revision the preview was computed against.
    pub base_revision: RevisionToken,
    /// Set when the preview was silently moved off a stale base.
    pub rebased_from: Option<RevisionToken>,
}

impl PreviewOutcome {
    fn from_response(
        response: PatchResponse,
        base_revision: RevisionToken,
        rebased_from: Option<RevisionToken>,
    ) -> Self {
        let validation_errors = response.validation_errors();
        let valid = match &response.validation {
            Some(validation) => validation.valid,
            None => response.success && response.error.is_none(),
        };
        Self {
            diff: response.diff,
            valid,
            error: response.error,
            validation_errors,
            base_revision,
            rebased_from,
        }
    }

    pub fn was_rebased(&self) -> bool {
        self.rebased_from.is_some()
    }
}

/// Result of an apply that did not fail outright.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    /// The write committed.
    Applied {
        new_revision: RevisionToken,
        diff: Option<serde_json::Value>,
    },
    /// The base was stale. Nothing was written; `preview` shows the same
    /// patch against the current revision and must be applied explicitly.
    Rebased { preview: PreviewOutcome },
}

/// Dry-runs and applies patches against one resource under the
/// compare-and-swap revision protocol.
///
/// Previews follow a stale base automatically, once. Applies never retry.
#[derive(Clone)]
pub struct PatchCoordinator {
    api: Arc<dyn PatchApi>,
    resource: String,
}

impl PatchCoordinator {
    pub fn new(api: Arc<dyn PatchApi>, resource: impl Into<String>) -> Self {
        Self {
            api,
            resource: resource.into(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Dry run. Never advances the document's revision.
    pub async fn preview(&self, patch: &ProposedPatch) -> Result<PreviewOutcome, PatchError> {
        patch.validate()?;
        let response = self.api.submit(&self.resource, patch, true).await?;
        if !response.is_revision_mismatch() {
            return Ok(PreviewOutcome::from_response(
                response,
                patch.base_revision.clone(),
                None,
            ));
        }
        let current = self.adopt_current(&response, patch)?;
        self.preview_rebased(patch, current).await
    }

    /// The real write. Commits only if `patch.base_revision` is still current.
    pub async fn apply(&self, patch: &ProposedPatch) -> Result<ApplyOutcome, PatchError> {
        patch.validate()?;
        let response = self.api.submit(&self.resource, patch, false).await?;

        if response.is_revision_mismatch() {
            let current = self.adopt_current(&response, patch)?;
            let preview = self.preview_rebased(patch, current).await?;
            return Ok(ApplyOutcome::Rebased { preview });
        }

        if response.success {
            let Some(new_revision) = response.new_revision else {
                return Err(PatchError::Protocol(
                    "apply succeeded without a new revision".into(),
                ));
            };
            info!(resource = %self.resource, from = %patch.base_revision, to = %new_revision, "patch applied");
            return Ok(ApplyOutcome::Applied {
                new_revision,
                diff: response.diff,
            });
        }

        let mut errors = response.validation_errors();
        if errors.is_empty() {
            let Some(error) = response.error else {
                return Err(PatchError::Protocol(
                    "apply failed without a reason".into(),
                ));
            };
            errors.push(error);
        }
        debug!(resource = %self.resource, ?errors, "patch rejected");
        Err(PatchError::Validation { errors })
    }

    fn adopt_current(
        &self,
        response: &PatchResponse,
        patch: &ProposedPatch,
    ) -> Result<RevisionToken, PatchError> {
        match response.usable_current_revision() {
            Some(current) if *current != patch.base_revision => {
                info!(
                    resource = %self.resource,
                    stale = %patch.base_revision,
                    current = %current,
                    "revision conflict, rebasing preview"
                );
                Ok(current.clone())
            }
            _ => {
                warn!(resource = %self.resource, base = %patch.base_revision, "revision conflict without usable current revision");
                Err(PatchError::generic_conflict())
            }
        }
    }

    async fn preview_rebased(
        &self,
        patch: &ProposedPatch,
        current: RevisionToken,
    ) -> Result<PreviewOutcome, PatchError> {
        let rebased = patch.rebased(current);
        let response = self.api.submit(&self.resource, &rebased, true).await?;
        if response.is_revision_mismatch() {
            warn!(resource = %self.resource, base = %rebased.base_revision, "document kept changing during rebase");
            return Err(PatchError::generic_conflict());
        }
        Ok(PreviewOutcome::from_response(
            response,
            rebased.base_revision,
            Some(patch.base_revision.clone()),
        ))
    }
}

/// One proposer's editing session over a document.
///
/// Tracks the most recent revision seen in a server response and bases
/// every new patch on it. The token lives only as long as the session.
pub struct EditSession {
    coordinator: PatchCoordinator,
    revision: RevisionToken,
}

impl EditSession {
    pub fn new(coordinator: PatchCoordinator, revision: RevisionToken) -> Self {
        Self {
            coordinator,
            revision,
        }
    }

    pub fn revision(&self) -> &RevisionToken {
        &self.revision
    }

    pub fn coordinator(&self) -> &PatchCoordinator {
        &self.coordinator
    }

    /// Builds a patch on the session's current revision.
    pub fn propose(&self, operations: Vec<PatchOp>) -> ProposedPatch {
        ProposedPatch::new(self.revision.clone(), operations)
    }

    pub async fn preview(&mut self, operations: Vec<PatchOp>) -> Result<PreviewOutcome, PatchError> {
        let outcome = self.coordinator.preview(&self.propose(operations)).await?;
        self.revision = outcome.base_revision.clone();
        Ok(outcome)
    }

    pub async fn apply(&mut self, operations: Vec<PatchOp>) -> Result<ApplyOutcome, PatchError> {
        let outcome = self.coordinator.apply(&self.propose(operations)).await?;
        self.revision = match &outcome {
            ApplyOutcome::Applied { new_revision, .. } => new_revision.clone(),
            ApplyOutcome::Rebased { preview } => preview.base_revision.clone(),
        };
        Ok(outcome)
    }
}
