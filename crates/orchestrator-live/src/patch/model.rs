use serde::{Deserialize, Serialize};

use crate::errors::PatchError;
use crate::model::RevisionToken;

/// One edit inside a proposed patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Replace the sub-content found at `location`.
    StructuralEdit {
        location: String,
        content: serde_json::Value,
    },
    /// Replace the whole document body.
    FullReplace { content: String },
}

impl PatchOp {
    pub fn structural_edit(location: impl Into<String>, content: serde_json::Value) -> Self {
        Self::StructuralEdit {
            location: location.into(),
            content,
        }
    }

    pub fn full_replace(content: impl Into<String>) -> Self {
        Self::FullReplace {
            content: content.into(),
        }
    }

    fn validate(&self, index: usize) -> Result<(), PatchError> {
        match self {
            Self::StructuralEdit { location, .. } if location.trim().is_empty() => Err(
                PatchError::Malformed(format!("operation {index}: structural edit has no location")),
            ),
            Self::FullReplace { content } if content.trim().is_empty() => Err(
                PatchError::Malformed(format!("operation {index}: full replace content is empty")),
            ),
            _ => Ok(()),
        }
    }
}

/// A set of operations to apply on top of `base_revision`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposedPatch {
    pub base_revision: RevisionToken,
    pub operations: Vec<PatchOp>,
}

impl ProposedPatch {
    pub fn new(base_revision: RevisionToken, operations: Vec<PatchOp>) -> Self {
        Self {
            base_revision,
            operations,
        }
    }

    /// Single full-replace patch.
    pub fn full_replace(base_revision: RevisionToken, content: impl Into<String>) -> Self {
        Self::new(base_revision, vec![PatchOp::full_replace(content)])
    }

    /// Rejects patches that must never reach the server.
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.base_revision.as_str().trim().is_empty() {
            return Err(PatchError::Malformed("base revision is empty".into()));
        }
        if self.operations.is_empty() {
            return Err(PatchError::Malformed("patch has no operations".into()));
        }
        self.operations
            .iter()
            .enumerate()
            .try_for_each(|(index, op)| op.validate(index))
    }

    /// The same operations on top of another revision.
    pub fn rebased(&self, base_revision: RevisionToken) -> Self {
        Self {
            base_revision,
            operations: self.operations.clone(),
        }
    }
}
