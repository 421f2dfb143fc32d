use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Creates an id from any string-like value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Server-assigned identifier of one run (distinct from the workflow id).
    RunId
);

string_id!(
    /// Identifier of the workflow definition a run executes.
    WorkflowId
);

string_id!(
    /// Opaque compare-and-swap marker for one persisted document state.
    ///
    /// Two documents with equal tokens are identical; every write produces a
    /// new token.
    RevisionToken
);

/// Client-side key for a tracked run.
///
/// A run has no server id until the stream confirms it, so controllers and
/// the registry are keyed by this value instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunKey(pub uuid::Uuid);

impl RunKey {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_serialize_transparently() {
        let id = RunId::new("run-1");
        assert_eq!(serde_json::to_value(&id).expect("ser"), serde_json::json!("run-1"));
        let back: RevisionToken = serde_json::from_str("\"rev-9\"").expect("de");
        assert_eq!(back.as_str(), "rev-9");
    }

    #[test]
    fn run_keys_are_unique() {
        assert_ne!(RunKey::new(), RunKey::new());
    }
}
