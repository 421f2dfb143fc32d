use crate::model::RunId;
use crate::run::RunPhase;

/// Failures of the streaming transport.
///
/// `Rejected` and `Protocol` are reported by `open` before any frame is
/// delivered; `Read` is reported at most once through the stream observer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent or the connection was refused.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The server answered the open request with a failure status.
    #[error("stream rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The response was not an event stream.
    #[error("stream protocol error: {0}")]
    Protocol(String),
    /// The connection dropped or failed mid-stream.
    #[error("stream read failed: {0}")]
    Read(String),
}

/// Outcome of a failed status poll.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The run record is gone. Callers must not retry.
    #[error("run {run_id} not found")]
    NotFound { run_id: RunId },
    /// Network or server hiccup. Callers retry on their own cadence.
    #[error("transient poll failure: {0}")]
    Transient(String),
    /// The snapshot body could not be decoded.
    #[error("malformed run snapshot: {0}")]
    Malformed(String),
}

impl PollError {
    /// Returns true when the next scheduled poll may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }
}

/// Failures of the patch preview/apply protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// Rejected locally before any network call.
    #[error("malformed patch: {0}")]
    Malformed(String),
    /// The server's semantic checks failed; messages are passed through verbatim.
    #[error("patch validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },
    /// The base revision was stale and could not be resynchronized.
    #[error("{message}")]
    Conflict { message: String },
    /// The patch endpoint could not be reached.
    #[error("patch transport error: {0}")]
    Transport(String),
    /// The patch endpoint answered with something unexpected.
    #[error("patch protocol error: {0}")]
    Protocol(String),
}

pub(crate) const GENERIC_CONFLICT_MESSAGE: &str =
    "someone else changed this document, please retry";

impl PatchError {
    pub(crate) fn generic_conflict() -> Self {
        Self::Conflict {
            message: GENERIC_CONFLICT_MESSAGE.to_string(),
        }
    }
}

/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// A guarded command was refused in the current phase.
    #[error("cannot {command} while run is {phase}")]
    InvalidState {
        command: &'static str,
        phase: RunPhase,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// A one-shot run command (`pause`, `cancel`) failed.
    #[error("run command failed: {0}")]
    Command(String),
    /// The controller task has shut down.
    #[error("run controller is no longer running")]
    ControllerClosed,
}

/// Pulls a human-readable message out of an error response body.
///
/// Looks for `error`, `message` or `detail` (string, or an object carrying
/// `message`), then falls back to the trimmed body text, then to the status.
pub(crate) fn extract_error_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error", "message", "detail"] {
            match value.get(key) {
                Some(serde_json::Value::String(text)) if !text.trim().is_empty() => {
                    return text.trim().to_string();
                }
                Some(serde_json::Value::Object(inner)) => {
                    if let Some(text) = inner.get("message").and_then(|v| v.as_str()) {
                        return text.trim().to_string();
                    }
                }
                _ => {}
            }
        }
    } else if !body.trim().is_empty() && body.len() <= 512 {
        return body.trim().to_string();
    }
    format!("HTTP {status}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_message_from_json_fields() {
        assert_eq!(
            extract_error_message(400, r#"{"error":"workflow not found"}"#),
            "workflow not found"
        );
        assert_eq!(
            extract_error_message(500, r#"{"error":{"message":"boom"}}"#),
            "boom"
        );
        assert_eq!(
            extract_error_message(422, r#"{"detail":"bad input"}"#),
            "bad input"
        );
    }

    #[test]
    fn falls_back_to_body_then_status() {
        assert_eq!(extract_error_message(502, "Bad Gateway"), "Bad Gateway");
        assert_eq!(extract_error_message(503, ""), "HTTP 503");
        assert_eq!(extract_error_message(500, r#"{"ok":false}"#), "HTTP 500");
    }

    #[test]
    fn only_not_found_is_final() {
        assert!(!PollError::NotFound { run_id: RunId::new("r") }.is_retryable());
        assert!(PollError::Transient("reset".into()).is_retryable());
        assert!(PollError::Malformed("eof".into()).is_retryable());
    }
}
