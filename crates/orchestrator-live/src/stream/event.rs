use serde::Deserialize;
use tracing::debug;

use super::decoder::EventFrame;
use crate::model::RunId;

/// Typed run events decoded from stream frames.
///
/// Unknown kinds are kept as `Unknown` so newer servers can add events
/// without breaking older clients.
#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    /// A step started executing. The first one also confirms the run id.
    Start {
        run_id: Option<RunId>,
        node_id: Option<String>,
    },
    /// Progress update; never changes the phase.
    Progress {
        progress: Option<f64>,
        node_id: Option<String>,
    },
    /// One step finished.
    Complete {
        node_id: String,
        output: Option<serde_json::Value>,
    },
    /// One step (or the run, when `node_id` is absent) reported an error.
    Error {
        node_id: Option<String>,
        error: String,
    },
    /// The server finished driving the run.
    RunFinished { status: Option<String> },
    /// The run was paused; no further frames follow on this connection.
    Paused,
    /// The run was cancelled server-side.
    Cancelled,
    /// A kind this client does not understand.
    Unknown {
        kind: String,
        payload: serde_json::Value,
    },
}

#[derive(Deserialize)]
struct StartPayload {
    #[serde(default)]
    run_id: Option<RunId>,
    #[serde(default, alias = "node", alias = "current_node")]
    node_id: Option<String>,
}

#[derive(Deserialize)]
struct ProgressPayload {
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default, alias = "node", alias = "current_node")]
    node_id: Option<String>,
}

#[derive(Deserialize)]
struct CompletePayload {
    #[serde(alias = "node")]
    node_id: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default, alias = "node")]
    node_id: Option<String>,
    #[serde(alias = "message")]
    error: String,
}

#[derive(Deserialize)]
struct FinishedPayload {
    #[serde(default)]
    status: Option<String>,
}

impl RunEvent {
    /// Maps a frame to a typed event.
    ///
    /// Returns `None` when a known kind carries a payload of the wrong shape;
    /// that frame is dropped and the stream continues.
    pub fn from_frame(frame: &EventFrame) -> Option<Self> {
        let payload = &frame.payload;
        let decoded = match frame.kind.as_str() {
            "start" | "node_start" => decode::<StartPayload>(payload).map(|p| Self::Start {
                run_id: p.run_id,
                node_id: p.node_id,
            }),
            "progress" => decode::<ProgressPayload>(payload).map(|p| Self::Progress {
                progress: p.progress,
                node_id: p.node_id,
            }),
            "complete" | "node_complete" => {
                decode::<CompletePayload>(payload).map(|p| Self::Complete {
                    node_id: p.node_id,
                    output: p.output,
                })
            }
            "error" | "node_error" => decode::<ErrorPayload>(payload).map(|p| Self::Error {
                node_id: p.node_id,
                error: p.error,
            }),
            "run_finished" | "finished" | "done" => {
                decode::<FinishedPayload>(payload).map(|p| Self::RunFinished { status: p.status })
            }
            "paused" => Ok(Self::Paused),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Ok(Self::Unknown {
                kind: other.to_string(),
                payload: payload.clone(),
            }),
        };
        match decoded {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(kind = %frame.kind, error = %e, "dropping frame with unexpected payload shape");
                None
            }
        }
    }

    /// Returns true for signals that end the run.
    pub fn is_terminal_signal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::Cancelled)
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T, serde_json::Error> {
    T::deserialize(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(kind: &str, payload: serde_json::Value) -> EventFrame {
        EventFrame {
            kind: kind.to_string(),
            payload,
        }
    }

    #[test]
    fn maps_known_kinds() {
        let start = RunEvent::from_frame(&frame(
            "start",
            json!({"type":"start","run_id":"r1","node_id":"fetch"}),
        ));
        assert_eq!(
            start,
            Some(RunEvent::Start {
                run_id: Some(RunId::new("r1")),
                node_id: Some("fetch".into())
            })
        );

        let progress = RunEvent::from_frame(&frame("progress", json!({"progress": 60, "current_node": "b"})));
        assert_eq!(
            progress,
            Some(RunEvent::Progress {
                progress: Some(60.0),
                node_id: Some("b".into())
            })
        );

        let error = RunEvent::from_frame(&frame("error", json!({"node_id":"a","message":"boom"})));
        assert_eq!(
            error,
            Some(RunEvent::Error {
                node_id: Some("a".into()),
                error: "boom".into()
            })
        );

        assert_eq!(
            RunEvent::from_frame(&frame("paused", json!({}))),
            Some(RunEvent::Paused)
        );
        assert!(RunEvent::from_frame(&frame("run_finished", json!({}))).expect("finished").is_terminal_signal());
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let event = RunEvent::from_frame(&frame("heartbeat", json!({"t": 1}))).expect("event");
        assert!(matches!(event, RunEvent::Unknown { ref kind, .. } if kind == "heartbeat"));
    }

    #[test]
    fn known_kind_with_wrong_shape_is_dropped() {
        assert_eq!(RunEvent::from_frame(&frame("complete", json!({"output": 1}))), None);
        assert_eq!(RunEvent::from_frame(&frame("progress", json!({"progress": "lots"}))), None);
    }
}
