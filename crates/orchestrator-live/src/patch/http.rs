use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::{PatchOp, ProposedPatch};
use crate::config::ClientConfig;
use crate::errors::{ClientError, PatchError, extract_error_message};
use crate::model::RevisionToken;

/// Error code the server uses when the base revision is stale.
pub const REVISION_MISMATCH: &str = "revision_mismatch";

#[derive(Serialize)]
struct PatchRequest<'a> {
    base_revision: &'a RevisionToken,
    patch_ops: &'a [PatchOp],
    dry_run: bool,
}

/// Server-side semantic check results.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PatchValidation {
    #[serde(default)]
    pub valid: bool,
    #[serde(default, deserialize_with = "messages")]
    pub errors: Vec<String>,
}

/// Raw answer of the patch endpoint, for dry runs and real writes alike.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PatchResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub new_revision: Option<RevisionToken>,
    #[serde(default)]
    pub diff: Option<serde_json::Value>,
    #[serde(default)]
    pub validation: Option<PatchValidation>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub current_revision: Option<RevisionToken>,
}

impl PatchResponse {
    pub fn is_revision_mismatch(&self) -> bool {
        !self.success && self.error.as_deref() == Some(REVISION_MISMATCH)
    }

    /// The server's current revision, when it is present and non-empty.
    pub fn usable_current_revision(&self) -> Option<&RevisionToken> {
        self.current_revision
            .as_ref()
            .filter(|rev| !rev.as_str().trim().is_empty())
    }

    /// True when the body says something about the patch itself: a conflict,
    /// a validation verdict, or a server-side error code.
    pub fn has_patch_verdict(&self) -> bool {
        self.error.is_some() || self.validation.is_some() || self.current_revision.is_some()
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.validation
            .as_ref()
            .map(|v| v.errors.clone())
            .unwrap_or_default()
    }
}

// Validation messages may be plain strings or objects; keep them readable either way.
fn messages<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .map(|value| match value.as_str() {
            Some(text) => text.to_string(),
            None => value
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        })
        .collect())
}

/// Submits patches to a resource's patch endpoint.
#[async_trait::async_trait]
pub trait PatchApi: Send + Sync {
    async fn submit(
        &self,
        resource: &str,
        patch: &ProposedPatch,
        dry_run: bool,
    ) -> Result<PatchResponse, PatchError>;
}

/// HTTP implementation of `PatchApi`.
pub struct HttpPatchApi {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpPatchApi {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build patch client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl PatchApi for HttpPatchApi {
    async fn submit(
        &self,
        resource: &str,
        patch: &ProposedPatch,
        dry_run: bool,
    ) -> Result<PatchResponse, PatchError> {
        let url = self.config.patch_url(resource);
        debug!(%resource, base_revision = %patch.base_revision, dry_run, "submitting patch");
        let mut req = self.client.post(&url).json(&PatchRequest {
            base_revision: &patch.base_revision,
            patch_ops: &patch.operations,
            dry_run,
        });
        if let Some(token) = &self.config.bearer_token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| PatchError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PatchError::Transport(e.to_string()))?;

        // Conflicts and validation failures arrive with error statuses but a
        // regular response body. Any other error status is a transport failure.
        let parsed = serde_json::from_str::<PatchResponse>(&body);
        if !status.is_success() && !matches!(&parsed, Ok(p) if p.has_patch_verdict()) {
            let message = extract_error_message(status.as_u16(), &body);
            debug!(%resource, status = status.as_u16(), %message, "patch request failed");
            return Err(PatchError::Transport(message));
        }
        parsed.map_err(|e| PatchError::Protocol(format!("unreadable patch response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> HttpPatchApi {
        HttpPatchApi::new(ClientConfig::new(server.uri())).expect("api")
    }

    #[tokio::test]
    async fn posts_ops_with_dry_run_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflows/wf-1/patch"))
            .and(body_json(json!({
                "base_revision": "r1",
                "patch_ops": [{"op": "full_replace", "content": "name: demo"}],
                "dry_run": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "diff": "-name: old\n+name: demo",
                "validation": {"valid": true, "errors": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let patch = ProposedPatch::full_replace(RevisionToken::new("r1"), "name: demo");
        let response = api(&server)
            .submit("workflows/wf-1", &patch, true)
            .await
            .expect("response");
        assert!(response.success);
        assert_eq!(response.diff, Some(json!("-name: old\n+name: demo")));
        assert!(!response.is_revision_mismatch());
    }

    #[tokio::test]
    async fn conflict_body_is_parsed_despite_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "success": false,
                "error": "revision_mismatch",
                "current_revision": "r9"
            })))
            .mount(&server)
            .await;

        let patch = ProposedPatch::full_replace(RevisionToken::new("r1"), "name: demo");
        let response = api(&server)
            .submit("workflows/wf-1", &patch, false)
            .await
            .expect("response");
        assert!(response.is_revision_mismatch());
        assert_eq!(response.usable_current_revision(), Some(&RevisionToken::new("r9")));
    }

    #[tokio::test]
    async fn validation_messages_are_flattened() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "success": false,
                "validation": {
                    "valid": false,
                    "errors": ["step b has no inputs", {"message": "unknown tool", "line": 4}]
                }
            })))
            .mount(&server)
            .await;

        let patch = ProposedPatch::full_replace(RevisionToken::new("r1"), "name: demo");
        let response = api(&server)
            .submit("workflows/wf-1", &patch, true)
            .await
            .expect("response");
        assert_eq!(
            response.validation_errors(),
            vec!["step b has no inputs".to_string(), "unknown tool".to_string()]
        );
    }

    #[tokio::test]
    async fn unreadable_error_response_is_a_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let patch = ProposedPatch::full_replace(RevisionToken::new("r1"), "name: demo");
        let err = api(&server)
            .submit("workflows/wf-1", &patch, true)
            .await
            .expect_err("gateway failure");
        assert_eq!(err, PatchError::Transport("bad gateway".into()));
    }

    #[tokio::test]
    async fn error_status_without_patch_verdict_is_a_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"detail": "maintenance window"})),
            )
            .mount(&server)
            .await;

        let patch = ProposedPatch::full_replace(RevisionToken::new("r1"), "name: demo");
        let err = api(&server)
            .submit("workflows/wf-1", &patch, false)
            .await
            .expect_err("maintenance");
        assert_eq!(err, PatchError::Transport("maintenance window".into()));
    }

    #[test]
    fn blank_current_revision_is_not_usable() {
        let response = PatchResponse {
            error: Some(REVISION_MISMATCH.into()),
            current_revision: Some(RevisionToken::new(" ")),
            ..PatchResponse::default()
        };
        assert!(response.is_revision_mismatch());
        assert!(response.usable_current_revision().is_none());
    }
}
