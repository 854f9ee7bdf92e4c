use super::{codex, oauth};
use crate::auth::{Credential, CredentialIdentity, CredentialStore, ModelFamily, Provider};
use crate::error::{IsRetryable, OauthError, RelayError};
use backon::{ExponentialBuilder, Retryable};
use castor_schema::gemini::{
    CliEnvelope, Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
    ThinkingConfig, parse_response_payload,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ONBOARD_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ONBOARD_MAX_ATTEMPTS: usize = 60;

/// One HTTP transport bound to one credential. Signs requests, refreshes
/// tokens lazily, and exposes the generate / stream-generate operations.
pub struct UpstreamClient {
    http: reqwest::Client,
    credential: Arc<Credential>,
    store: Arc<CredentialStore>,
    oauth_retry: ExponentialBuilder,
}

impl UpstreamClient {
    pub fn new(
        http: reqwest::Client,
        credential: Arc<Credential>,
        store: Arc<CredentialStore>,
    ) -> Self {
        let oauth_retry = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .with_max_times(2)
            .with_jitter();
        UpstreamClient {
            http,
            credential,
            store,
            oauth_retry,
        }
    }

    pub fn identity(&self) -> &CredentialIdentity {
        self.credential.identity()
    }

    pub fn provider(&self) -> Provider {
        self.credential.provider()
    }

    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }

    /// Eligible for automatic selection of `family` right now.
    pub fn serves(&self, family: ModelFamily) -> bool {
        self.provider().serves(family) && self.credential.is_auto()
    }

    /// Non-streaming generation. The Code Assist envelope is unwrapped
    /// before returning.
    pub async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, RelayError> {
        if self.provider() == Provider::CodexOauth {
            // Codex upstream is stream-only; buffer it for JSON callers.
            let resp = self.post_codex(model, request).await?;
            return codex::collect_response(resp).await;
        }

        let resp = self.post_generate(model, request, false).await?;
        let body = resp.text().await?;
        parse_response_payload(&body).map_err(|e| {
            warn!(error = %e, "failed to parse upstream generate body");
            RelayError::Json(e)
        })
    }

    /// Streaming generation; the caller reads the SSE body. The wire
    /// dialect of the stream depends on this client's provider.
    pub async fn stream_generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, RelayError> {
        if self.provider() == Provider::CodexOauth {
            return self.post_codex(model, request).await;
        }
        self.post_generate(model, request, true).await
    }

    async fn post_generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        stream: bool,
    ) -> Result<reqwest::Response, RelayError> {
        let op = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };

        let builder = match self.provider() {
            Provider::GlApikey => {
                let record = self.credential.snapshot();
                let key = record.api_key.ok_or_else(|| {
                    RelayError::Internal("static-key credential missing its key".to_string())
                })?;
                let mut url = format!(
                    "{}/{}/models/{model}:{op}",
                    super::GL_ENDPOINT,
                    super::GL_API_VERSION
                );
                if stream {
                    url.push_str("?alt=sse");
                }
                // The {project, request, model} envelope is Code Assist
                // only; the GL API takes the inner request.
                self.http.post(url).header("x-goog-api-key", key).json(request)
            }
            _ => {
                let token = self.ensure_access_token().await?;
                let record = self.credential.snapshot();
                let mut url = format!(
                    "{}/{}:{op}",
                    super::CODE_ASSIST_ENDPOINT,
                    super::CODE_ASSIST_API_VERSION
                );
                if stream {
                    url.push_str("?alt=sse");
                }
                let envelope = CliEnvelope::new(model, record.project_id, request.clone());
                self.code_assist_headers(self.http.post(url), &token)
                    .json(&envelope)
            }
        };

        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(classify_error(resp).await);
        }
        Ok(resp)
    }

    async fn post_codex(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, RelayError> {
        let token = self.ensure_access_token().await?;
        let record = self.credential.snapshot();
        let resp = codex::post_responses(&self.http, &token, &record.project_id, model, request)
            .await?;
        if !resp.status().is_success() {
            return Err(classify_error(resp).await);
        }
        Ok(resp)
    }

    fn code_assist_headers(
        &self,
        builder: reqwest::RequestBuilder,
        token: &str,
    ) -> reqwest::RequestBuilder {
        builder
            .header(reqwest::header::USER_AGENT, super::user_agent())
            .header("Client-Metadata", super::client_metadata_header())
            .bearer_auth(token)
    }

    /// Access token for the bound credential, refreshing when expiry is
    /// within the skew. Concurrent callers collapse onto one refresh.
    async fn ensure_access_token(&self) -> Result<String, RelayError> {
        let record = self.credential.snapshot();
        if record.provider == Provider::GlApikey {
            return Err(RelayError::Internal(
                "static-key credential has no OAuth token".to_string(),
            ));
        }
        if !record.access_token.is_empty() && !record.is_expired() {
            return Ok(record.access_token);
        }

        let _gate = self.credential.refresh_gate().lock().await;
        let record = self.credential.snapshot();
        if !record.access_token.is_empty() && !record.is_expired() {
            // Another task finished the refresh while we waited.
            return Ok(record.access_token);
        }

        match self.refresh_locked(&record).await {
            Ok(token) => Ok(token),
            Err(e) => {
                // Non-selectable until the next directory reload.
                self.credential.update(|r| r.auto = false);
                warn!(
                    identity = %self.credential.identity(),
                    error = %e,
                    "token refresh failed; credential disabled until reload"
                );
                Err(RelayError::Auth(e))
            }
        }
    }

    async fn refresh_locked(&self, record: &crate::auth::CredentialRecord) -> Result<String, OauthError> {
        let provider = record.provider;
        let refresh_token = record.refresh_token.clone();
        let http = self.http.clone();

        let response = (|| {
            let refresh_token = refresh_token.clone();
            let http = http.clone();
            async move {
                match provider {
                    Provider::CodexOauth => oauth::refresh_codex(&refresh_token, &http).await,
                    _ => oauth::refresh_google(&refresh_token, &http).await,
                }
            }
        })
        .retry(self.oauth_retry)
        .when(|e: &OauthError| e.is_retryable())
        .notify(|err, dur: Duration| {
            error!("OAuth refresh error {err}, retrying in {dur:?}");
        })
        .await?;

        let payload = oauth::token_payload(&response)?;
        self.credential.update(|r| r.apply_token_payload(&payload));

        let updated = self.credential.snapshot();
        if !updated.email.is_empty() {
            if let Err(e) = self.store.persist(&updated) {
                warn!(identity = %self.credential.identity(), error = %e, "failed to persist refreshed credential");
            }
        }
        info!(identity = %self.credential.identity(), "access token refreshed");
        Ok(updated.access_token)
    }

    /// Raw Code Assist RPC (`loadCodeAssist`, `onboardUser`, `countTokens`).
    /// Also backs the loopback passthrough surface.
    pub async fn code_assist_post(&self, op: &str, body: &Value) -> Result<Value, RelayError> {
        let token = self.ensure_access_token().await?;
        let url = format!(
            "{}/{}:{op}",
            super::CODE_ASSIST_ENDPOINT,
            super::CODE_ASSIST_API_VERSION
        );
        let resp = self
            .code_assist_headers(self.http.post(url), &token)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(classify_error(resp).await);
        }
        resp.json().await.map_err(RelayError::Transport)
    }

    /// One-shot onboarding dance: `loadCodeAssist`, pick the default tier
    /// (`legacy-tier` when none is marked default), then poll `onboardUser`
    /// until the operation completes. Returns the finalized project id.
    pub async fn setup_user(&self, email: &str, project_id: &str) -> Result<String, RelayError> {
        self.credential.update(|r| r.email = email.to_string());
        info!(email, "performing user onboarding");

        let mut load_req = json!({ "metadata": super::client_metadata_body() });
        if !project_id.is_empty() {
            load_req["cloudaicompanionProject"] = json!(project_id);
        }
        let load_resp: LoadCodeAssistResponse =
            serde_json::from_value(self.code_assist_post("loadCodeAssist", &load_req).await?)?;

        let tier_id = load_resp
            .allowed_tiers
            .iter()
            .find(|t| t.is_default)
            .and_then(|t| t.id.clone())
            .unwrap_or_else(|| "legacy-tier".to_string());

        let onboard_project = load_resp
            .cloudaicompanion_project
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| project_id.to_string());
        if onboard_project.is_empty() {
            return Err(RelayError::Auth(OauthError::Flow {
                code: "ONBOARD_FAILED".to_string(),
                message: "user onboarding needs a project id".to_string(),
            }));
        }

        let onboard_req = json!({
            "tierId": tier_id,
            "metadata": super::client_metadata_body(),
            "cloudaicompanionProject": onboard_project,
        });

        for attempt in 1..=ONBOARD_MAX_ATTEMPTS {
            let operation: OnboardOperation =
                serde_json::from_value(self.code_assist_post("onboardUser", &onboard_req).await?)?;

            if operation.done {
                let finalized = if !project_id.is_empty() {
                    project_id.to_string()
                } else {
                    operation
                        .response
                        .and_then(|r| r.cloudaicompanion_project)
                        .map(|p| p.id)
                        .ok_or_else(|| {
                            RelayError::Auth(OauthError::Flow {
                                code: "ONBOARD_FAILED".to_string(),
                                message: "onboarding completed but returned no project id"
                                    .to_string(),
                            })
                        })?
                };

                self.credential.update(|r| r.project_id = finalized.clone());
                let record = self.credential.snapshot();
                if let Err(e) = self.store.persist(&record) {
                    warn!(error = %e, "failed to persist onboarded credential");
                }
                info!(project_id = %finalized, "onboarding complete");
                return Ok(finalized);
            }

            debug!(attempt, "onboarding in progress, waiting 5 seconds");
            tokio::time::sleep(ONBOARD_POLL_INTERVAL).await;
        }

        Err(RelayError::Auth(OauthError::Flow {
            code: "ONBOARD_TIMEOUT".to_string(),
            message: "companion project provisioning timed out".to_string(),
        }))
    }

    /// Project inventory visible to the bound credential.
    pub async fn list_projects(&self) -> Result<Value, RelayError> {
        let token = self.ensure_access_token().await?;
        let resp = self
            .http
            .get(super::RESOURCE_MANAGER_PROJECTS_URL)
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(classify_error(resp).await);
        }
        resp.json().await.map_err(RelayError::Transport)
    }

    /// Liveness probe: a minimal streaming request with zero thinking
    /// budget. True on 2xx; false on 403, surfacing the activation URL as
    /// a user-actionable hint when the upstream provides one.
    pub async fn probe_api_enabled(&self) -> Result<bool, RelayError> {
        let request = GenerateContentRequest {
            contents: vec![Content::user(vec![Part::from_text(
                "Be concise. What is the capital of France?",
            )])],
            generation_config: Some(GenerationConfig {
                thinking_config: Some(ThinkingConfig {
                    include_thoughts: None,
                    thinking_budget: Some(0),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        match self.post_generate("gemini-2.5-flash", &request, true).await {
            Ok(resp) => {
                // Drain; only the status matters.
                let _ = resp.bytes().await;
                self.credential.update(|r| r.checked = true);
                let record = self.credential.snapshot();
                if let Err(e) = self.store.persist(&record) {
                    warn!(error = %e, "failed to persist probed credential");
                }
                Ok(true)
            }
            Err(RelayError::ApiDisabled { activation_url, .. }) => {
                if let Some(url) = activation_url {
                    warn!(
                        identity = %self.credential.identity(),
                        activation_url = %url,
                        "Cloud AI API disabled; activate the account at the URL above and retry"
                    );
                }
                Ok(false)
            }
            Err(RelayError::UpstreamStatus { status, .. })
                if status == StatusCode::FORBIDDEN =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Map a non-2xx upstream response onto the relay error taxonomy. The body
/// is preserved for verbatim forwarding.
async fn classify_error(resp: reqwest::Response) -> RelayError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::TOO_MANY_REQUESTS => RelayError::Quota { body },
        StatusCode::FORBIDDEN => match extract_activation_url(&body) {
            Some(url) => RelayError::ApiDisabled {
                activation_url: Some(url),
                body,
            },
            None => RelayError::UpstreamStatus { status, body },
        },
        _ => RelayError::UpstreamStatus { status, body },
    }
}

fn extract_activation_url(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    if value.pointer("/error/code").and_then(Value::as_i64) != Some(403) {
        return None;
    }
    value
        .pointer("/error/details/0/metadata/activationUrl")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistResponse {
    #[serde(default)]
    allowed_tiers: Vec<TierInfo>,
    cloudaicompanion_project: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TierInfo {
    id: Option<String>,
    #[serde(default)]
    is_default: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardOperation {
    #[serde(default)]
    done: bool,
    response: Option<OnboardResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardResponse {
    cloudaicompanion_project: Option<ProjectObject>,
}

#[derive(Debug, Deserialize)]
struct ProjectObject {
    id: String,
}
