use crate::auth::{CredentialStore, ModelFamily, Provider, Snapshot};
use crate::config::QuotaExceeded;
use crate::error::RelayError;
use crate::quota::QuotaLedger;
use crate::upstream::UpstreamClient;
use castor_schema::gemini::{GenerateContentRequest, GenerateContentResponse};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

/// What a successful dispatch hands back to the frontend.
#[derive(Debug)]
pub enum UpstreamResponse {
    Json(GenerateContentResponse),
    Stream {
        response: reqwest::Response,
        provider: Provider,
    },
}

/// Selects an eligible upstream client for each request, round-robins
/// across accounts, and drives the quota retry/fallback machine.
pub struct AccountPool {
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    clients: RwLock<Arc<Vec<Arc<UpstreamClient>>>>,
    cursor: Mutex<usize>,
    ledger: QuotaLedger,
    quota_cfg: QuotaExceeded,
}

impl AccountPool {
    /// Builds the pool from the store's current snapshot and re-builds it
    /// on every snapshot change. In-flight requests keep the client they
    /// already resolved.
    pub fn new(
        quota_cfg: QuotaExceeded,
        http: reqwest::Client,
        store: Arc<CredentialStore>,
    ) -> Arc<Self> {
        let pool = Arc::new(AccountPool {
            http,
            store: Arc::clone(&store),
            clients: RwLock::new(Arc::new(Vec::new())),
            cursor: Mutex::new(0),
            ledger: QuotaLedger::new(),
            quota_cfg,
        });

        pool.rebuild(store.snapshot());

        let weak: Weak<AccountPool> = Arc::downgrade(&pool);
        store.subscribe(move |snapshot| {
            if let Some(pool) = weak.upgrade() {
                pool.rebuild(snapshot);
            }
        });

        pool
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    fn rebuild(&self, snapshot: Snapshot) {
        let clients: Vec<Arc<UpstreamClient>> = snapshot
            .iter()
            .map(|credential| {
                Arc::new(UpstreamClient::new(
                    self.http.clone(),
                    Arc::clone(credential),
                    Arc::clone(&self.store),
                ))
            })
            .collect();
        info!(clients = clients.len(), "account pool rebuilt");
        *self.clients.write().expect("pool lock poisoned") = Arc::new(clients);
    }

    fn clients(&self) -> Arc<Vec<Arc<UpstreamClient>>> {
        self.clients.read().expect("pool lock poisoned").clone()
    }

    /// Any OAuth client currently able to sign Code Assist calls, for the
    /// loopback passthrough surface.
    pub fn any_code_assist_client(&self) -> Option<Arc<UpstreamClient>> {
        self.clients()
            .iter()
            .find(|c| c.provider() == Provider::GeminiOauth && c.credential().is_auto())
            .cloned()
    }

    /// Candidates for one dispatch: live credentials of the model's family
    /// with `auto` set, rotated by the round-robin cursor. The cursor
    /// advances exactly once per dispatch; preview substitution never
    /// advances it.
    fn ordered_candidates(&self, family: ModelFamily) -> Vec<Arc<UpstreamClient>> {
        let clients = self.clients();
        let eligible: Vec<Arc<UpstreamClient>> = clients
            .iter()
            .filter(|c| c.serves(family))
            .cloned()
            .collect();
        if eligible.is_empty() {
            return eligible;
        }

        let start = {
            let mut cursor = self.cursor.lock().expect("cursor mutex poisoned");
            let start = *cursor;
            *cursor = cursor.wrapping_add(1);
            start % eligible.len()
        };

        let mut ordered = Vec::with_capacity(eligible.len());
        for offset in 0..eligible.len() {
            ordered.push(Arc::clone(&eligible[(start + offset) % eligible.len()]));
        }
        ordered
    }

    /// The model this candidate should be called with right now: the
    /// requested model unless ledger-exhausted, else the first clear
    /// preview alias (OAuth accounts only), else nothing.
    fn effective_model(
        &self,
        candidate: &UpstreamClient,
        model: &str,
        allow_preview: bool,
    ) -> Option<String> {
        if !self.ledger.is_exhausted(candidate.identity(), model) {
            return Some(model.to_string());
        }
        if allow_preview {
            for preview in QuotaLedger::preview_candidates(model) {
                if !self.ledger.is_exhausted(candidate.identity(), preview) {
                    debug!(
                        identity = %candidate.identity(),
                        base = model,
                        preview,
                        "quota exhausted on base model; switching to preview"
                    );
                    return Some(preview.to_string());
                }
            }
        }
        None
    }

    /// Walk candidates in cursor order, resolve an effective model against
    /// the ledger, issue, and react to quota signals. Non-quota upstream
    /// failures surface without retrying.
    pub async fn dispatch(
        &self,
        model: &str,
        request: &GenerateContentRequest,
        stream: bool,
    ) -> Result<UpstreamResponse, RelayError> {
        let family = ModelFamily::of(model)
            .ok_or_else(|| RelayError::Translate(format!("unsupported model: {model}")))?;

        let candidates = self.ordered_candidates(family);
        if candidates.is_empty() {
            return Err(RelayError::NoAvailableCredential);
        }

        // With account switching disabled, the request is confined to the
        // candidate the cursor landed on.
        let reachable = if self.quota_cfg.switch_project {
            candidates.len()
        } else {
            1
        };

        let mut auth_failure: Option<RelayError> = None;
        let mut saw_quota = false;

        for candidate in candidates.into_iter().take(reachable) {
            let allow_preview =
                self.quota_cfg.switch_preview_model && candidate.provider().is_oauth();

            loop {
                let Some(effective) = self.effective_model(&candidate, model, allow_preview)
                else {
                    break;
                };

                match self.issue(&candidate, &effective, request, stream).await {
                    Ok(response) => {
                        self.ledger.clear(candidate.identity(), &effective);
                        return Ok(response);
                    }
                    Err(RelayError::Quota { .. }) => {
                        saw_quota = true;
                        self.ledger.mark(candidate.identity(), &effective);
                        warn!(
                            identity = %candidate.identity(),
                            model = %effective,
                            "upstream quota exhausted"
                        );
                        if !allow_preview {
                            break;
                        }
                        // Re-resolve against the ledger; the mark just
                        // recorded steers us to the next preview alias.
                    }
                    Err(e @ RelayError::Auth(_)) => {
                        auth_failure = Some(e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if !saw_quota {
            if let Some(e) = auth_failure {
                return Err(e);
            }
        }
        Err(RelayError::AllExhausted {
            model: model.to_string(),
        })
    }

    async fn issue(
        &self,
        candidate: &UpstreamClient,
        model: &str,
        request: &GenerateContentRequest,
        stream: bool,
    ) -> Result<UpstreamResponse, RelayError> {
        if stream {
            let response = candidate.stream_generate(model, request).await?;
            Ok(UpstreamResponse::Stream {
                response,
                provider: candidate.provider(),
            })
        } else {
            let response = candidate.generate(model, request).await?;
            Ok(UpstreamResponse::Json(response))
        }
    }
}
