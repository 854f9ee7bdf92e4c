use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Upstream provider behind a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Provider {
    #[default]
    #[serde(rename = "gemini-oauth")]
    GeminiOauth,

    #[serde(rename = "gl-apikey")]
    GlApikey,

    #[serde(rename = "codex-oauth")]
    CodexOauth,
}

impl Provider {
    /// OAuth accounts carry a refresh lifecycle and are eligible for
    /// preview-model switching; static-key accounts are not.
    pub fn is_oauth(self) -> bool {
        !matches!(self, Provider::GlApikey)
    }

    pub fn serves(self, family: ModelFamily) -> bool {
        match family {
            ModelFamily::Gemini => matches!(self, Provider::GeminiOauth | Provider::GlApikey),
            ModelFamily::Gpt => matches!(self, Provider::CodexOauth),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::GeminiOauth => "gemini-oauth",
            Provider::GlApikey => "gl-apikey",
            Provider::CodexOauth => "codex-oauth",
        }
    }
}

/// Model families the proxy routes, derived from the model-name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Gemini,
    Gpt,
}

impl ModelFamily {
    pub fn of(model: &str) -> Option<Self> {
        if model.starts_with("gemini-") {
            Some(ModelFamily::Gemini)
        } else if model.starts_with("gpt-") {
            Some(ModelFamily::Gpt)
        } else {
            None
        }
    }
}

/// Stable identity of one upstream account: (provider, email, project).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialIdentity {
    pub provider: Provider,
    pub email: String,
    pub project_id: String,
}

impl fmt::Display for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.provider.as_str(),
            self.email,
            self.project_id
        )
    }
}

/// One upstream account's persisted authorization state.
///
/// The JSON form is the on-disk credential file; static-key records exist
/// only in memory (`api_key` is never serialized).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub project_id: String,

    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default = "expired_now")]
    pub token_expiry: DateTime<Utc>,

    /// Eligible for automatic selection by the pool.
    #[serde(default = "default_true")]
    pub auto: bool,

    /// Set once a liveness probe against the upstream has succeeded.
    #[serde(default)]
    pub checked: bool,

    #[serde(default)]
    pub provider: Provider,

    #[serde(skip)]
    pub api_key: Option<String>,
}

fn expired_now() -> DateTime<Utc> {
    Utc::now()
}

fn default_true() -> bool {
    true
}

impl CredentialRecord {
    /// Synthesize a degenerate record from a static Generative Language
    /// API key. Identity comes from a key fingerprint since there is no
    /// email or project binding.
    pub fn from_static_key(key: &str) -> Self {
        CredentialRecord {
            email: format!("gl-{}", fingerprint8(key)),
            project_id: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            token_expiry: Utc::now(),
            auto: true,
            checked: true,
            provider: Provider::GlApikey,
            api_key: Some(key.to_string()),
        }
    }

    pub fn identity(&self) -> CredentialIdentity {
        CredentialIdentity {
            provider: self.provider,
            email: self.email.clone(),
            project_id: self.project_id.clone(),
        }
    }

    /// Basename (without extension) of the backing credential file.
    /// Round-trips with the record identity.
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.email, self.project_id)
    }

    /// True if current time is within 5 minutes of expiry (inclusive).
    /// The early-expiry buffer avoids races at the edge of a request.
    pub fn is_expired(&self) -> bool {
        if self.provider == Provider::GlApikey {
            return false;
        }
        Utc::now() + Duration::minutes(5) >= self.token_expiry
    }

    /// Merge an OAuth token response into this record. Only fields present
    /// in the payload change.
    pub fn apply_token_payload(&mut self, payload: &serde_json::Value) {
        if let Some(token) = payload.get("access_token").and_then(|v| v.as_str()) {
            self.access_token = token.to_string();
        }
        if let Some(token) = payload.get("refresh_token").and_then(|v| v.as_str()) {
            if !token.is_empty() {
                self.refresh_token = token.to_string();
            }
        }
        if let Some(secs) = payload.get("expires_in").and_then(|v| v.as_i64()) {
            self.token_expiry = Utc::now() + Duration::seconds(secs);
        } else if let Some(expiry) = payload
            .get("token_expiry")
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
        {
            self.token_expiry = expiry;
        }
    }

    /// Fingerprint over the token material, used by the store to decide
    /// whether a rescan actually changed anything.
    pub fn token_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.access_token.hash(&mut hasher);
        self.refresh_token.hash(&mut hasher);
        self.api_key.hash(&mut hasher);
        hasher.finish()
    }
}

fn fingerprint8(input: &str) -> String {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:08x}", (hasher.finish() & 0xffff_ffff) as u32)
}

/// In-memory handle for one credential. Token state is mutex-guarded so a
/// snapshot read never observes a half-applied refresh; the separate async
/// gate collapses concurrent refresh attempts to one.
#[derive(Debug)]
pub struct Credential {
    identity: CredentialIdentity,
    record: std::sync::Mutex<CredentialRecord>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl Credential {
    pub fn new(record: CredentialRecord) -> Self {
        Credential {
            identity: record.identity(),
            record: std::sync::Mutex::new(record),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &CredentialIdentity {
        &self.identity
    }

    pub fn provider(&self) -> Provider {
        self.identity.provider
    }

    pub fn snapshot(&self) -> CredentialRecord {
        self.record.lock().expect("credential mutex poisoned").clone()
    }

    pub fn is_auto(&self) -> bool {
        self.record.lock().expect("credential mutex poisoned").auto
    }

    pub fn update(&self, apply: impl FnOnce(&mut CredentialRecord)) {
        let mut record = self.record.lock().expect("credential mutex poisoned");
        apply(&mut record);
    }

    /// Serializes concurrent token refreshes for this credential.
    pub fn refresh_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.refresh_gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_stem_round_trips_identity() {
        let record: CredentialRecord = serde_json::from_value(json!({
            "email": "dev@example.com",
            "project_id": "my-project",
            "access_token": "at",
            "refresh_token": "rt",
            "token_expiry": "2030-01-01T00:00:00Z",
            "auto": true,
            "checked": false
        }))
        .unwrap();

        assert_eq!(record.file_stem(), "dev@example.com-my-project");
        assert_eq!(record.provider, Provider::GeminiOauth);
        assert_eq!(record.identity().to_string(), "gemini-oauth:dev@example.com:my-project");
    }

    #[test]
    fn disk_format_round_trips() {
        let input = json!({
            "email": "dev@example.com",
            "project_id": "my-project",
            "access_token": "at",
            "refresh_token": "rt",
            "token_expiry": "2030-01-01T00:00:00Z",
            "auto": false,
            "checked": true,
            "provider": "gemini-oauth"
        });

        let record: CredentialRecord = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(serde_json::to_value(&record).unwrap(), input);
    }

    #[test]
    fn expired_token_detected_with_skew() {
        let mut record = CredentialRecord::from_static_key("k");
        record.provider = Provider::GeminiOauth;
        record.token_expiry = Utc::now() + Duration::minutes(3);
        assert!(record.is_expired());

        record.token_expiry = Utc::now() + Duration::minutes(10);
        assert!(!record.is_expired());
    }

    #[test]
    fn static_key_never_expires() {
        let record = CredentialRecord::from_static_key("k");
        assert!(!record.is_expired());
        assert!(record.checked);
        assert!(record.email.starts_with("gl-"));
    }

    #[test]
    fn token_payload_merge_updates_expiry() {
        let mut record = CredentialRecord::from_static_key("k");
        record.provider = Provider::GeminiOauth;
        let before = record.token_fingerprint();

        record.apply_token_payload(&json!({
            "access_token": "fresh",
            "expires_in": 3600
        }));

        assert_eq!(record.access_token, "fresh");
        assert!(record.token_expiry > Utc::now() + Duration::minutes(30));
        assert_ne!(record.token_fingerprint(), before);
    }

    #[test]
    fn families_route_by_prefix() {
        assert_eq!(ModelFamily::of("gemini-2.5-pro"), Some(ModelFamily::Gemini));
        assert_eq!(ModelFamily::of("gpt-5"), Some(ModelFamily::Gpt));
        assert_eq!(ModelFamily::of("claude-3"), None);

        assert!(Provider::GeminiOauth.serves(ModelFamily::Gemini));
        assert!(Provider::GlApikey.serves(ModelFamily::Gemini));
        assert!(!Provider::GlApikey.serves(ModelFamily::Gpt));
        assert!(Provider::CodexOauth.serves(ModelFamily::Gpt));
        assert!(!Provider::CodexOauth.serves(ModelFamily::Gemini));
    }
}
