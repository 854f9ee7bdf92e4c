use crate::auth::CredentialIdentity;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// How long a quota-exhaustion mark blocks an (account, model) pair.
/// Fixed by contract; not configurable.
const EXHAUSTION_WINDOW_MINUTES: i64 = 30;

/// Preview aliases drawing from separate quota buckets, consulted when a
/// base model is exhausted and the pool allows preview switching.
static PREVIEW_MODELS: LazyLock<HashMap<&'static str, Vec<&'static str>>> = LazyLock::new(|| {
    HashMap::from([
        (
            "gemini-2.5-pro",
            vec!["gemini-2.5-pro-preview-05-06", "gemini-2.5-pro-preview-06-05"],
        ),
        (
            "gemini-2.5-flash",
            vec![
                "gemini-2.5-flash-preview-04-17",
                "gemini-2.5-flash-preview-05-20",
            ],
        ),
    ])
});

/// Shared table of recent quota-exhaustion events keyed by
/// (credential identity, model name). Entries age out on read; nothing is
/// ever blocked for longer than the window.
#[derive(Default)]
pub struct QuotaLedger {
    entries: Mutex<HashMap<(CredentialIdentity, String), DateTime<Utc>>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the last observed exhaustion is within the window.
    pub fn is_exhausted(&self, identity: &CredentialIdentity, model: &str) -> bool {
        self.is_exhausted_at(identity, model, Utc::now())
    }

    fn is_exhausted_at(
        &self,
        identity: &CredentialIdentity,
        model: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let entries = self.entries.lock().expect("ledger mutex poisoned");
        match entries.get(&(identity.clone(), model.to_string())) {
            Some(marked) => now - *marked <= Duration::minutes(EXHAUSTION_WINDOW_MINUTES),
            None => false,
        }
    }

    /// Records an upstream 429 for the pair.
    pub fn mark(&self, identity: &CredentialIdentity, model: &str) {
        self.mark_at(identity, model, Utc::now());
    }

    fn mark_at(&self, identity: &CredentialIdentity, model: &str, at: DateTime<Utc>) {
        self.entries
            .lock()
            .expect("ledger mutex poisoned")
            .insert((identity.clone(), model.to_string()), at);
    }

    /// Clears the pair after a successful call. Entries for other models
    /// on the same account age out by time only.
    pub fn clear(&self, identity: &CredentialIdentity, model: &str) {
        self.entries
            .lock()
            .expect("ledger mutex poisoned")
            .remove(&(identity.clone(), model.to_string()));
    }

    /// Preview aliases for a base model, in fallback order.
    pub fn preview_candidates(model: &str) -> &'static [&'static str] {
        PREVIEW_MODELS.get(model).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Provider;

    fn identity(email: &str) -> CredentialIdentity {
        CredentialIdentity {
            provider: Provider::GeminiOauth,
            email: email.to_string(),
            project_id: "p".to_string(),
        }
    }

    #[test]
    fn unmarked_pair_is_not_exhausted() {
        let ledger = QuotaLedger::new();
        assert!(!ledger.is_exhausted(&identity("a"), "gemini-2.5-pro"));
    }

    #[test]
    fn mark_blocks_within_window_only() {
        let ledger = QuotaLedger::new();
        let id = identity("a");
        ledger.mark(&id, "gemini-2.5-pro");

        assert!(ledger.is_exhausted(&id, "gemini-2.5-pro"));
        assert!(!ledger.is_exhausted(&id, "gemini-2.5-flash"));

        // A mark older than the window clears on read, regardless of how
        // many reads happened in between.
        ledger.mark_at(&id, "gemini-2.5-pro", Utc::now() - Duration::minutes(31));
        assert!(!ledger.is_exhausted(&id, "gemini-2.5-pro"));
    }

    #[test]
    fn boundary_is_inclusive_inside_the_window() {
        let ledger = QuotaLedger::new();
        let id = identity("a");
        let now = Utc::now();
        ledger.mark_at(&id, "gemini-2.5-pro", now - Duration::minutes(29));
        assert!(ledger.is_exhausted_at(&id, "gemini-2.5-pro", now));
    }

    #[test]
    fn clear_removes_only_the_pair() {
        let ledger = QuotaLedger::new();
        let id = identity("a");
        ledger.mark(&id, "gemini-2.5-pro");
        ledger.mark(&id, "gemini-2.5-flash");

        ledger.clear(&id, "gemini-2.5-pro");
        assert!(!ledger.is_exhausted(&id, "gemini-2.5-pro"));
        assert!(ledger.is_exhausted(&id, "gemini-2.5-flash"));
    }

    #[test]
    fn identities_are_independent() {
        let ledger = QuotaLedger::new();
        ledger.mark(&identity("a"), "gemini-2.5-pro");
        assert!(!ledger.is_exhausted(&identity("b"), "gemini-2.5-pro"));
    }

    #[test]
    fn preview_table_covers_both_families() {
        assert_eq!(
            QuotaLedger::preview_candidates("gemini-2.5-pro"),
            [
                "gemini-2.5-pro-preview-05-06",
                "gemini-2.5-pro-preview-06-05"
            ]
        );
        assert_eq!(
            QuotaLedger::preview_candidates("gemini-2.5-flash"),
            [
                "gemini-2.5-flash-preview-04-17",
                "gemini-2.5-flash-preview-05-20"
            ]
        );
        assert!(QuotaLedger::preview_candidates("gpt-5").is_empty());
    }
}
