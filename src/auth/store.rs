use super::{Credential, CredentialRecord};
use crate::error::CastorError;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use std::{fs, io};
use tracing::{debug, info, warn};

/// Immutable view of the live credentials. Replaced atomically on reload;
/// in-flight requests keep the reference they already resolved.
pub type Snapshot = Arc<Vec<Arc<Credential>>>;

type Observer = Box<dyn Fn(Snapshot) + Send + Sync>;

const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Directory-backed credential store. Static-key records synthesized from
/// configuration live only in memory and survive every rescan.
pub struct CredentialStore {
    dir: PathBuf,
    static_creds: Vec<Arc<Credential>>,
    snapshot: RwLock<Snapshot>,
    observers: Mutex<Vec<Observer>>,
}

impl CredentialStore {
    /// Creates the auth directory (owner-only) if missing and loads the
    /// initial snapshot. Directory inaccessibility is fatal here; at
    /// runtime rescans it is only logged.
    pub fn bootstrap(dir: &Path, static_keys: &[String]) -> Result<Arc<Self>, CastorError> {
        create_private_dir(dir)?;

        let static_creds: Vec<Arc<Credential>> = static_keys
            .iter()
            .map(|key| Arc::new(Credential::new(CredentialRecord::from_static_key(key))))
            .collect();

        let store = Arc::new(CredentialStore {
            dir: dir.to_path_buf(),
            static_creds,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            observers: Mutex::new(Vec::new()),
        });

        let records = store.scan_dir()?;
        store.install(records);

        let snapshot = store.snapshot();
        info!(
            path = %dir.display(),
            file_credentials = snapshot.len() - store.static_creds.len(),
            static_credentials = store.static_creds.len(),
            "credential store loaded"
        );
        Ok(store)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().expect("store lock poisoned").clone()
    }

    /// Registers an observer called synchronously on the watcher task for
    /// every snapshot replacement. Observers must not block.
    pub fn subscribe(&self, observer: impl Fn(Snapshot) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push(Box::new(observer));
    }

    /// Re-scans the directory and replaces the snapshot if and only if the
    /// set of (identity, token-fingerprint) pairs changed. Returns whether
    /// a new snapshot was emitted.
    pub fn rescan(&self) -> bool {
        let records = match self.scan_dir() {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %self.dir.display(), error = %e, "credential rescan failed; keeping prior snapshot");
                return false;
            }
        };

        if fingerprint_set(records.iter()) == self.current_fingerprints() {
            return false;
        }

        self.install(records);
        let snapshot = self.snapshot();
        info!(credentials = snapshot.len(), "credential snapshot reloaded");
        for observer in self.observers.lock().expect("observer lock poisoned").iter() {
            observer(snapshot.clone());
        }
        true
    }

    /// Periodic rescan task. Filesystem event APIs are advisory at best,
    /// so the watcher always re-reads the whole directory.
    pub fn spawn_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RESCAN_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                store.rescan();
            }
        })
    }

    /// Writes the canonical JSON form back to `<email>-<project>.json`
    /// with owner-only permissions.
    pub fn persist(&self, record: &CredentialRecord) -> Result<(), CastorError> {
        create_private_dir(&self.dir)?;
        let path = self.dir.join(format!("{}.json", record.file_stem()));
        let body = serde_json::to_string_pretty(record)
            .map_err(|e| CastorError::Config(format!("credential serialize failed: {e}")))?;
        fs::write(&path, body)?;
        set_private_file(&path)?;
        debug!(path = %path.display(), "credential persisted");
        Ok(())
    }

    fn current_fingerprints(&self) -> BTreeSet<(String, u64)> {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .filter(|c| c.snapshot().api_key.is_none())
            .map(|c| {
                let record = c.snapshot();
                (record.identity().to_string(), record.token_fingerprint())
            })
            .collect()
    }

    /// Replaces the snapshot, reusing the existing handle for every record
    /// whose identity and token material are unchanged so runtime flags
    /// (a refresh-failure `auto` flip) survive unrelated file events.
    fn install(&self, records: Vec<CredentialRecord>) {
        let previous = self.snapshot();
        let mut existing: HashMap<(String, u64), Arc<Credential>> = previous
            .iter()
            .map(|c| {
                let record = c.snapshot();
                (
                    (record.identity().to_string(), record.token_fingerprint()),
                    Arc::clone(c),
                )
            })
            .collect();

        let mut next: Vec<Arc<Credential>> = records
            .into_iter()
            .map(|record| {
                let key = (record.identity().to_string(), record.token_fingerprint());
                existing
                    .remove(&key)
                    .unwrap_or_else(|| Arc::new(Credential::new(record)))
            })
            .collect();
        next.extend(self.static_creds.iter().cloned());

        *self.snapshot.write().expect("store lock poisoned") = Arc::new(next);
    }

    /// Enumerates `*.json` files under the auth directory. Malformed files
    /// are logged and skipped, never fatal.
    fn scan_dir(&self) -> io::Result<Vec<CredentialRecord>> {
        let mut records = Vec::new();
        let mut seen = BTreeSet::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = match entry {
                Ok(e) => e.path(),
                Err(e) => {
                    warn!(error = %e, "failed to read credentials dir entry");
                    continue;
                }
            };
            if !is_json_file(&path) {
                continue;
            }
            let contents = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read credential file");
                    continue;
                }
            };
            let record: CredentialRecord = match serde_json::from_str(&contents) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid credential JSON; skipping");
                    continue;
                }
            };
            // (provider, email, project) is unique within the store.
            if !seen.insert(record.identity().to_string()) {
                warn!(path = %path.display(), identity = %record.identity(), "duplicate credential identity; skipping");
                continue;
            }
            records.push(record);
        }

        records.sort_by_key(|r| r.file_stem());
        Ok(records)
    }
}

fn fingerprint_set<'a>(
    records: impl Iterator<Item = &'a CredentialRecord>,
) -> BTreeSet<(String, u64)> {
    records
        .map(|r| (r.identity().to_string(), r.token_fingerprint()))
        .collect()
}

fn is_json_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        == Some(true)
}

fn create_private_dir(dir: &Path) -> Result<(), CastorError> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn set_private_file(path: &Path) -> Result<(), CastorError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Provider;
    use serde_json::json;

    fn write_credential(dir: &Path, email: &str, project: &str, token: &str) {
        let body = json!({
            "email": email,
            "project_id": project,
            "access_token": token,
            "refresh_token": "rt",
            "token_expiry": "2030-01-01T00:00:00Z",
            "auto": true,
            "checked": false
        });
        fs::write(
            dir.join(format!("{email}-{project}.json")),
            serde_json::to_string(&body).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn bootstrap_loads_files_and_static_keys() {
        let dir = tempfile::tempdir().unwrap();
        write_credential(dir.path(), "a@example.com", "p1", "t1");
        write_credential(dir.path(), "b@example.com", "p2", "t2");

        let store =
            CredentialStore::bootstrap(dir.path(), &["sk-static".to_string()]).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot
                .iter()
                .filter(|c| c.provider() == Provider::GlApikey)
                .count(),
            1
        );
    }

    #[test]
    fn malformed_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_credential(dir.path(), "a@example.com", "p1", "t1");
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let store = CredentialStore::bootstrap(dir.path(), &[]).unwrap();
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn rescan_emits_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        write_credential(dir.path(), "a@example.com", "p1", "t1");

        let store = CredentialStore::bootstrap(dir.path(), &[]).unwrap();
        assert!(!store.rescan(), "unchanged directory must not emit");

        write_credential(dir.path(), "b@example.com", "p2", "t2");
        assert!(store.rescan(), "new file must emit a snapshot");
        assert_eq!(store.snapshot().len(), 2);

        fs::remove_file(dir.path().join("b@example.com-p2.json")).unwrap();
        assert!(store.rescan(), "deleted file must emit a snapshot");
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn rescan_reuses_unchanged_handles() {
        let dir = tempfile::tempdir().unwrap();
        write_credential(dir.path(), "a@example.com", "p1", "t1");

        let store = CredentialStore::bootstrap(dir.path(), &[]).unwrap();
        let before = Arc::clone(&store.snapshot()[0]);

        write_credential(dir.path(), "b@example.com", "p2", "t2");
        store.rescan();

        let snapshot = store.snapshot();
        let reused = snapshot
            .iter()
            .find(|c| c.identity().email == "a@example.com")
            .unwrap();
        assert!(Arc::ptr_eq(&before, reused));
    }

    #[test]
    fn observers_see_new_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::bootstrap(dir.path(), &[]).unwrap();

        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = Arc::clone(&seen);
        store.subscribe(move |snapshot| {
            *seen_clone.lock().unwrap() = snapshot.len();
        });

        write_credential(dir.path(), "a@example.com", "p1", "t1");
        store.rescan();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn persist_round_trips_through_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::bootstrap(dir.path(), &[]).unwrap();

        let record: CredentialRecord = serde_json::from_value(json!({
            "email": "c@example.com",
            "project_id": "p9",
            "access_token": "at",
            "refresh_token": "rt",
            "token_expiry": "2030-01-01T00:00:00Z"
        }))
        .unwrap();
        store.persist(&record).unwrap();

        assert!(dir.path().join("c@example.com-p9.json").is_file());
        assert!(store.rescan());
        assert_eq!(store.snapshot()[0].identity().email, "c@example.com");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("c@example.com-p9.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
