//! Upstream account credentials: the on-disk record shape, the in-memory
//! handle with its refresh gate, and the directory-backed store.

mod record;
mod store;

pub use record::{Credential, CredentialIdentity, CredentialRecord, ModelFamily, Provider};
pub use store::{CredentialStore, Snapshot};
