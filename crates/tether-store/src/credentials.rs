//! Per-session credential storage boundary.
//!
//! The protocol client owns the credential format; this layer only persists
//! the opaque JSON it hands over and purges it on logout.

use std::fs;
use std::path::PathBuf;

use tether_core::SessionId;
use tracing::debug;

use crate::error::StoreError;
use crate::snapshot::{self, Durability};

pub trait CredentialStore: Send + Sync {
    fn save(&self, id: &SessionId, creds: &serde_json::Value) -> Result<(), StoreError>;
    fn load(&self, id: &SessionId) -> Result<Option<serde_json::Value>, StoreError>;
    /// Remove everything stored for `id`. Returns whether anything existed.
    fn delete(&self, id: &SessionId) -> Result<bool, StoreError>;
}

/// Stores credentials at `<root>/<id>/creds.json`.
#[derive(Clone, Debug)]
pub struct FsCredentialStore {
    root: PathBuf,
}

impl FsCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one session's credential files.
    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn creds_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("creds.json")
    }
}

impl CredentialStore for FsCredentialStore {
    fn save(&self, id: &SessionId, creds: &serde_json::Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(creds)?;
        snapshot::write_snapshot(&self.creds_path(id), &bytes, Durability::Atomic)?;
        debug!(session_id = %id, "credentials saved");
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.creds_path(id);
        match snapshot::read_snapshot(&path)? {
            Some(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let dir = self.session_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(session_id = %id, "credentials deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(format!("remove {}: {e}", dir.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sid(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    #[test]
    fn save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCredentialStore::new(dir.path());
        let id = sid("4900001");
        let creds = json!({"noiseKey": "abc", "registrationId": 42});

        store.save(&id, &creds).unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(creds));
        assert!(store.delete(&id).unwrap());
        assert_eq!(store.load(&id).unwrap(), None);
        assert!(!store.session_dir(&id).exists());
    }

    #[test]
    fn delete_missing_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCredentialStore::new(dir.path());
        assert!(!store.delete(&sid("nobody")).unwrap());
    }

    #[test]
    fn sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCredentialStore::new(dir.path());
        store.save(&sid("a"), &json!(1)).unwrap();
        store.save(&sid("b"), &json!(2)).unwrap();
        store.delete(&sid("a")).unwrap();
        assert_eq!(store.load(&sid("b")).unwrap(), Some(json!(2)));
    }
}
