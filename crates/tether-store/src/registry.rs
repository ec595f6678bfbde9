//! Durable list of registered session ids (a JSON array of strings).
//!
//! The list is advisory: sessions can always be re-registered, so a damaged
//! file is reported and treated as empty rather than failing startup.

use std::path::{Path, PathBuf};

use tether_core::SessionId;
use tracing::warn;

use crate::error::StoreError;
use crate::snapshot::{self, Durability};

#[derive(Clone, Debug)]
pub struct RegistryFile {
    path: PathBuf,
}

impl RegistryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the id list. Missing or malformed files yield an empty list.
    pub fn load(&self) -> Vec<SessionId> {
        let content = match snapshot::read_snapshot(&self.path) {
            Ok(Some(content)) => content,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "session registry unreadable");
                return Vec::new();
            }
        };

        let raw: Vec<String> = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "session registry malformed, ignoring");
                return Vec::new();
            }
        };

        let mut ids: Vec<SessionId> = Vec::with_capacity(raw.len());
        for entry in raw {
            match SessionId::parse(entry.as_str()) {
                Ok(id) if !ids.contains(&id) => ids.push(id),
                Ok(_) => {}
                Err(e) => warn!(id = %entry, error = %e, "skipping invalid registered id"),
            }
        }
        ids
    }

    pub fn save(&self, ids: &[SessionId]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(ids)?;
        snapshot::write_snapshot(&self.path, &bytes, Durability::Atomic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<SessionId> {
        raw.iter().map(|s| SessionId::parse(*s).unwrap()).collect()
    }

    #[test]
    fn save_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = RegistryFile::new(dir.path().join("sessions.json"));
        let list = ids(&["300", "100", "200"]);
        file.save(&list).unwrap();
        assert_eq!(file.load(), list);
    }

    #[test]
    fn saved_as_plain_string_array() {
        let dir = tempfile::tempdir().unwrap();
        let file = RegistryFile::new(dir.path().join("sessions.json"));
        file.save(&ids(&["1", "2"])).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!(["1", "2"]));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RegistryFile::new(dir.path().join("none.json")).load().is_empty());
    }

    #[test]
    fn malformed_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{\"not\": \"a list\"}").unwrap();
        assert!(RegistryFile::new(path).load().is_empty());
    }

    #[test]
    fn invalid_and_duplicate_ids_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, r#"["1", "../x", "1", "2"]"#).unwrap();
        assert_eq!(RegistryFile::new(path).load(), ids(&["1", "2"]));
    }
}
