//! Whole-file snapshot writes.
//!
//! [`Durability::Atomic`] writes `<path>.tmp`, fsyncs it, then renames it over
//! `<path>`; a crash at any point leaves either the old or the new snapshot.
//! [`Durability::Direct`] truncates and rewrites `<path>` in place and is NOT
//! crash-safe: an interrupted write can leave a truncated file behind.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    #[default]
    Atomic,
    Direct,
}

/// Sibling temp path used by atomic writes (`store.json` -> `store.json.tmp`).
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("snapshot"));
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn write_snapshot(path: &Path, bytes: &[u8], durability: Durability) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| StoreError::Io(format!("create dir {}: {e}", parent.display())))?;
    }
    match durability {
        Durability::Atomic => write_atomic(path, bytes),
        Durability::Direct => fs::write(path, bytes)
            .map_err(|e| StoreError::Io(format!("write {}: {e}", path.display()))),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    let io_err = |op: &str, p: &Path, e: std::io::Error| {
        StoreError::Io(format!("{op} {}: {e}", p.display()))
    };

    let mut file = File::create(&tmp).map_err(|e| io_err("create", &tmp, e))?;
    file.write_all(bytes).map_err(|e| io_err("write", &tmp, e))?;
    file.sync_all().map_err(|e| io_err("sync", &tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| io_err("rename", &tmp, e))
}

/// Read a snapshot file, returning `None` when it does not exist.
pub fn read_snapshot(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(format!("read {}: {e}", path.display()))),
    }
}
