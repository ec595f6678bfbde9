use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document (`~/.tether/settings.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    pub server: ServerSettings,
    pub sessions: SessionSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.sessions.concurrency == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.concurrency must be at least 1".into(),
            ));
        }
        if self.sessions.backoff_base_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.backoffBaseMs must be positive".into(),
            ));
        }
        if self.sessions.backoff_max_ms < self.sessions.backoff_base_ms {
            return Err(SettingsError::InvalidValue(
                "sessions.backoffMaxMs must not be below backoffBaseMs".into(),
            ));
        }
        if self.store.max_owners == 0 || self.store.max_keys_per_owner == 0 {
            return Err(SettingsError::InvalidValue(
                "store limits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

/// Session manager tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Maximum simultaneous session starts.
    pub concurrency: usize,
    /// Pause after each start before its slot is released.
    pub settle_delay_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound on a single connection-factory call. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timeout_ms: Option<u64>,
    /// Registered session id list (relative to `~/.tether`).
    pub registry_path: String,
    /// Per-session credential directories (relative to `~/.tether`).
    pub credentials_dir: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            settle_delay_ms: 1_000,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            start_timeout_ms: None,
            registry_path: "sessions.json".to_string(),
            credentials_dir: "auth".to_string(),
        }
    }
}

/// How snapshots reach disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    #[default]
    Atomic,
    Direct,
}

/// Whether store reads share the stored value or hand out a deep copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPolicy {
    Shared,
    #[default]
    Copy,
}

/// Keyed store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Snapshot file (relative to `~/.tether`).
    pub path: String,
    pub max_owners: usize,
    pub max_keys_per_owner: usize,
    pub debounce_ms: u64,
    pub durability: Durability,
    pub read_policy: ReadPolicy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "store.json".to_string(),
            max_owners: 1_000,
            max_keys_per_owner: 200,
            debounce_ms: 500,
            durability: Durability::Atomic,
            read_policy: ReadPolicy::Copy,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// Resolve a settings path: absolute paths are kept, relative ones join `base`.
pub fn resolve_path(base: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(TetherSettings::default()).unwrap();
        assert_eq!(json["sessions"]["settleDelayMs"], 1_000);
        assert_eq!(json["store"]["maxKeysPerOwner"], 200);
        assert_eq!(json["store"]["durability"], "atomic");
        assert_eq!(json["store"]["readPolicy"], "copy");
    }

    #[test]
    fn partial_document_fills_defaults() {
        let settings: TetherSettings =
            serde_json::from_str(r#"{"sessions": {"concurrency": 8}}"#).unwrap();
        assert_eq!(settings.sessions.concurrency, 8);
        assert_eq!(settings.sessions.backoff_base_ms, 2_000);
        assert_eq!(settings.server.port, 8088);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut settings = TetherSettings::default();
        settings.sessions.concurrency = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_cap_below_base() {
        let mut settings = TetherSettings::default();
        settings.sessions.backoff_max_ms = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn resolve_relative_and_absolute() {
        let base = Path::new("/home/u/.tether");
        assert_eq!(resolve_path(base, "store.json"), base.join("store.json"));
        assert_eq!(resolve_path(base, "/var/lib/t.json"), PathBuf::from("/var/lib/t.json"));
    }
}
