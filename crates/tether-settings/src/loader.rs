//! Settings file loading and `TETHER_*` overrides.
//!
//! The user file is merged over the compiled defaults key by key: nested
//! objects merge, anything else replaces, and `null` keeps the default.
//! Overrides from the environment are applied last, then the result is
//! validated as a whole.

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::TetherSettings;

/// `~/.tether`, falling back to `/tmp/.tether` when HOME is unset.
pub fn tether_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether")
}

/// `~/.tether/settings.json`.
pub fn settings_path() -> PathBuf {
    tether_home().join("settings.json")
}

pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load `path` over the defaults and apply environment overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let mut merged = serde_json::to_value(TetherSettings::default())?;
    match read_user_file(path)? {
        Some(user) => {
            debug!(path = %path.display(), "merging user settings");
            merge_into(&mut merged, user);
        }
        None => debug!(path = %path.display(), "no settings file, using defaults"),
    }

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn read_user_file(path: &Path) -> Result<Option<Value>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Merge `overlay` into `base` in place.
pub fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None if value.is_null() => {}
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `TETHER_*` overrides read through `lookup`. Values that do not
/// parse or fall outside their range are logged and ignored.
pub fn apply_overrides(settings: &mut TetherSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = Overrides { lookup };

    env.text("TETHER_HOST", &mut settings.server.host);
    env.number("TETHER_PORT", 1..=u16::MAX, &mut settings.server.port);

    let sessions = &mut settings.sessions;
    env.number("TETHER_CONCURRENCY", 1..=1_000, &mut sessions.concurrency);
    env.number("TETHER_SETTLE_DELAY_MS", 0..=600_000, &mut sessions.settle_delay_ms);
    env.number("TETHER_BACKOFF_BASE_MS", 1..=3_600_000, &mut sessions.backoff_base_ms);
    env.number("TETHER_BACKOFF_MAX_MS", 1..=86_400_000, &mut sessions.backoff_max_ms);
    if let Some(ms) = env.parsed("TETHER_START_TIMEOUT_MS", 100..=3_600_000) {
        sessions.start_timeout_ms = Some(ms);
    }
    env.text("TETHER_REGISTRY_PATH", &mut sessions.registry_path);
    env.text("TETHER_CREDENTIALS_DIR", &mut sessions.credentials_dir);

    env.text("TETHER_STORE_PATH", &mut settings.store.path);
    env.flag("TETHER_LOG_JSON", &mut settings.logging.json);
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn text(&self, name: &str, slot: &mut String) {
        if let Some(value) = self.raw(name) {
            debug!(key = name, "settings override");
            *slot = value;
        }
    }

    fn parsed<T>(&self, name: &str, range: RangeInclusive<T>) -> Option<T>
    where
        T: FromStr + PartialOrd + Display,
    {
        let raw = self.raw(name)?;
        let value = parse_in_range(&raw, &range);
        if value.is_none() {
            warn!(
                key = name,
                value = %raw,
                min = %range.start(),
                max = %range.end(),
                "ignoring invalid settings override"
            );
        }
        value
    }

    fn number<T>(&self, name: &str, range: RangeInclusive<T>, slot: &mut T)
    where
        T: FromStr + PartialOrd + Display,
    {
        if let Some(value) = self.parsed(name, range) {
            debug!(key = name, "settings override");
            *slot = value;
        }
    }

    fn flag(&self, name: &str, slot: &mut bool) {
        let Some(raw) = self.raw(name) else {
            return;
        };
        match parse_bool(&raw) {
            Some(value) => *slot = value,
            None => warn!(key = name, value = %raw, "ignoring invalid boolean override"),
        }
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_in_range<T: FromStr + PartialOrd>(val: &str, range: &RangeInclusive<T>) -> Option<T> {
    val.trim().parse().ok().filter(|n| range.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::errors::SettingsError;
    use serde_json::json;

    fn overrides(pairs: &[(&str, &str)]) -> TetherSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut settings = TetherSettings::default();
        apply_overrides(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    #[test]
    fn merge_keeps_sibling_defaults() {
        let mut base = json!({"server": {"port": 8088, "host": "127.0.0.1"}});
        merge_into(&mut base, json!({"server": {"port": 9090}}));
        assert_eq!(base, json!({"server": {"port": 9090, "host": "127.0.0.1"}}));
    }

    #[test]
    fn merge_replaces_non_objects() {
        let mut base = json!({"sessions": {"startTimeoutMs": null}, "tags": [1, 2]});
        merge_into(&mut base, json!({"sessions": {"startTimeoutMs": 5000}, "tags": [3]}));
        assert_eq!(base["sessions"]["startTimeoutMs"], 5000);
        assert_eq!(base["tags"], json!([3]));
    }

    #[test]
    fn merge_null_keeps_default() {
        let mut base = json!({"store": {"debounceMs": 500}});
        merge_into(&mut base, json!({"store": {"debounceMs": null, "extra": null}}));
        assert_eq!(base, json!({"store": {"debounceMs": 500}}));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.store.max_owners, 1_000);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"store": {"debounceMs": 50, "durability": "direct"}, "logging": {"json": false}}"#,
        )
        .unwrap();
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.store.debounce_ms, 50);
        assert_eq!(settings.store.durability, crate::types::Durability::Direct);
        assert_eq!(settings.store.max_keys_per_owner, 200);
        assert!(!settings.logging.json);
    }

    #[test]
    fn malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_limits_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"store": {"maxOwners": 0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn overrides_apply_session_tuning() {
        let settings = overrides(&[
            ("TETHER_PORT", "9001"),
            ("TETHER_CONCURRENCY", "8"),
            ("TETHER_BACKOFF_BASE_MS", "250"),
            ("TETHER_START_TIMEOUT_MS", "30000"),
            ("TETHER_STORE_PATH", "/var/lib/tether/store.json"),
            ("TETHER_LOG_JSON", "off"),
        ]);
        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.sessions.concurrency, 8);
        assert_eq!(settings.sessions.backoff_base_ms, 250);
        assert_eq!(settings.sessions.start_timeout_ms, Some(30_000));
        assert_eq!(settings.store.path, "/var/lib/tether/store.json");
        assert!(!settings.logging.json);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let defaults = TetherSettings::default();
        let settings = overrides(&[
            ("TETHER_PORT", "0"),
            ("TETHER_CONCURRENCY", "many"),
            ("TETHER_START_TIMEOUT_MS", "5"),
            ("TETHER_HOST", "   "),
            ("TETHER_LOG_JSON", "maybe"),
        ]);
        assert_eq!(settings.server.port, defaults.server.port);
        assert_eq!(settings.server.host, defaults.server.host);
        assert_eq!(settings.sessions.concurrency, defaults.sessions.concurrency);
        assert!(settings.sessions.start_timeout_ms.is_none());
        assert_eq!(settings.logging.json, defaults.logging.json);
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool(" YES "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_in_range("8088", &(1..=u16::MAX)), Some(8088u16));
        assert_eq!(parse_in_range("70000", &(1..=u16::MAX)), None);
        assert_eq!(parse_in_range::<u64>("abc", &(0..=10)), None);
    }
}
