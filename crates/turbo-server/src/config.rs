//! Server settings.
//!
//! Loading order, later wins:
//! 1. compiled defaults
//! 2. `~/.turbo/settings.json` (or an explicit file), deep-merged
//! 3. `TURBO_*` environment variables
//!
//! CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::Level;
use turbo_telemetry::{turbo_home, TelemetryConfig};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Frames queued per session before it is disconnected.
    pub outbox_capacity: usize,
    pub heartbeat_interval_secs: u64,
    /// Sessions silent for longer than this are reaped.
    pub client_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            outbox_capacity: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            static_dir: None,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(SettingsError::InvalidValue(format!("unknown storage backend '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: turbo_home().join("turbo.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub metrics_enabled: bool,
    pub metrics_db_path: PathBuf,
    pub snapshot_interval_secs: u64,
    pub retention_days: u32,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        let defaults = TelemetryConfig::default();
        Self {
            level: "info".to_string(),
            json: defaults.json,
            log_to_sqlite: defaults.log_to_sqlite,
            log_db_path: defaults.log_db_path,
            metrics_enabled: defaults.metrics_enabled,
            metrics_db_path: defaults.metrics_db_path,
            snapshot_interval_secs: defaults.metrics_snapshot_interval_secs,
            retention_days: defaults.metrics_retention_days,
        }
    }
}

impl TelemetrySettings {
    pub fn to_config(&self) -> Result<TelemetryConfig> {
        let log_level: Level = self
            .level
            .parse()
            .map_err(|_| SettingsError::InvalidValue(format!("unknown log level '{}'", self.level)))?;
        Ok(TelemetryConfig {
            log_level,
            module_levels: Vec::new(),
            json: self.json,
            log_to_sqlite: self.log_to_sqlite,
            log_db_path: self.log_db_path.clone(),
            metrics_enabled: self.metrics_enabled,
            metrics_db_path: self.metrics_db_path.clone(),
            metrics_snapshot_interval_secs: self.snapshot_interval_secs,
            metrics_retention_days: self.retention_days,
        })
    }
}

/// `~/.turbo/settings.json`.
pub fn settings_path() -> PathBuf {
    turbo_home().join("settings.json")
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Defaults merged with `path` when it exists, then environment overrides.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        tracing::debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        tracing::debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Objects merge per key, everything else is replaced. Nulls in `source`
/// are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply `TURBO_*` overrides read through `lookup`. Invalid values are
/// ignored with a warning.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let invalid = |name: &str, value: &str| {
        tracing::warn!(key = name, value, "invalid env var, ignoring");
    };

    if let Some(v) = read("TURBO_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("TURBO_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => invalid("TURBO_PORT", &v),
        }
    }
    if let Some(v) = read("TURBO_OUTBOX_CAPACITY") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(capacity) => settings.server.outbox_capacity = capacity,
            None => invalid("TURBO_OUTBOX_CAPACITY", &v),
        }
    }
    if let Some(v) = read("TURBO_STORAGE") {
        match v.parse() {
            Ok(backend) => settings.storage.backend = backend,
            Err(_) => invalid("TURBO_STORAGE", &v),
        }
    }
    if let Some(v) = read("TURBO_DB_PATH") {
        settings.storage.path = PathBuf::from(v);
    }
    if let Some(v) = read("TURBO_LOG_LEVEL") {
        if v.parse::<Level>().is_ok() {
            settings.telemetry.level = v;
        } else {
            invalid("TURBO_LOG_LEVEL", &v);
        }
    }
    if let Some(v) = read("TURBO_LOG_JSON") {
        match parse_bool(&v) {
            Some(json) => settings.telemetry.json = json,
            None => invalid("TURBO_LOG_JSON", &v),
        }
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.port, 4000);
        assert_eq!(s.server.outbox_capacity, 256);
        assert_eq!(s.server.client_timeout(), Duration::from_secs(90));
        assert_eq!(s.storage.backend, StorageBackend::Sqlite);
        assert!(s.storage.path.ends_with("turbo.db"));
    }

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            json!({"server": {"port": 4000, "host": "0.0.0.0"}}),
            json!({"server": {"port": 9090}}),
        );
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(json!({"a": [1, 2]}), json!({"a": [3]}));
        assert_eq!(merged["a"], json!([3]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let s = load_settings_from_path(Path::new("/nonexistent/turbo/settings.json")).unwrap();
        assert_eq!(s.server.outbox_capacity, 256);
    }

    #[test]
    fn load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"outboxCapacity": 8}, "storage": {"backend": "memory"}}"#,
        )
        .unwrap();
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.server.outbox_capacity, 8);
        assert_eq!(s.server.heartbeat_interval_secs, 30);
        assert_eq!(s.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn load_invalid_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = Settings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("TURBO_HOST", "127.0.0.1"),
                ("TURBO_PORT", "5000"),
                ("TURBO_OUTBOX_CAPACITY", "16"),
                ("TURBO_STORAGE", "MEMORY"),
                ("TURBO_DB_PATH", "/tmp/x.db"),
                ("TURBO_LOG_LEVEL", "debug"),
                ("TURBO_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 5000);
        assert_eq!(s.server.outbox_capacity, 16);
        assert_eq!(s.storage.backend, StorageBackend::Memory);
        assert_eq!(s.storage.path, PathBuf::from("/tmp/x.db"));
        assert_eq!(s.telemetry.level, "debug");
        assert!(s.telemetry.json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut s = Settings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("TURBO_PORT", "0"),
                ("TURBO_OUTBOX_CAPACITY", "lots"),
                ("TURBO_STORAGE", "redis"),
                ("TURBO_LOG_LEVEL", "loud"),
                ("TURBO_LOG_JSON", "maybe"),
                ("TURBO_HOST", ""),
            ]),
        );
        let d = Settings::default();
        assert_eq!(s.server.port, d.server.port);
        assert_eq!(s.server.outbox_capacity, d.server.outbox_capacity);
        assert_eq!(s.storage.backend, d.storage.backend);
        assert_eq!(s.telemetry.level, d.telemetry.level);
        assert_eq!(s.server.host, d.server.host);
        assert!(!s.telemetry.json);
    }

    #[test]
    fn telemetry_settings_convert() {
        let mut t = TelemetrySettings::default();
        t.level = "warn".into();
        let config = t.to_config().unwrap();
        assert_eq!(config.log_level, Level::WARN);

        t.level = "shouting".into();
        assert!(matches!(t.to_config(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u16_range("80", 1, 65535), Some(80));
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_usize_range("5", 10, 20), None);
    }
}
