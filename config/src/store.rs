use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use toml::{Table, Value};
use tracing::{debug, warn};

use crate::{
    config::AgentConfig,
    validate::{ValidationReport, Violation, is_known_key, validate},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write config file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to build config snapshot: {0}")]
    Snapshot(#[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(ValidationReport),

    #[error("Rejected change: {0}")]
    Rejected(Violation),
}

/// Owner of the agent's TOML configuration file.
///
/// Holds the merged mapping (file values over defaults), the typed snapshot
/// derived from it and the validation report of the last load or change.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    table: Table,
    config: AgentConfig,
    report: ValidationReport,
}

impl ConfigStore {
    /// Load `path`, merge it over the defaults and validate the result.
    ///
    /// Only I/O and syntax errors fail here. Validation problems land in
    /// [`ConfigStore::report`] and the caller decides whether to go on. A
    /// missing file is treated as an empty one.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();

        let on_disk = match fs::read_to_string(&path) {
            Ok(raw) => raw.parse::<Table>().map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, using defaults");
                Table::new()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        Self::from_table(path, on_disk)
    }

    /// Build a store from an already-parsed mapping.
    pub fn from_table(path: impl Into<PathBuf>, on_disk: Table) -> Result<Self, ConfigError> {
        for key in on_disk.keys().filter(|k| !is_known_key(k)) {
            warn!(key = %key, "ignoring unknown config option");
        }

        let mut table = defaults()?;
        table.extend(on_disk);

        let (config, report) = typed(&table)?;
        Ok(Self {
            path: path.into(),
            table,
            config,
            report,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// A copy of the current configuration for another component to keep.
    pub fn snapshot(&self) -> AgentConfig {
        self.config.clone()
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Change one option and persist the whole mapping.
    ///
    /// A value that would introduce a violation for `key` is rejected and
    /// nothing changes. If the write fails the previous mapping is restored.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut candidate = self.table.clone();
        candidate.insert(key.to_string(), value);

        let (config, report) = typed(&candidate)?;
        if let Some(violation) = report.for_key(key).next() {
            return Err(ConfigError::Rejected(violation.clone()));
        }

        let next = Self {
            path: self.path.clone(),
            table: candidate,
            config,
            report,
        };
        let previous = std::mem::replace(self, next);

        if let Err(e) = self.save() {
            *self = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Write the full mapping to disk atomically: either the new file is in
    /// place or the old one is untouched.
    pub fn save(&self) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        let rendered = toml::to_string_pretty(&self.table)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, rendered).map_err(write_err)?;
        fs::rename(&temp_path, &self.path).map_err(|source| {
            let _ = fs::remove_file(&temp_path);
            write_err(source)
        })
    }
}

fn defaults() -> Result<Table, ConfigError> {
    match Value::try_from(AgentConfig::default())? {
        Value::Table(table) => Ok(table),
        _ => Ok(Table::new()),
    }
}

/// Validate `table` and derive the typed snapshot. Options that fail
/// validation fall back to their defaults in the snapshot.
fn typed(table: &Table) -> Result<(AgentConfig, ValidationReport), ConfigError> {
    let report = validate(table);
    let defaults = defaults()?;

    let mut sanitized = table.clone();
    for violation in report.violations.iter() {
        match defaults.get(violation.key()) {
            Some(default) => sanitized.insert(violation.key().to_string(), default.clone()),
            None => sanitized.remove(violation.key()),
        };
    }

    let config = Value::Table(sanitized)
        .try_into::<AgentConfig>()
        .map_err(ConfigError::Snapshot)?;

    Ok((config, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("agent.toml");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "license_code = \"LIC\"\nidentity_count = 9\n");

        let store = ConfigStore::load(&path).unwrap();
        assert!(store.report().is_valid());

        let config = store.config();
        assert_eq!(config.identity_count, 9);
        assert_eq!(config.interval_minutes, 120);
        assert_eq!(config.max_activations_per_code, 2);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.license_code, "LIC");
    }

    #[test]
    fn test_missing_file_reports_missing_license() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("absent.toml")).unwrap();

        assert_eq!(
            store.report().violations,
            vec![Violation::Missing { key: "license_code" }]
        );
        assert_eq!(store.config(), &AgentConfig::default());
    }

    #[test]
    fn test_invalid_values_fall_back_in_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "license_code = \"LIC\"\nidentity_count = 150\ninterval_minutes = \"soon\"\n",
        );

        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.report().len(), 2);
        assert_eq!(store.config().identity_count, 5);
        assert_eq!(store.config().interval_minutes, 120);

        let err = store.report().clone().into_result().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref r) if r.len() == 2));
    }

    #[test]
    fn test_syntax_error_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "license_code = \n");

        assert!(matches!(
            ConfigStore::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_unknown_keys_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "license_code = \"LIC\"\nauto_start = true\n");

        let store = ConfigStore::load(&path).unwrap();
        assert!(store.report().is_valid());
        assert_eq!(store.table().get("auto_start"), Some(&Value::Boolean(true)));
    }

    #[test]
    fn test_set_persists_whole_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "license_code = \"LIC\"\n");

        let mut store = ConfigStore::load(&path).unwrap();
        store.set("interval_minutes", Value::Integer(30)).unwrap();
        assert_eq!(store.config().interval_minutes, 30);

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.config().interval_minutes, 30);
        assert_eq!(reloaded.config().license_code, "LIC");
        assert_eq!(reloaded.table(), store.table());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_set_rejects_violation_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "license_code = \"LIC\"\n");
        let before = fs::read_to_string(&path).unwrap();

        let mut store = ConfigStore::load(&path).unwrap();
        let err = store.set("identity_count", Value::Integer(0)).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Rejected(Violation::OutOfRange {
                key: "identity_count",
                ..
            })
        ));
        assert_eq!(store.config().identity_count, 5);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_failed_save_restores_previous_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        let mut store = ConfigStore::load(blocker.join("agent.toml")).unwrap();
        fs::write(&blocker, b"").unwrap();

        let err = store.set("license_code", Value::String("LIC".into())).unwrap_err();
        assert!(matches!(err, ConfigError::Write { .. }));
        assert_eq!(store.config().license_code, "");
        assert_eq!(store.report().len(), 1);
    }
}
