use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Typed configuration snapshot.
///
/// Components never see the raw TOML mapping; they receive a clone of this
/// struct from [`crate::ConfigStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// How many identities to generate when the catalog is empty.
    pub identity_count: u32,

    /// Minutes to wait between activation cycles.
    pub interval_minutes: u32,

    /// Successful activations allowed per machine code.
    pub max_activations_per_code: u32,

    pub license_code: String,
    pub additional_code: String,

    /// Directory holding the identity catalog and the progress ledger.
    pub data_dir: PathBuf,

    /// Driver handed to the spoofing helper on init.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_path: Option<PathBuf>,

    /// Executable implementing the spoofing helper protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoofer_path: Option<PathBuf>,

    /// Executable implementing the activation helper protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activator_path: Option<PathBuf>,

    pub pool_size: usize,
    pub acquire_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,

    /// Count quota usage per process run instead of cumulatively from the
    /// ledger.
    pub reset_quota_on_start: bool,

    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity_count: 5,
            interval_minutes: 120,
            max_activations_per_code: 2,
            license_code: String::new(),
            additional_code: String::new(),
            data_dir: PathBuf::from("data"),
            driver_path: None,
            spoofer_path: None,
            activator_path: None,
            pool_size: 2,
            acquire_timeout_secs: 5,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            reset_quota_on_start: false,
            log_level: "info".into(),
        }
    }
}

impl AgentConfig {
    /// The path to the identity catalog (JSON).
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("identities.json")
    }

    /// The path to the per-machine-code progress ledger (JSON).
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("machine_codes.json")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}
