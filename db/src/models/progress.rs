use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activation bookkeeping for one machine code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Successful activations recorded for this machine code. Never
    /// decremented.
    pub count: u32,

    /// The identity that most recently produced this machine code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<u32>,

    pub updated_at: DateTime<Utc>,
}

/// On-disk layout of the progress log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDocument {
    #[serde(default)]
    pub records: BTreeMap<String, ProgressEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl ProgressDocument {
    pub fn total_activations(&self) -> u64 {
        self.records.values().map(|entry| u64::from(entry.count)).sum()
    }
}
