use std::sync::Arc;

use rotary_config::AgentConfig;
use rotary_db::storage::{IdentityCatalog, ProgressLedger, StoreError};

/// Everything the scheduler reads and writes besides the native engines.
#[derive(Debug, Clone)]
pub struct SchedulerContext {
    pub config: AgentConfig,
    pub catalog: Arc<IdentityCatalog>,
    pub ledger: Arc<ProgressLedger>,
}

impl SchedulerContext {
    pub fn new(
        config: AgentConfig,
        catalog: Arc<IdentityCatalog>,
        ledger: Arc<ProgressLedger>,
    ) -> Self {
        Self {
            config,
            catalog,
            ledger,
        }
    }

    /// Open the catalog and ledger under the configured data directory.
    pub fn open(config: AgentConfig) -> Result<Self, StoreError> {
        let catalog = IdentityCatalog::open(config.catalog_path())?;
        let ledger = ProgressLedger::open(config.ledger_path())?;
        Ok(Self::new(config, Arc::new(catalog), Arc::new(ledger)))
    }
}
