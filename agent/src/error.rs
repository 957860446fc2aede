use rotary_config::ValidationReport;
use rotary_db::storage::StoreError;
use thiserror::Error;

use crate::{engines::EngineError, pool::PoolError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(ValidationReport),

    #[error("Engine initialization failed: {0}")]
    EngineInitFailed(#[source] EngineError),

    #[error("Failed to apply identity {identity_id}: {source}")]
    IdentityApplyFailed {
        identity_id: u32,
        #[source]
        source: EngineError,
    },

    #[error("No activation handle for identity {identity_id}: {source}")]
    HandleUnavailable {
        identity_id: u32,
        #[source]
        source: PoolError,
    },

    #[error("Activation for identity {identity_id} returned status {status}: {message}")]
    ActivationFailed {
        identity_id: u32,
        status: i32,
        message: String,
    },

    #[error("Engine call failed for identity {identity_id}: {source}")]
    EngineCall {
        identity_id: u32,
        #[source]
        source: EngineError,
    },

    #[error("Failed to persist {what}: {source}")]
    PersistenceFailed {
        what: &'static str,
        #[source]
        source: StoreError,
    },
}

impl SchedulerError {
    /// Short, stable name for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::ConfigInvalid(_) => "config_invalid",
            SchedulerError::EngineInitFailed(_) => "engine_init_failed",
            SchedulerError::IdentityApplyFailed { .. } => "identity_apply_failed",
            SchedulerError::HandleUnavailable { .. } => "handle_unavailable",
            SchedulerError::ActivationFailed { .. } => "activation_failed",
            SchedulerError::EngineCall { .. } => "engine_call_failed",
            SchedulerError::PersistenceFailed { .. } => "persistence_failed",
        }
    }

    /// Whether this error stops the scheduler rather than skipping one
    /// identity.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::ConfigInvalid(_) | SchedulerError::EngineInitFailed(_)
        )
    }
}
