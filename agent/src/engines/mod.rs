//! Interfaces to the two native collaborators the scheduler drives.
//!
//! The scheduler only ever talks to these traits. [`helper`] bridges them to
//! external helper executables; tests plug in in-memory fakes.

use rotary_db::models::Identity;
use thiserror::Error;

pub mod helper;

/// Status the activation engine returns on success.
pub const ACTIVATION_SUCCESS: i32 = 1;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("{op} failed: {reason}")]
    Call { op: &'static str, reason: String },

    #[error("Engine protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn call(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Call {
            op,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::Io(_))
    }
}

/// Applies a hardware fingerprint to the running process.
///
/// The effect is process-global and is only undone by applying a different
/// identity.
pub trait SpoofingService: Send + Sync {
    /// One-time setup (load the driver). Called once before any other method.
    fn init(&self) -> Result<(), EngineError>;

    fn set_smbios(&self, identity: &Identity) -> Result<(), EngineError>;

    fn set_disk(&self, serial: &str, model: &str, revision: &str) -> Result<(), EngineError>;

    fn clean_disk_volume(&self, enabled: bool) -> Result<(), EngineError>;

    fn set_cpuid(&self, cpuid_0: &str, cpuid_1: &str) -> Result<(), EngineError>;

    fn randomize_mac(&self) -> Result<(), EngineError>;

    fn enable_vm_spoof(&self, enabled: bool) -> Result<(), EngineError>;

    fn cleanup(&self);

    /// Apply every part of `identity`'s fingerprint, stopping at the first
    /// failure.
    fn apply_identity(&self, identity: &Identity) -> Result<(), EngineError> {
        self.set_smbios(identity)?;
        self.set_disk(
            &identity.disk_serial,
            &identity.disk_model,
            &identity.disk_revision,
        )?;
        self.clean_disk_volume(true)?;
        self.set_cpuid(&identity.cpuid_0, &identity.cpuid_1)?;
        self.randomize_mac()?;
        self.enable_vm_spoof(true)
    }
}

/// Factory for activation engine instances.
pub trait ActivationService: Send + Sync {
    /// Load a new engine instance. The instance observes whatever identity is
    /// live at this moment.
    fn create_handle(&self) -> Result<Box<dyn ActivationHandle>, EngineError>;
}

/// Raw `(status, message)` pair returned by an activation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReply {
    pub status: i32,
    pub message: String,
}

impl ActivationReply {
    pub fn is_success(&self) -> bool {
        self.status == ACTIVATION_SUCCESS
    }
}

/// One loaded activation engine instance.
pub trait ActivationHandle: Send {
    fn activate(
        &mut self,
        license_code: &str,
        additional_code: &str,
    ) -> Result<ActivationReply, EngineError>;

    fn version(&mut self) -> Result<String, EngineError>;

    fn machine_code(&mut self) -> Result<String, EngineError>;

    fn cursor_position(&mut self) -> Result<(i32, i32), EngineError>;

    /// Unload the instance. The handle is gone afterwards.
    fn release(self: Box<Self>);
}
