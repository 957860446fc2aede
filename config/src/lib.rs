//! Agent configuration: the typed [`AgentConfig`] snapshot, the rules it is
//! validated against, and the [`ConfigStore`] that owns the on-disk TOML
//! file.

mod config;
mod store;
mod validate;

pub use config::AgentConfig;
pub use store::{ConfigError, ConfigStore};
pub use validate::{ValidationReport, Violation, validate};
