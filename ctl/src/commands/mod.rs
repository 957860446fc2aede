mod config;
mod identities;

pub use config::*;
pub use identities::*;
