pub mod commands;
pub mod context;
pub mod engines;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod util;
