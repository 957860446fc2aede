pub mod identity;
pub mod progress;

pub use identity::*;
pub use progress::*;
