//! Execution-time side: callback serialization and block replay

pub mod guard;
pub mod runner;

pub use guard::CallbackGuard;
pub use runner::BlockRunner;
