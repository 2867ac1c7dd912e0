//! Error types of the instrumentation layer

use std::path::PathBuf;

/// Reasons a plugin is not activated. All of them leave the registry with a
/// zeroed descriptor, so every hook degrades to a no-op.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("can't open plugin '{}': {reason}", path.display())]
    ModuleNotFound { path: PathBuf, reason: String },

    #[error("plugin '{module}' has no '{symbol}' entry point: {reason}")]
    EntryPointMissing {
        module: String,
        symbol: String,
        reason: String,
    },

    #[error("plugin '{module}' initialization has failed")]
    InitializationFailed { module: String },

    #[error("incompatible plugin interface ({found} != {expected})")]
    VersionMismatch { found: i32, expected: i32 },

    #[error("incompatible {structure} size ({found} != {expected})")]
    LayoutMismatch {
        structure: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("a plugin is already loaded ('{module}')")]
    AlreadyLoaded { module: String },
}

/// Failure to generate a block or patch its operands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("unknown patch token #{0}")]
    UnknownToken(u32),

    #[error("patch token #{0} was already resolved")]
    AlreadyResolved(u32),

    #[error("{count} patch token(s) left unresolved at seal time")]
    Unresolved { count: usize },

    #[error("patch slot {slot} is outside the operand buffer ({len} entries)")]
    OutOfBounds { slot: usize, len: usize },

    #[error("block too large: {icount} instruction(s), {size} byte(s) (limit 65535 each)")]
    BlockTooLarge { icount: usize, size: u64 },
}
