//! TPI engine: translation-time plugin instrumentation for a DBT engine
//!
//! The engine side of the plugin interface defined in `tpi_plugin`:
//!
//! - [`loader`] - resolve and open plugin modules
//! - [`abi`] - validate the descriptor a plugin filled in
//! - [`region`] - guest address filter
//! - [`codegen`] - hook dispatcher and deferred operand patching
//! - [`runtime`] - callback serialization and block replay
//! - [`registry`] - the loaded plugin, shared by every virtual CPU
//!
//! ```rust,ignore
//! use tpi_engine::{EngineConfig, EngineInfo, PluginRegistry, BlockTranslator, BlockRunner, GuestInsn};
//!
//! let mut registry = PluginRegistry::new(EngineConfig::from_env(), EngineInfo::new("lm32", "softmmu"));
//! registry.load("icount")?;
//!
//! let translator = BlockTranslator::new(registry.dispatcher());
//! let block = translator.translate(0, 0x1000, &GuestInsn::straight_line(0x1000, 4, 16))?;
//! BlockRunner::new(&registry).run(&block);
//! registry.cpus_stopped();
//! ```

pub mod abi;
pub mod codegen;
pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
pub mod output;
pub mod region;
pub mod registry;
pub mod runtime;
pub mod translate;

pub use abi::{AbiWarning, Activation, ArchAccess, EngineInfo, PluginClass};
pub use codegen::{BlockGen, GenState, GeneratedBlock, HookDispatcher, HostWordSize};
pub use config::EngineConfig;
pub use error::{LoadError, PatchError};
pub use loader::{PluginModule, SharedLibrary, StaticModule};
pub use output::{MemoryOutput, PluginOutput};
pub use region::AddressRange;
pub use registry::PluginRegistry;
pub use runtime::{BlockRunner, CallbackGuard};
pub use translate::{BlockTranslator, GuestInsn, InsnKind};
