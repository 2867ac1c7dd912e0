//! Translation-time instrumentation
//!
//! - [`stream`] - in-progress op stream and deferred operand patching
//! - [`dispatch`] - hook dispatcher driving a plugin around block generation

pub mod dispatch;
pub mod stream;

pub use dispatch::{BlockGen, GenState, GeneratedBlock, HookDispatcher};
pub use dispatch::{HELPER_PLUGIN_FN, HELPER_PLUGIN_TB, HELPER_PLUGIN_TB2};
pub use stream::{Code, HostWordSize, OpRef, OpStream, PatchToken, Temp};
