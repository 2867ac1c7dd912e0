//! Plugin interface for translation-time instrumentation
//!
//! This crate defines everything that crosses the `dlopen` boundary between the
//! TPI engine and an instrumentation plugin: the [`PluginInterface`] descriptor,
//! the [`HelperInfo`] wire record, opcode events and the callback signatures.
//!
//! # Writing a plugin
//!
//! A plugin is a `cdylib` exporting a single `tpi_init` entry point. The
//! [`declare_plugin!`] macro generates it:
//!
//! ```rust,ignore
//! use tpi_plugin::{declare_plugin, HelperInfo, PluginInterface};
//!
//! extern "C" fn on_block(tpi: &PluginInterface, info: HelperInfo, pc: u64, _: u64, _: u64) {
//!     // runs every time an instrumented block executes
//! }
//!
//! fn init(tpi: &mut PluginInterface) {
//!     tpi.init_version_generic();
//!     tpi.pre_tb_helper_code = Some(on_block);
//! }
//!
//! declare_plugin!(init);
//! ```
//!
//! The engine checks `version`, the structure sizes and the guest/mode tags
//! right after `tpi_init` returns. Anything left unset stays disabled.
//!
//! Generation hooks can also inline work into the block through the
//! [`Emitter`] of their [`GenContext`], including calls to a
//! [`PluginHelperFn`] that run every time the block executes.

use std::ffi::{c_char, CStr};
use std::fmt;
use std::mem::size_of;

mod context;
mod info;
mod op;
mod output;

pub use context::{Emitter, GenContext, PluginHelperFn, INVALID, TPI_MAX_HELPER_ARGS};
pub use info::HelperInfo;
pub use op::{OpKind, OpcodeEvent, TPI_MAX_OP_ARGS};
pub use output::{OutputSink, OutputWriter};

/// Interface version. Bumped whenever the descriptor layout, a callback
/// signature or the [`HelperInfo`] bit layout changes.
pub const TPI_VERSION: i32 = 3;

/// Tag used for guest and mode by plugins that work everywhere.
pub const ANY: &CStr = c"any";

/// Name of the symbol every plugin must export.
pub const ENTRY_POINT: &[u8] = b"tpi_init";

/// Per virtual-CPU state visible to non-generic plugins.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
    pub cpu_index: u32,
    /// Guest program counter at the start of the current translation
    pub pc: u64,
}

/// A translation unit as seen by the instrumentation layer.
///
/// `size` and `icount` are zero while the block is being generated and final
/// once it is handed to `after_gen_tb`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationBlock {
    /// Guest entry address
    pub pc: u64,
    /// Size of the guest code in bytes
    pub size: u16,
    /// Number of guest instructions
    pub icount: u16,
    /// Virtual CPU that translated the block
    pub cpu_index: u32,
}

// ============================================================================
// Callback signatures
// ============================================================================

/// All virtual CPUs are stopped; the plugin should flush what it collected.
pub type CpusStoppedFn = extern "C" fn(tpi: &PluginInterface);

/// Before code generation of a block.
pub type BeforeGenTbFn = extern "C" fn(tpi: &PluginInterface, ctx: &GenContext);

/// After code generation of a block; the block is fully sized.
pub type AfterGenTbFn = extern "C" fn(tpi: &PluginInterface, ctx: &GenContext);

/// After the engine emitted one op into the block.
pub type AfterGenOpcFn =
    extern "C" fn(tpi: &PluginInterface, ctx: &GenContext, opcode: &OpcodeEvent);

/// Data collection, called each time an instrumented block runs.
pub type PreTbHelperCodeFn =
    extern "C" fn(tpi: &PluginInterface, info: HelperInfo, address: u64, data1: u64, data2: u64);

/// Context setup, called once per block right after generation. The values
/// written to `data1`/`data2` are handed back to [`PreTbHelperCodeFn`].
pub type PreTbHelperDataFn = extern "C" fn(
    tpi: &PluginInterface,
    ctx: &GenContext,
    info: HelperInfo,
    address: u64,
    data1: &mut u64,
    data2: &mut u64,
);

/// Signature of the exported `tpi_init` symbol.
pub type InitFn = extern "C" fn(tpi: &mut PluginInterface);

// ============================================================================
// Plugin descriptor (crosses dlopen boundary)
// ============================================================================

/// Descriptor negotiated between the engine and a plugin.
///
/// The engine fills the common parameters, calls `tpi_init`, then validates
/// the compatibility fields. After that the descriptor is read-only.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginInterface {
    /* Compatibility information */
    pub version: i32,
    pub guest: *const c_char,
    pub mode: *const c_char,
    pub sizeof_cpu_state: usize,
    pub sizeof_translation_block: usize,

    /* Common parameters */
    pub nb_cpus: u32,
    pub output: *const OutputSink,
    pub low_pc: u64,
    pub high_pc: u64,
    pub verbose: bool,
    pub mutex_protected: bool,
    pub is_generic: bool,

    /* Callbacks */
    pub cpus_stopped: Option<CpusStoppedFn>,
    pub before_gen_tb: Option<BeforeGenTbFn>,
    pub after_gen_tb: Option<AfterGenTbFn>,
    pub after_gen_opc: Option<AfterGenOpcFn>,
    pub pre_tb_helper_code: Option<PreTbHelperCodeFn>,
    pub pre_tb_helper_data: Option<PreTbHelperDataFn>,
}

// SAFETY: the raw pointers reference 'static tag strings and the engine-owned
// output sink, which outlives every plugin call. The descriptor is immutable
// once the plugin is activated.
unsafe impl Send for PluginInterface {}
unsafe impl Sync for PluginInterface {}

impl PluginInterface {
    /// The inactive descriptor: every field zero, every callback unset.
    pub const fn zeroed() -> Self {
        Self {
            version: 0,
            guest: std::ptr::null(),
            mode: std::ptr::null(),
            sizeof_cpu_state: 0,
            sizeof_translation_block: 0,
            nb_cpus: 0,
            output: std::ptr::null(),
            low_pc: 0,
            high_pc: 0,
            verbose: false,
            mutex_protected: false,
            is_generic: false,
            cpus_stopped: None,
            before_gen_tb: None,
            after_gen_tb: None,
            after_gen_opc: None,
            pre_tb_helper_code: None,
            pre_tb_helper_data: None,
        }
    }

    /// Declare a plugin built for one guest architecture and emulation mode.
    pub fn init_version(&mut self, guest: &'static CStr, mode: &'static CStr) {
        self.version = TPI_VERSION;
        self.guest = guest.as_ptr();
        self.mode = mode.as_ptr();
        self.sizeof_cpu_state = size_of::<CpuState>();
        self.sizeof_translation_block = size_of::<TranslationBlock>();
    }

    /// Declare a plugin that does not depend on the guest or its layout.
    pub fn init_version_generic(&mut self) {
        self.version = TPI_VERSION;
        self.guest = ANY.as_ptr();
        self.mode = ANY.as_ptr();
        self.sizeof_cpu_state = 0;
        self.sizeof_translation_block = 0;
    }

    /// A zeroed version field means no plugin is active.
    pub fn is_active(&self) -> bool {
        self.version != 0
    }

    pub fn guest(&self) -> Option<&CStr> {
        if self.guest.is_null() {
            None
        } else {
            // SAFETY: non-null tags point to NUL-terminated 'static strings.
            Some(unsafe { CStr::from_ptr(self.guest) })
        }
    }

    pub fn mode(&self) -> Option<&CStr> {
        if self.mode.is_null() {
            None
        } else {
            // SAFETY: see `guest`.
            Some(unsafe { CStr::from_ptr(self.mode) })
        }
    }

    /// Writer for the plugin's own diagnostics.
    ///
    /// Complete lines are forwarded to the engine one at a time, so lines
    /// written from different virtual CPUs never interleave.
    pub fn output(&self) -> OutputWriter<'_> {
        // SAFETY: the engine keeps the sink alive for as long as the plugin
        // is loaded.
        OutputWriter::new(unsafe { self.output.as_ref() })
    }
}

impl Default for PluginInterface {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for PluginInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInterface")
            .field("version", &self.version)
            .field("guest", &self.guest())
            .field("mode", &self.mode())
            .field("sizeof_cpu_state", &self.sizeof_cpu_state)
            .field("sizeof_translation_block", &self.sizeof_translation_block)
            .field("nb_cpus", &self.nb_cpus)
            .field("low_pc", &format_args!("{:#x}", self.low_pc))
            .field("high_pc", &format_args!("{:#x}", self.high_pc))
            .field("is_generic", &self.is_generic)
            .field("cpus_stopped", &self.cpus_stopped.is_some())
            .field("before_gen_tb", &self.before_gen_tb.is_some())
            .field("after_gen_tb", &self.after_gen_tb.is_some())
            .field("after_gen_opc", &self.after_gen_opc.is_some())
            .field("pre_tb_helper_code", &self.pre_tb_helper_code.is_some())
            .field("pre_tb_helper_data", &self.pre_tb_helper_data.is_some())
            .finish()
    }
}

/// Export the `tpi_init` entry point for a plugin.
///
/// # Syntax
///
/// ```rust,ignore
/// fn init(tpi: &mut tpi_plugin::PluginInterface) { /* ... */ }
/// tpi_plugin::declare_plugin!(init);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($init:path) => {
        #[no_mangle]
        pub extern "C" fn tpi_init(tpi: &mut $crate::PluginInterface) {
            $init(tpi)
        }
    };
}
