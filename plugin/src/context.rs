//! Generation-time context handed to hooks
//!
//! The engine builds a [`GenContext`] on its stack for the duration of a single
//! hook call. Architecture specific state (`env`, `tb`) is only filled in for
//! non-generic plugins; generic plugins always see null pointers.

use std::ffi::c_void;

use crate::op::OpKind;
use crate::{CpuState, TranslationBlock};

/// Returned by the emitter entry points when a request was rejected.
pub const INVALID: u32 = u32::MAX;

/// Most temps a plugin helper call takes as arguments.
pub const TPI_MAX_HELPER_ARGS: usize = 3;

/// Plugin code called from a generated block at run time. Missing
/// arguments are zero.
pub type PluginHelperFn = extern "C" fn(a0: u64, a1: u64, a2: u64) -> u64;

/// Lets a hook append ops to the block being generated.
///
/// Ops emitted here are never reported back through `after_gen_opc`.
///
/// The block is closed to new ops once its instruction count is known:
/// inside `pre_tb_helper_data` and `after_gen_tb` only `new_temp` and
/// `resolve` work, and `emit`, `emit_placeholder` and `call_helper` return
/// [`INVALID`]. Placeholders emitted earlier are resolved there.
#[repr(C)]
pub struct Emitter {
    pub ctx: *mut c_void,
    /// Allocate a 64-bit temporary
    pub new_temp: extern "C" fn(ctx: *mut c_void) -> u32,
    /// Append an op; returns its position or [`INVALID`]
    pub emit: extern "C" fn(ctx: *mut c_void, kind: u16, args: *const u64, nb_args: usize) -> u32,
    /// Load a not-yet-known 64-bit constant into a fresh temporary; returns a
    /// token to resolve before the block is sealed, or [`INVALID`]
    pub emit_placeholder: extern "C" fn(ctx: *mut c_void, temp: &mut u32) -> u32,
    /// Patch the placeholder behind `token`. Each token resolves once.
    pub resolve: extern "C" fn(ctx: *mut c_void, token: u32, value: u64) -> bool,
    /// Call `helper` at run time with `nb_args` temps (at most
    /// [`TPI_MAX_HELPER_ARGS`]), storing its result in temp `ret` unless it
    /// is [`INVALID`]. Returns the op position or [`INVALID`].
    pub call_helper: extern "C" fn(
        ctx: *mut c_void,
        helper: PluginHelperFn,
        ret: u32,
        args: *const u32,
        nb_args: usize,
    ) -> u32,
}

impl Emitter {
    pub fn new_temp(&self) -> u32 {
        (self.new_temp)(self.ctx)
    }

    pub fn emit(&self, kind: OpKind, args: &[u64]) -> Option<u32> {
        let position = (self.emit)(self.ctx, kind.code(), args.as_ptr(), args.len());
        (position != INVALID).then_some(position)
    }

    /// Returns `(temp, token)`.
    pub fn placeholder(&self) -> Option<(u32, u32)> {
        let mut temp = INVALID;
        let token = (self.emit_placeholder)(self.ctx, &mut temp);
        (token != INVALID).then_some((temp, token))
    }

    pub fn resolve(&self, token: u32, value: u64) -> bool {
        (self.resolve)(self.ctx, token, value)
    }

    /// Inline a call to `helper`; its result lands in `ret` when given.
    pub fn call_helper(
        &self,
        helper: PluginHelperFn,
        ret: Option<u32>,
        args: &[u32],
    ) -> Option<u32> {
        let position = (self.call_helper)(
            self.ctx,
            helper,
            ret.unwrap_or(INVALID),
            args.as_ptr(),
            args.len(),
        );
        (position != INVALID).then_some(position)
    }
}

#[repr(C)]
pub struct GenContext {
    pub env: *const CpuState,
    pub tb: *const TranslationBlock,
    pub emitter: *const Emitter,
}

impl GenContext {
    /// Context exposing nothing.
    pub const fn empty() -> Self {
        Self {
            env: std::ptr::null(),
            tb: std::ptr::null(),
            emitter: std::ptr::null(),
        }
    }

    /// CPU that is translating, for non-generic plugins.
    pub fn cpu_state(&self) -> Option<&CpuState> {
        // SAFETY: the engine only stores pointers that outlive the hook call.
        unsafe { self.env.as_ref() }
    }

    /// Block being translated, for non-generic plugins.
    pub fn block(&self) -> Option<&TranslationBlock> {
        // SAFETY: see `cpu_state`.
        unsafe { self.tb.as_ref() }
    }

    pub fn emitter(&self) -> Option<&Emitter> {
        // SAFETY: see `cpu_state`.
        unsafe { self.emitter.as_ref() }
    }
}
