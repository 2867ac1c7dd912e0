//! Hook dispatcher
//!
//! Drives the loaded plugin around the generation of one block:
//!
//! ```text
//! Idle --begin_block--> Generating --emit*--> Generating --finish--> Finalizing --> Idle
//! ```
//!
//! The state lives in an atomic cell and every transition is a
//! compare-and-swap, so entering a second block while one is in flight is
//! detected instead of silently corrupting the in-progress stream.
//!
//! For an instrumented block the dispatcher injects one helper call at the
//! start of the block:
//!
//! ```text
//! movi  t_addr, <block pc>
//! movi  t_info, <placeholder>            HelperInfo, known after generation
//! movi  t_d1,   <placeholder>            only with pre_tb_helper_data
//! movi  t_d2,   <placeholder>
//! call  HELPER_PLUGIN_TB[2], t_addr, t_info [, t_d1, t_d2]
//! ```
//!
//! and patches the placeholders once the block size and instruction count
//! are known, before `after_gen_tb` runs.
//!
//! From `finish` on the block is closed: hooks running there get an emitter
//! that still allocates temps and resolves tokens, but appends nothing after
//! the block's exit.

use smallvec::{smallvec, SmallVec};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tpi_plugin::{
    CpuState, Emitter, GenContext, HelperInfo, OpKind, OpcodeEvent, PluginHelperFn,
    PluginInterface, TranslationBlock, INVALID, TPI_MAX_HELPER_ARGS, TPI_MAX_OP_ARGS,
};

use super::stream::{Code, HostWordSize, OpStream, PatchToken, Temp};
use crate::abi::{ArchAccess, PluginClass};
use crate::error::PatchError;
use crate::region::AddressRange;

/// Helper id of `call_tb_helper(address, info)`.
pub const HELPER_PLUGIN_TB: u64 = 1;
/// Helper id of `call_tb_helper(address, info, data1, data2)`.
pub const HELPER_PLUGIN_TB2: u64 = 2;
/// Helper id of a plugin-supplied [`PluginHelperFn`].
pub const HELPER_PLUGIN_FN: u64 = 3;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    Idle = 0,
    Generating = 1,
    Finalizing = 2,
}

impl GenState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => GenState::Generating,
            2 => GenState::Finalizing,
            _ => GenState::Idle,
        }
    }
}

pub struct HookDispatcher {
    tpi: PluginInterface,
    access: Option<ArchAccess>,
    range: AddressRange,
    word: HostWordSize,
    state: AtomicU8,
    stopped: AtomicBool,
}

impl HookDispatcher {
    /// Dispatcher with no plugin: every hook is a no-op.
    pub fn inactive(word: HostWordSize) -> Self {
        Self {
            tpi: PluginInterface::zeroed(),
            access: None,
            range: AddressRange::ALL,
            word,
            state: AtomicU8::new(GenState::Idle as u8),
            stopped: AtomicBool::new(false),
        }
    }

    /// Dispatcher for an activated descriptor.
    pub fn new(tpi: PluginInterface, class: PluginClass, word: HostWordSize) -> Self {
        Self {
            range: AddressRange::new(tpi.low_pc, tpi.high_pc),
            access: class.arch_access(),
            tpi,
            word,
            state: AtomicU8::new(GenState::Idle as u8),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &PluginInterface {
        &self.tpi
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    pub fn word(&self) -> HostWordSize {
        self.word
    }

    pub fn state(&self) -> GenState {
        GenState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: GenState, to: GenState) {
        if let Err(current) =
            self.state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            let current = GenState::from_u8(current);
            log::error!(
                "code generation re-entered: expected {:?}, found {:?}",
                from,
                current
            );
            panic!(
                "plugin hook dispatcher re-entered (expected {:?}, found {:?})",
                from, current
            );
        }
    }

    /// Start generating the block at `pc` on virtual CPU `cpu_index`.
    ///
    /// # Panics
    ///
    /// If another block is still being generated.
    pub fn begin_block(&self, cpu_index: u32, pc: u64) -> BlockGen<'_> {
        self.transition(GenState::Idle, GenState::Generating);

        let instrument = self.tpi.is_active() && self.range.contains(pc);
        let mut gen = BlockGen {
            dispatcher: self,
            stream: OpStream::new(self.word),
            env: CpuState { cpu_index, pc },
            tb: TranslationBlock {
                pc,
                size: 0,
                icount: 0,
                cpu_index,
            },
            instrument,
            helper: None,
        };

        if instrument {
            log::debug!("instrumenting block {:#x} on CPU #{}", pc, cpu_index);
            if let Some(before) = self.tpi.before_gen_tb {
                gen.call_hook(true, |tpi, ctx| before(tpi, ctx));
            }
            gen.emit_helper_call();
        }
        gen
    }

    /// All virtual CPUs stopped. Runs the plugin's shutdown hook the first
    /// time only; returns whether it ran.
    pub fn cpus_stopped(&self) -> bool {
        if !self.tpi.is_active() || self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.tpi.cpus_stopped {
            Some(hook) => {
                log::info!("running plugin shutdown hook");
                hook(&self.tpi);
                true
            }
            None => false,
        }
    }
}

struct HelperTokens {
    info: PatchToken,
    data: Option<(PatchToken, PatchToken)>,
}

/// Generation session of one block.
///
/// Dropping it without calling [`BlockGen::finish`] discards the block and
/// returns the dispatcher to `Idle`.
pub struct BlockGen<'a> {
    dispatcher: &'a HookDispatcher,
    stream: OpStream,
    env: CpuState,
    tb: TranslationBlock,
    instrument: bool,
    helper: Option<HelperTokens>,
}

impl BlockGen<'_> {
    /// Whether the block lies inside the plugin's address range.
    pub fn is_instrumented(&self) -> bool {
        self.instrument
    }

    pub fn stream(&self) -> &OpStream {
        &self.stream
    }

    pub fn new_temp(&mut self) -> Temp {
        self.stream.new_temp()
    }

    /// Append an engine op and report it to `after_gen_opc`.
    pub fn emit(&mut self, kind: OpKind, args: &[u64]) -> usize {
        let first = self.stream.len();
        self.stream.emit(kind, args);
        self.report_ops(first);
        first
    }

    /// Load a 64-bit constant, reporting every op it takes.
    pub fn const_i64(&mut self, temp: Temp, value: u64) -> usize {
        let first = self.stream.len();
        self.stream.const_i64(temp, value);
        self.report_ops(first);
        first
    }

    /// Report the engine ops in `first..` to `after_gen_opc`. Ops the plugin
    /// appends while the hook runs are past `end` and never reported.
    fn report_ops(&mut self, first: usize) {
        if !self.instrument {
            return;
        }
        let Some(hook) = self.dispatcher.tpi.after_gen_opc else {
            return;
        };

        let end = self.stream.len();
        for position in first..end {
            let Some(op) = self.stream.op(position) else {
                break;
            };
            let event = OpcodeEvent::new(op.kind, op.pc, position as u32, op.args);
            log::trace!("after_gen_opc #{} {}", position, op.kind.name());
            self.call_hook(true, |tpi, ctx| hook(tpi, ctx, &event));
        }
    }

    fn emit_helper_call(&mut self) {
        let tpi = &self.dispatcher.tpi;
        if tpi.pre_tb_helper_code.is_none() {
            return;
        }
        let with_data = tpi.pre_tb_helper_data.is_some();

        let stream = &mut self.stream;
        let address = stream.new_temp();
        stream.const_i64(address, self.tb.pc);
        let info_temp = stream.new_temp();
        let info = stream.emit_placeholder(info_temp);

        let mut args: SmallVec<[u64; 5]> =
            smallvec![HELPER_PLUGIN_TB, address.operand(), info_temp.operand()];
        let data = if with_data {
            let d1 = stream.new_temp();
            let data1 = stream.emit_placeholder(d1);
            let d2 = stream.new_temp();
            let data2 = stream.emit_placeholder(d2);
            args[0] = HELPER_PLUGIN_TB2;
            args.extend([d1.operand(), d2.operand()]);
            Some((data1, data2))
        } else {
            None
        };
        stream.emit(OpKind::Call, &args);

        self.helper = Some(HelperTokens { info, data });
    }

    /// Run a generation hook with a context valid for this call only. With
    /// `appendable` false the hook's emitter refuses new ops.
    fn call_hook<R>(
        &mut self,
        appendable: bool,
        f: impl FnOnce(&PluginInterface, &GenContext) -> R,
    ) -> R {
        let dispatcher = self.dispatcher;
        let emitter = Emitter {
            ctx: &mut self.stream as *mut OpStream as *mut c_void,
            new_temp: emitter_new_temp,
            emit: if appendable { emitter_emit } else { closed_emit },
            emit_placeholder: if appendable {
                emitter_placeholder
            } else {
                closed_placeholder
            },
            resolve: emitter_resolve,
            call_helper: if appendable {
                emitter_call_helper
            } else {
                closed_call_helper
            },
        };
        let (env, tb) = match dispatcher.access {
            Some(_) => (&self.env as *const CpuState, &self.tb as *const TranslationBlock),
            None => (std::ptr::null(), std::ptr::null()),
        };
        let ctx = GenContext {
            env,
            tb,
            emitter: &emitter,
        };
        f(&dispatcher.tpi, &ctx)
    }

    /// Complete the block: record its final size, patch the injected
    /// helper call, run `after_gen_tb` and seal the stream.
    pub fn finish(mut self, size: u16, icount: u16) -> Result<GeneratedBlock, PatchError> {
        let dispatcher = self.dispatcher;
        dispatcher.transition(GenState::Generating, GenState::Finalizing);

        self.tb.size = size;
        self.tb.icount = icount;

        if self.instrument {
            if let Some(helper) = self.helper.take() {
                let info = HelperInfo::for_block(self.tb.cpu_index as u16, size, icount as u32);
                self.stream.resolve(helper.info, info.to_bits())?;

                if let Some((data1, data2)) = helper.data {
                    let (mut d1, mut d2) = (0, 0);
                    if let Some(setup) = dispatcher.tpi.pre_tb_helper_data {
                        let pc = self.tb.pc;
                        self.call_hook(false, |tpi, ctx| setup(tpi, ctx, info, pc, &mut d1, &mut d2));
                    }
                    self.stream.resolve(data1, d1)?;
                    self.stream.resolve(data2, d2)?;
                }
            }

            if let Some(after) = dispatcher.tpi.after_gen_tb {
                self.call_hook(false, |tpi, ctx| after(tpi, ctx));
            }
        }

        let stream = std::mem::replace(&mut self.stream, OpStream::new(dispatcher.word));
        let code = stream.seal()?;
        log::debug!(
            "block {:#x} sealed: {} ops, size {}, icount {}",
            self.tb.pc,
            code.len(),
            size,
            icount
        );

        Ok(GeneratedBlock {
            tb: self.tb,
            code,
            instrumented: self.instrument,
        })
    }
}

impl Drop for BlockGen<'_> {
    fn drop(&mut self) {
        if self.dispatcher.state() == GenState::Generating {
            log::debug!("block {:#x} discarded", self.tb.pc);
        }
        self.dispatcher
            .state
            .store(GenState::Idle as u8, Ordering::Release);
    }
}

/// A generated, sealed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedBlock {
    pub tb: TranslationBlock,
    pub code: Code,
    /// Whether the plugin saw this block
    pub instrumented: bool,
}

// ============================================================================
// Emitter entry points handed to plugins
// ============================================================================

/// # Safety
///
/// `ctx` must be the stream pointer installed by `BlockGen::call_hook`,
/// which is only reachable while that call is on the stack.
unsafe fn stream_from<'s>(ctx: *mut c_void) -> Option<&'s mut OpStream> {
    (ctx as *mut OpStream).as_mut()
}

extern "C" fn emitter_new_temp(ctx: *mut c_void) -> u32 {
    // SAFETY: see `stream_from`.
    match unsafe { stream_from(ctx) } {
        Some(stream) => stream.new_temp().index(),
        None => INVALID,
    }
}

extern "C" fn emitter_emit(ctx: *mut c_void, kind: u16, args: *const u64, nb_args: usize) -> u32 {
    // SAFETY: see `stream_from`.
    let Some(stream) = (unsafe { stream_from(ctx) }) else {
        return INVALID;
    };
    let Some(kind) = OpKind::from_code(kind) else {
        log::warn!("plugin emitted unknown op kind {}", kind);
        return INVALID;
    };
    if nb_args > TPI_MAX_OP_ARGS || (nb_args > 0 && args.is_null()) {
        log::warn!("plugin emitted {} with {} operands", kind.name(), nb_args);
        return INVALID;
    }

    let args = if nb_args == 0 {
        &[][..]
    } else {
        // SAFETY: the plugin passes `nb_args` valid operands.
        unsafe { std::slice::from_raw_parts(args, nb_args) }
    };
    stream.emit(kind, args) as u32
}

extern "C" fn emitter_placeholder(ctx: *mut c_void, temp: &mut u32) -> u32 {
    // SAFETY: see `stream_from`.
    let Some(stream) = (unsafe { stream_from(ctx) }) else {
        return INVALID;
    };
    let t = stream.new_temp();
    *temp = t.index();
    stream.emit_placeholder(t).into_raw()
}

extern "C" fn emitter_resolve(ctx: *mut c_void, token: u32, value: u64) -> bool {
    // SAFETY: see `stream_from`.
    let Some(stream) = (unsafe { stream_from(ctx) }) else {
        return false;
    };
    match stream.resolve_raw(token, value) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("plugin patch rejected: {}", e);
            false
        }
    }
}

extern "C" fn emitter_call_helper(
    ctx: *mut c_void,
    helper: PluginHelperFn,
    ret: u32,
    args: *const u32,
    nb_args: usize,
) -> u32 {
    // SAFETY: see `stream_from`.
    let Some(stream) = (unsafe { stream_from(ctx) }) else {
        return INVALID;
    };
    if nb_args > TPI_MAX_HELPER_ARGS || (nb_args > 0 && args.is_null()) {
        log::warn!("plugin helper call with {} arguments", nb_args);
        return INVALID;
    }

    let args: SmallVec<[Temp; TPI_MAX_HELPER_ARGS]> = if nb_args == 0 {
        SmallVec::new()
    } else {
        // SAFETY: the plugin passes `nb_args` valid temp indices.
        unsafe { std::slice::from_raw_parts(args, nb_args) }
            .iter()
            .map(|&t| Temp::from_index(t))
            .collect()
    };
    let ret = (ret != INVALID).then(|| Temp::from_index(ret));
    match stream.emit_helper_call(helper, ret, &args) {
        Some(position) => position as u32,
        None => INVALID,
    }
}

extern "C" fn closed_emit(_: *mut c_void, kind: u16, _: *const u64, _: usize) -> u32 {
    log::warn!("plugin emitted op kind {} after the block was closed", kind);
    INVALID
}

extern "C" fn closed_placeholder(_: *mut c_void, temp: &mut u32) -> u32 {
    log::warn!("plugin placeholder after the block was closed");
    *temp = INVALID;
    INVALID
}

extern "C" fn closed_call_helper(
    _: *mut c_void,
    _: PluginHelperFn,
    _: u32,
    _: *const u32,
    _: usize,
) -> u32 {
    log::warn!("plugin helper call after the block was closed");
    INVALID
}
