//! In-progress op stream with deferred operand patching
//!
//! Ops are stored as headers pointing into one flat operand buffer, the way
//! the engine's code generator lays them out. A placeholder is a constant
//! load whose immediate is not known yet; [`OpStream::emit_placeholder`]
//! returns a [`PatchToken`] naming the immediate's slot, and
//! [`OpStream::resolve`] later overwrites that slot in place.
//!
//! On a 32-bit host word a 64-bit constant is two `MovI32` ops into the
//! temp pair `(t, t + 1)`. The token names the low half; the high half is
//! the immediate of the second op, two slots further.
//!
//! ```text
//! W64:  [MovI64 | t | value]
//! W32:  [MovI32 | t | lo] [MovI32 | t+1 | hi]
//!                     ^slot          ^slot + 2
//! ```

use std::fmt;

use tpi_plugin::{OpKind, PluginHelperFn, INVALID, TPI_MAX_HELPER_ARGS};

use super::dispatch::HELPER_PLUGIN_FN;
use crate::error::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostWordSize {
    W32,
    W64,
}

impl HostWordSize {
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "32") {
            HostWordSize::W32
        } else {
            HostWordSize::W64
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            HostWordSize::W32 => 32,
            HostWordSize::W64 => 64,
        }
    }
}

/// A 64-bit temporary. On a 32-bit host it also owns the next index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Temp(u32);

impl Temp {
    pub const fn index(self) -> u32 {
        self.0
    }

    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub const fn operand(self) -> u64 {
        self.0 as u64
    }
}

/// Plugin helper referenced by a sealed block, compared by address.
#[derive(Clone, Copy)]
struct PluginHelper(PluginHelperFn);

impl PartialEq for PluginHelper {
    fn eq(&self, other: &Self) -> bool {
        self.0 as usize == other.0 as usize
    }
}

impl Eq for PluginHelper {}

impl fmt::Debug for PluginHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0 as usize)
    }
}

/// Outstanding placeholder. Resolving consumes it, so a token can only be
/// resolved once.
#[must_use = "a placeholder must be resolved before the stream is sealed"]
#[derive(Debug, PartialEq, Eq)]
pub struct PatchToken {
    id: u32,
}

impl PatchToken {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hand the token across the plugin boundary; resolve it again with
    /// [`OpStream::resolve_raw`].
    pub fn into_raw(self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpHeader {
    kind: OpKind,
    pc: u64,
    start: u32,
    len: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRef<'a> {
    pub kind: OpKind,
    /// Guest pc of the instruction the op belongs to
    pub pc: u64,
    pub args: &'a [u64],
}

pub struct OpStream {
    word: HostWordSize,
    ops: Vec<OpHeader>,
    params: Vec<u64>,
    helpers: Vec<PluginHelper>,
    next_temp: u32,
    pc: u64,
    /// Operand slot per token id, `None` once resolved
    patches: Vec<Option<usize>>,
    outstanding: usize,
}

impl OpStream {
    pub fn new(word: HostWordSize) -> Self {
        Self {
            word,
            ops: Vec::new(),
            params: Vec::new(),
            helpers: Vec::new(),
            next_temp: 0,
            pc: 0,
            patches: Vec::new(),
            outstanding: 0,
        }
    }

    pub fn word(&self) -> HostWordSize {
        self.word
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Guest pc of the last `InsnStart`.
    pub fn current_pc(&self) -> u64 {
        self.pc
    }

    pub fn new_temp(&mut self) -> Temp {
        let temp = Temp(self.next_temp);
        self.next_temp += match self.word {
            HostWordSize::W32 => 2,
            HostWordSize::W64 => 1,
        };
        temp
    }

    /// Append an op and return its position.
    ///
    /// # Panics
    ///
    /// If `args` has more than 255 operands or the operand buffer outgrows
    /// 32-bit offsets.
    pub fn emit(&mut self, kind: OpKind, args: &[u64]) -> usize {
        assert!(
            args.len() <= u8::MAX as usize,
            "op {} has {} operands",
            kind.name(),
            args.len()
        );
        assert!(
            self.params.len() <= u32::MAX as usize,
            "operand buffer full ({} entries)",
            self.params.len()
        );

        if kind == OpKind::InsnStart {
            if let Some(&pc) = args.first() {
                self.pc = pc;
            }
        }

        let position = self.ops.len();
        self.ops.push(OpHeader {
            kind,
            pc: self.pc,
            start: self.params.len() as u32,
            len: args.len() as u8,
        });
        self.params.extend_from_slice(args);
        log::trace!("op #{} {} {:x?}", position, kind.name(), args);
        position
    }

    /// Load a 64-bit constant into `temp`; returns the position of the
    /// first op.
    pub fn const_i64(&mut self, temp: Temp, value: u64) -> usize {
        match self.word {
            HostWordSize::W64 => self.emit(OpKind::MovI64, &[temp.operand(), value]),
            HostWordSize::W32 => {
                let position = self.emit(OpKind::MovI32, &[temp.operand(), value & 0xffff_ffff]);
                self.emit(OpKind::MovI32, &[temp.operand() + 1, value >> 32]);
                position
            }
        }
    }

    /// Call a plugin helper with up to [`TPI_MAX_HELPER_ARGS`] temps:
    ///
    /// ```text
    /// call  HELPER_PLUGIN_FN, <helper index>, ret | INVALID, args...
    /// ```
    ///
    /// Returns `None` when there are too many arguments.
    pub fn emit_helper_call(
        &mut self,
        helper: PluginHelperFn,
        ret: Option<Temp>,
        args: &[Temp],
    ) -> Option<usize> {
        if args.len() > TPI_MAX_HELPER_ARGS {
            return None;
        }

        let helper = PluginHelper(helper);
        let index = match self.helpers.iter().position(|known| *known == helper) {
            Some(index) => index,
            None => {
                self.helpers.push(helper);
                self.helpers.len() - 1
            }
        };

        let mut operands = vec![
            HELPER_PLUGIN_FN,
            index as u64,
            ret.map_or(INVALID as u64, Temp::operand),
        ];
        operands.extend(args.iter().map(|t| t.operand()));
        Some(self.emit(OpKind::Call, &operands))
    }

    /// Load a constant that is only known after generation.
    pub fn emit_placeholder(&mut self, temp: Temp) -> PatchToken {
        let position = self.const_i64(temp, 0);
        let slot = self.ops[position].start as usize + 1;

        let id = self.patches.len() as u32;
        self.patches.push(Some(slot));
        self.outstanding += 1;
        log::trace!("placeholder #{} at slot {}", id, slot);
        PatchToken { id }
    }

    pub fn resolve(&mut self, token: PatchToken, value: u64) -> Result<(), PatchError> {
        self.resolve_raw(token.into_raw(), value)
    }

    /// Resolve a token that crossed the plugin boundary as a bare id.
    pub fn resolve_raw(&mut self, id: u32, value: u64) -> Result<(), PatchError> {
        let entry = self
            .patches
            .get_mut(id as usize)
            .ok_or(PatchError::UnknownToken(id))?;
        let slot = entry.take().ok_or(PatchError::AlreadyResolved(id))?;
        self.outstanding -= 1;

        self.write_slot(slot, value)?;
        log::trace!("placeholder #{} = {:#x}", id, value);
        Ok(())
    }

    fn write_slot(&mut self, slot: usize, value: u64) -> Result<(), PatchError> {
        let last = match self.word {
            HostWordSize::W64 => slot,
            HostWordSize::W32 => slot + 2,
        };
        debug_assert!(last < self.params.len(), "patch slot {} out of bounds", last);
        if last >= self.params.len() {
            return Err(PatchError::OutOfBounds {
                slot: last,
                len: self.params.len(),
            });
        }

        match self.word {
            HostWordSize::W64 => self.params[slot] = value,
            HostWordSize::W32 => {
                self.params[slot] = value & 0xffff_ffff;
                self.params[slot + 2] = value >> 32;
            }
        }
        Ok(())
    }

    /// Number of tokens not resolved yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn op(&self, position: usize) -> Option<OpRef<'_>> {
        self.ops.get(position).map(|header| self.op_ref(header))
    }

    pub fn ops(&self) -> impl Iterator<Item = OpRef<'_>> + '_ {
        self.ops.iter().map(move |header| self.op_ref(header))
    }

    fn op_ref(&self, header: &OpHeader) -> OpRef<'_> {
        let start = header.start as usize;
        OpRef {
            kind: header.kind,
            pc: header.pc,
            args: &self.params[start..start + header.len as usize],
        }
    }

    /// Freeze the stream. Fails while any placeholder is outstanding.
    pub fn seal(self) -> Result<Code, PatchError> {
        if self.outstanding > 0 {
            return Err(PatchError::Unresolved {
                count: self.outstanding,
            });
        }
        Ok(Code {
            word: self.word,
            ops: self.ops,
            params: self.params,
            helpers: self.helpers,
            temps: self.next_temp,
        })
    }
}

impl fmt::Debug for OpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpStream")
            .field("word", &self.word)
            .field("ops", &self.ops.len())
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

/// Sealed op stream of a generated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    word: HostWordSize,
    ops: Vec<OpHeader>,
    params: Vec<u64>,
    helpers: Vec<PluginHelper>,
    temps: u32,
}

impl Code {
    pub fn word(&self) -> HostWordSize {
        self.word
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of temp indices in use.
    pub fn temps(&self) -> u32 {
        self.temps
    }

    /// Plugin helper named by a `HELPER_PLUGIN_FN` call.
    pub fn helper(&self, index: usize) -> Option<PluginHelperFn> {
        self.helpers.get(index).map(|helper| helper.0)
    }

    pub fn ops(&self) -> impl Iterator<Item = OpRef<'_>> + '_ {
        self.ops.iter().map(move |header| {
            let start = header.start as usize;
            OpRef {
                kind: header.kind,
                pc: header.pc,
                args: &self.params[start..start + header.len as usize],
            }
        })
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, op) in self.ops().enumerate() {
            write!(f, "{:4} {:<14}", position, op.kind.name())?;
            for arg in op.args {
                write!(f, " {:#x}", arg)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_patched_in_place_w64() {
        let mut stream = OpStream::new(HostWordSize::W64);
        let t = stream.new_temp();
        let token = stream.emit_placeholder(t);
        let before = stream.len();

        stream.resolve(token, 0x1234_5678_9abc_def0).unwrap();

        assert_eq!(stream.len(), before);
        let op = stream.op(0).unwrap();
        assert_eq!(op.kind, OpKind::MovI64);
        assert_eq!(op.args, &[t.operand(), 0x1234_5678_9abc_def0]);
    }

    #[test]
    fn test_placeholder_w32_writes_high_half_two_slots_later() {
        let mut stream = OpStream::new(HostWordSize::W32);
        let t = stream.new_temp();
        let token = stream.emit_placeholder(t);
        stream.resolve(token, 0x1234_5678_9abc_def0).unwrap();

        let code = stream.seal().unwrap();
        let ops: Vec<_> = code.ops().collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OpKind::MovI32);
        assert_eq!(ops[0].args, &[0, 0x9abc_def0]);
        assert_eq!(ops[1].args, &[1, 0x1234_5678]);
        assert_eq!(code.params[1], 0x9abc_def0);
        assert_eq!(code.params[3], 0x1234_5678);
    }

    #[test]
    fn test_w32_temps_are_pairs() {
        let mut stream = OpStream::new(HostWordSize::W32);
        assert_eq!(stream.new_temp().index(), 0);
        assert_eq!(stream.new_temp().index(), 2);

        let mut stream = OpStream::new(HostWordSize::W64);
        assert_eq!(stream.new_temp().index(), 0);
        assert_eq!(stream.new_temp().index(), 1);
    }

    #[test]
    fn test_seal_refuses_outstanding_tokens() {
        let mut stream = OpStream::new(HostWordSize::W64);
        let t = stream.new_temp();
        let _token = stream.emit_placeholder(t);
        let u = stream.new_temp();
        let other = stream.emit_placeholder(u);
        stream.resolve(other, 1).unwrap();

        assert_eq!(stream.outstanding(), 1);
        assert_eq!(stream.seal(), Err(PatchError::Unresolved { count: 1 }));
    }

    #[test]
    fn test_raw_tokens_resolve_once() {
        let mut stream = OpStream::new(HostWordSize::W64);
        let t = stream.new_temp();
        let id = stream.emit_placeholder(t).into_raw();

        assert_eq!(stream.resolve_raw(id, 7), Ok(()));
        assert_eq!(stream.resolve_raw(id, 8), Err(PatchError::AlreadyResolved(id)));
        assert_eq!(stream.resolve_raw(99, 8), Err(PatchError::UnknownToken(99)));
        assert_eq!(stream.op(0).unwrap().args[1], 7);
    }

    #[test]
    fn test_insn_start_tracks_pc() {
        let mut stream = OpStream::new(HostWordSize::W64);
        stream.emit(OpKind::InsnStart, &[0x1000]);
        stream.emit(OpKind::Nop, &[]);
        stream.emit(OpKind::InsnStart, &[0x1004]);
        stream.emit(OpKind::Nop, &[]);

        let pcs: Vec<u64> = stream.ops().map(|op| op.pc).collect();
        assert_eq!(pcs, vec![0x1000, 0x1000, 0x1004, 0x1004]);
        assert_eq!(stream.current_pc(), 0x1004);
    }

    extern "C" fn add(a: u64, b: u64, _: u64) -> u64 {
        a + b
    }

    #[test]
    fn test_helper_call_operands() {
        let mut stream = OpStream::new(HostWordSize::W64);
        let (a, b, r) = (stream.new_temp(), stream.new_temp(), stream.new_temp());
        stream.emit_helper_call(add, Some(r), &[a, b]).unwrap();
        stream.emit_helper_call(add, None, &[r]).unwrap();
        assert!(stream.emit_helper_call(add, None, &[a, a, a, a]).is_none());

        let code = stream.seal().unwrap();
        let ops: Vec<_> = code.ops().collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OpKind::Call);
        assert_eq!(ops[0].args, &[HELPER_PLUGIN_FN, 0, 2, 0, 1]);
        // the same helper is registered once
        assert_eq!(ops[1].args, &[HELPER_PLUGIN_FN, 0, INVALID as u64, 2]);
        assert_eq!(code.helper(0).map(|f| f(2, 3, 0)), Some(5));
        assert!(code.helper(1).is_none());
    }

    #[test]
    #[should_panic(expected = "has 256 operands")]
    fn test_oversized_op_panics() {
        let mut stream = OpStream::new(HostWordSize::W64);
        stream.emit(OpKind::Nop, &[0; 256]);
    }

    #[test]
    fn test_code_display() {
        let mut stream = OpStream::new(HostWordSize::W64);
        stream.emit(OpKind::ExitTb, &[0]);
        let code = stream.seal().unwrap();
        let text = code.to_string();
        assert_eq!(text.split_whitespace().collect::<Vec<_>>(), vec!["0", "exit_tb", "0x0"]);
    }
}
