//! Minimal guest front end
//!
//! Turns synthetic guest instructions into blocks through the hook
//! dispatcher, calling it at the same points a real front end does: one
//! `begin_block` per block, every op through [`BlockGen::emit`], and
//! `finish` with the final size and instruction count.

use crate::codegen::{BlockGen, GeneratedBlock, HookDispatcher};
use crate::error::PatchError;
use tpi_plugin::OpKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    /// Register arithmetic
    Alu,
    Load { addr: u64, size: u8 },
    Store { addr: u64, size: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestInsn {
    pub pc: u64,
    pub size: u16,
    pub kind: InsnKind,
}

impl GuestInsn {
    pub const fn alu(pc: u64, size: u16) -> Self {
        Self {
            pc,
            size,
            kind: InsnKind::Alu,
        }
    }

    /// `icount` ALU instructions covering `size` bytes from `pc`. The last
    /// instruction absorbs any remainder.
    pub fn straight_line(pc: u64, icount: u16, size: u16) -> Vec<GuestInsn> {
        if icount == 0 {
            return Vec::new();
        }
        let step = (size / icount).max(1);
        let mut insns = Vec::with_capacity(icount as usize);
        let mut offset = 0u16;
        for i in 0..icount {
            let insn_size = if i + 1 == icount {
                size.saturating_sub(offset).max(1)
            } else {
                step
            };
            insns.push(GuestInsn::alu(pc + offset as u64, insn_size));
            offset = offset.saturating_add(insn_size);
        }
        insns
    }
}

pub struct BlockTranslator<'d> {
    dispatcher: &'d HookDispatcher,
}

impl<'d> BlockTranslator<'d> {
    pub fn new(dispatcher: &'d HookDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Translate `insns` into one block entered at `pc`.
    ///
    /// A block whose instruction count or byte size does not fit in 16 bits
    /// is refused before any hook runs.
    pub fn translate(
        &self,
        cpu_index: u32,
        pc: u64,
        insns: &[GuestInsn],
    ) -> Result<GeneratedBlock, PatchError> {
        let total: u64 = insns.iter().map(|insn| insn.size as u64).sum();
        let (Ok(icount), Ok(size)) = (u16::try_from(insns.len()), u16::try_from(total)) else {
            return Err(PatchError::BlockTooLarge {
                icount: insns.len(),
                size: total,
            });
        };

        let mut gen = self.dispatcher.begin_block(cpu_index, pc);
        for insn in insns {
            gen.emit(OpKind::InsnStart, &[insn.pc]);
            lower(&mut gen, insn);
        }
        gen.emit(OpKind::ExitTb, &[0]);

        gen.finish(size, icount)
    }
}

fn lower(gen: &mut BlockGen<'_>, insn: &GuestInsn) {
    match insn.kind {
        InsnKind::Alu => {
            let a = gen.new_temp();
            let b = gen.new_temp();
            gen.const_i64(a, insn.pc);
            gen.const_i64(b, insn.size as u64);
            gen.emit(OpKind::Add64, &[a.operand(), a.operand(), b.operand()]);
        }
        InsnKind::Load { addr, size } => {
            let address = gen.new_temp();
            let value = gen.new_temp();
            gen.const_i64(address, addr);
            gen.emit(
                OpKind::GuestLoad,
                &[value.operand(), address.operand(), size as u64],
            );
        }
        InsnKind::Store { addr, size } => {
            let address = gen.new_temp();
            let value = gen.new_temp();
            gen.const_i64(address, addr);
            gen.const_i64(value, 0);
            gen.emit(
                OpKind::GuestStore,
                &[value.operand(), address.operand(), size as u64],
            );
        }
    }
}
