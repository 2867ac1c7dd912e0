//! Ops of the intermediate stream and the event describing one of them

/// Maximum number of operands reported in an [`OpcodeEvent`].
pub const TPI_MAX_OP_ARGS: usize = 6;

/// Operation kinds of the intermediate stream.
///
/// The numeric codes are part of the ABI. Operand conventions (`t` = temp):
///
/// | kind | operands |
/// |---|---|
/// | `InsnStart` | guest pc |
/// | `MovI32` | t_dst, imm32 |
/// | `MovI64` | t_dst, imm64 |
/// | `Add64` | t_dst, t_a, t_b |
/// | `ExtU32` | t_dst, t_src |
/// | `GuestLoad` | t_dst, t_addr, size |
/// | `GuestStore` | t_src, t_addr, size |
/// | `Call` | helper id, t_arg... |
/// | `ExitTb` | exit code |
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Nop = 0,
    InsnStart = 1,
    MovI32 = 2,
    MovI64 = 3,
    Add64 = 4,
    ExtU32 = 5,
    GuestLoad = 6,
    GuestStore = 7,
    Call = 8,
    ExitTb = 9,
}

impl OpKind {
    pub const fn code(self) -> u16 {
        self as u16
    }

    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => OpKind::Nop,
            1 => OpKind::InsnStart,
            2 => OpKind::MovI32,
            3 => OpKind::MovI64,
            4 => OpKind::Add64,
            5 => OpKind::ExtU32,
            6 => OpKind::GuestLoad,
            7 => OpKind::GuestStore,
            8 => OpKind::Call,
            9 => OpKind::ExitTb,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            OpKind::Nop => "nop",
            OpKind::InsnStart => "insn_start",
            OpKind::MovI32 => "movi_i32",
            OpKind::MovI64 => "movi_i64",
            OpKind::Add64 => "add_i64",
            OpKind::ExtU32 => "extu_i32_i64",
            OpKind::GuestLoad => "guest_ld",
            OpKind::GuestStore => "guest_st",
            OpKind::Call => "call",
            OpKind::ExitTb => "exit_tb",
        }
    }
}

/// One op just emitted by the engine. Only valid during the
/// `after_gen_opc` call that receives it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OpcodeEvent {
    pub kind: u16,
    /// Number of valid entries in `args` (capped at [`TPI_MAX_OP_ARGS`])
    pub nb_args: u8,
    /// Guest pc of the instruction being translated
    pub pc: u64,
    /// Index of the op inside the block's stream
    pub position: u32,
    pub args: [u64; TPI_MAX_OP_ARGS],
}

impl OpcodeEvent {
    pub fn new(kind: OpKind, pc: u64, position: u32, operands: &[u64]) -> Self {
        let nb_args = operands.len().min(TPI_MAX_OP_ARGS);
        let mut args = [0; TPI_MAX_OP_ARGS];
        args[..nb_args].copy_from_slice(&operands[..nb_args]);
        Self {
            kind: kind.code(),
            nb_args: nb_args as u8,
            pc,
            position,
            args,
        }
    }

    pub fn kind(&self) -> Option<OpKind> {
        OpKind::from_code(self.kind)
    }

    pub fn args(&self) -> &[u64] {
        &self.args[..(self.nb_args as usize).min(TPI_MAX_OP_ARGS)]
    }
}
