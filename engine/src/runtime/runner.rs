//! Replays sealed blocks on a virtual CPU thread
//!
//! Only what the injected instrumentation needs is evaluated: constant
//! loads, 64-bit adds and zero extension into temps, and helper calls.
//! Guest memory ops load zero and store nothing.
//!
//! Plugin helpers inlined through the emitter run under the registry's
//! callback guard, like the block helper.

use smallvec::SmallVec;

use tpi_plugin::{HelperInfo, OpKind, INVALID, TPI_MAX_HELPER_ARGS};

use crate::codegen::{
    Code, GeneratedBlock, HostWordSize, HELPER_PLUGIN_FN, HELPER_PLUGIN_TB, HELPER_PLUGIN_TB2,
};
use crate::registry::PluginRegistry;

pub struct BlockRunner<'r> {
    registry: &'r PluginRegistry,
    temps: Vec<u64>,
    word: HostWordSize,
    helper_calls: u64,
}

impl<'r> BlockRunner<'r> {
    pub fn new(registry: &'r PluginRegistry) -> Self {
        Self {
            registry,
            temps: Vec::new(),
            word: registry.engine().host_word,
            helper_calls: 0,
        }
    }

    /// Number of plugin helper calls performed so far.
    pub fn helper_calls(&self) -> u64 {
        self.helper_calls
    }

    /// Execute one block.
    pub fn run(&mut self, block: &GeneratedBlock) {
        self.word = block.code.word();
        self.temps.clear();
        self.temps.resize(block.code.temps() as usize + 2, 0);

        for op in block.code.ops() {
            match op.kind {
                OpKind::MovI32 => {
                    if let &[t, imm, ..] = op.args {
                        self.set_raw(t, imm & 0xffff_ffff);
                    }
                }
                OpKind::MovI64 => {
                    if let &[t, imm, ..] = op.args {
                        self.write(t, imm);
                    }
                }
                OpKind::Add64 => {
                    if let &[d, a, b, ..] = op.args {
                        let value = self.read(a).wrapping_add(self.read(b));
                        self.write(d, value);
                    }
                }
                OpKind::ExtU32 => {
                    if let &[d, s, ..] = op.args {
                        let value = self.read(s) & 0xffff_ffff;
                        self.write(d, value);
                    }
                }
                OpKind::GuestLoad => {
                    if let &[d, ..] = op.args {
                        self.write(d, 0);
                    }
                }
                OpKind::Call => match op.args {
                    [HELPER_PLUGIN_FN, index, ret, args @ ..] => {
                        self.call_plugin_helper(&block.code, *index, *ret, args);
                    }
                    [helper, temps @ ..] => {
                        let values: SmallVec<[u64; 4]> =
                            temps.iter().map(|&t| self.read(t)).collect();
                        self.call(*helper, &values);
                    }
                    [] => {}
                },
                OpKind::Nop
                | OpKind::InsnStart
                | OpKind::GuestStore
                | OpKind::ExitTb => {}
            }
        }
    }

    fn call(&mut self, helper: u64, values: &[u64]) {
        match (helper, values) {
            (HELPER_PLUGIN_TB, [address, info, ..]) => {
                self.helper_calls += 1;
                self.registry
                    .call_tb_helper(HelperInfo::from_bits(*info), *address, 0, 0);
            }
            (HELPER_PLUGIN_TB2, [address, info, data1, data2, ..]) => {
                self.helper_calls += 1;
                self.registry.call_tb_helper(
                    HelperInfo::from_bits(*info),
                    *address,
                    *data1,
                    *data2,
                );
            }
            _ => log::trace!("helper {} with {} operands ignored", helper, values.len()),
        }
    }

    fn call_plugin_helper(&mut self, code: &Code, index: u64, ret: u64, args: &[u64]) {
        let Some(helper) = code.helper(index as usize) else {
            log::warn!("call to unknown plugin helper #{}", index);
            return;
        };

        let mut values = [0u64; TPI_MAX_HELPER_ARGS];
        for (value, &temp) in values.iter_mut().zip(args) {
            *value = self.read(temp);
        }

        self.helper_calls += 1;
        let result = self
            .registry
            .guard()
            .call(|| helper(values[0], values[1], values[2]));
        if let Some(result) = result {
            if ret != INVALID as u64 {
                self.write(ret, result);
            }
        }
    }

    fn set_raw(&mut self, index: u64, value: u64) {
        if let Some(slot) = self.temps.get_mut(index as usize) {
            *slot = value;
        }
    }

    fn raw(&self, index: u64) -> u64 {
        self.temps.get(index as usize).copied().unwrap_or(0)
    }

    fn read(&self, temp: u64) -> u64 {
        match self.word {
            HostWordSize::W64 => self.raw(temp),
            HostWordSize::W32 => self.raw(temp) | (self.raw(temp + 1) << 32),
        }
    }

    fn write(&mut self, temp: u64, value: u64) {
        match self.word {
            HostWordSize::W64 => self.set_raw(temp, value),
            HostWordSize::W32 => {
                self.set_raw(temp, value & 0xffff_ffff);
                self.set_raw(temp + 1, value >> 32);
            }
        }
    }
}
