//! Foreign call conventions
//!
//! A convention says where each argument goes and where the result comes
//! back. Runtime stubs either take their operands in ABI registers or in
//! outgoing stack slots addressed from the stack pointer.

use crate::aarch64::Aapcs64;
use crate::amd64::SystemVAbi;
use crate::lir::Address;
use crate::reg::{Isa, Reg};

/// Where a call operand lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLocation {
    Register(Reg),
    /// Byte offset from the stack pointer
    Stack(i32),
}

impl ValueLocation {
    /// Memory address of a stack location
    pub fn address(&self, isa: Isa) -> Option<Address> {
        match self {
            ValueLocation::Register(_) => None,
            ValueLocation::Stack(offset) => Some(Address::with_disp(isa.stack_pointer(), *offset)),
        }
    }
}

/// Argument and return locations of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingConvention {
    args: Vec<ValueLocation>,
    ret: Option<ValueLocation>,
}

impl CallingConvention {
    pub fn new(args: Vec<ValueLocation>, ret: Option<ValueLocation>) -> Self {
        Self { args, ret }
    }

    /// Native ABI register convention
    pub fn native(isa: Isa, arg_count: usize, has_return: bool) -> Self {
        let (arg_reg, ret_reg): (fn(usize) -> Option<Reg>, Reg) = match isa {
            Isa::Amd64 => (SystemVAbi::get_arg_register, SystemVAbi::RET_REG),
            Isa::AArch64 => (Aapcs64::get_arg_register, Aapcs64::RET_REG),
        };
        let args = (0..arg_count)
            .map(|i| match arg_reg(i) {
                Some(reg) => ValueLocation::Register(reg),
                None => ValueLocation::Stack(Self::stack_arg_offset(isa, i)),
            })
            .collect();
        Self { args, ret: has_return.then_some(ValueLocation::Register(ret_reg)) }
    }

    /// Every argument in its own outgoing stack slot; the result comes back in
    /// the first slot
    pub fn stack_slots(isa: Isa, arg_count: usize, has_return: bool) -> Self {
        let word = isa.word_size() as i32;
        let args = (0..arg_count).map(|i| ValueLocation::Stack(i as i32 * word)).collect();
        Self { args, ret: has_return.then_some(ValueLocation::Stack(0)) }
    }

    fn stack_arg_offset(isa: Isa, index: usize) -> i32 {
        let first_stack_idx = match isa {
            Isa::Amd64 => SystemVAbi::ARG_REGS.len(),
            Isa::AArch64 => Aapcs64::ARG_REGS.len(),
        };
        ((index - first_stack_idx) as i32) * isa.word_size() as i32
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn argument(&self, index: usize) -> Option<ValueLocation> {
        self.args.get(index).copied()
    }

    pub fn arguments(&self) -> &[ValueLocation] {
        &self.args
    }

    pub fn return_location(&self) -> Option<ValueLocation> {
        self.ret
    }

    /// Registers written by the caller to set up the call
    pub fn argument_registers(&self) -> impl Iterator<Item = Reg> + '_ {
        self.args.iter().filter_map(|loc| match loc {
            ValueLocation::Register(reg) => Some(*reg),
            ValueLocation::Stack(_) => None,
        })
    }
}
