//! AMD64 barrier leaves
//!
//! Flag tests take a 32-bit immediate, so every GC-state mask is tested with
//! a single `test`. The cset lookup and the SATB slot computation use memory
//! operands directly.

use shen_lir::{
    Address, AluOp, CodeBuffer, Condition, Instruction, Isa, Label, Operand, Reg, Width,
};

use crate::error::Result;
use crate::ops::{BarrierTargetOps, ScratchPool};

pub struct Amd64Ops<'a> {
    code: &'a mut CodeBuffer,
    scratch: ScratchPool,
}

impl<'a> Amd64Ops<'a> {
    pub fn new(code: &'a mut CodeBuffer) -> Self {
        debug_assert_eq!(code.isa(), Isa::Amd64);
        Self { code, scratch: ScratchPool::new(Isa::Amd64) }
    }

    fn test_imm(&mut self, value: Reg, mask: u8) -> Result<()> {
        self.emit(Instruction::Test {
            width: Width::W32,
            lhs: Operand::Reg(value),
            rhs: Operand::Imm(mask as i64),
        })
    }

    fn test_self(&mut self, width: Width, reg: Reg) -> Result<()> {
        self.emit(Instruction::Test { width, lhs: Operand::Reg(reg), rhs: Operand::Reg(reg) })
    }
}

impl BarrierTargetOps for Amd64Ops<'_> {
    fn isa(&self) -> Isa {
        Isa::Amd64
    }

    fn code(&mut self) -> &mut CodeBuffer {
        self.code
    }

    fn scratch(&mut self) -> &mut ScratchPool {
        &mut self.scratch
    }

    fn scratch_in_use(&self) -> usize {
        self.scratch.in_use()
    }

    fn branch_if_any_set(&mut self, value: Reg, mask: u8, target: Label) -> Result<()> {
        self.test_imm(value, mask)?;
        self.branch(Condition::Ne, target)
    }

    fn branch_if_none_set(&mut self, value: Reg, mask: u8, target: Label) -> Result<()> {
        self.test_imm(value, mask)?;
        self.branch(Condition::Eq, target)
    }

    fn branch_if_zero(&mut self, width: Width, reg: Reg, target: Label) -> Result<()> {
        self.test_self(width, reg)?;
        self.branch(Condition::Eq, target)
    }

    fn branch_if_nonzero(&mut self, width: Width, reg: Reg, target: Label) -> Result<()> {
        self.test_self(width, reg)?;
        self.branch(Condition::Ne, target)
    }

    fn branch_if_in_cset(&mut self, table: Reg, index: Reg, target: Label) -> Result<()> {
        self.alu_reg(AluOp::Add, Width::W64, index, table)?;
        self.emit(Instruction::Cmp {
            width: Width::W8,
            lhs: Operand::Mem(Address::base(index)),
            rhs: Operand::Imm(0),
        })?;
        self.branch(Condition::Ne, target)
    }

    fn materialize_address(&mut self, dst: Reg, addr: &Address) -> Result<()> {
        self.emit(Instruction::Lea { dst, addr: *addr })
    }

    /// Always recomputed with `lea`
    fn address_register(&mut self, addr: &Address, spare: Reg) -> Result<Reg> {
        self.materialize_address(spare, addr)?;
        Ok(spare)
    }

    fn add_thread_word(&mut self, dst: Reg, offset: i32) -> Result<()> {
        let slot = self.thread_address(offset);
        self.emit(Instruction::Alu {
            op: AluOp::Add,
            width: Width::W64,
            dst,
            lhs: dst,
            rhs: Operand::Mem(slot),
        })
    }

    fn pre_write_out_of_line(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shen_lir::amd64::*;

    #[test]
    fn test_combined_mask_is_one_test() {
        let mut code = CodeBuffer::new(Isa::Amd64);
        let target = code.new_label();
        {
            let mut ops = Amd64Ops::new(&mut code);
            ops.branch_if_any_set(RCX, 0x11, target).unwrap();
            ops.bind(target).unwrap();
        }
        let program = code.finish().unwrap();
        let listing = program.listing().to_string();
        assert!(listing.contains("test ecx, 0x11"), "{}", listing);
        assert_eq!(program.count(|i| matches!(i, Instruction::Test { .. })), 1);
    }

    #[test]
    fn test_cset_lookup_uses_memory_compare() {
        let mut code = CodeBuffer::new(Isa::Amd64);
        let target = code.new_label();
        {
            let mut ops = Amd64Ops::new(&mut code);
            ops.branch_if_in_cset(RCX, RDX, target).unwrap();
            ops.bind(target).unwrap();
        }
        let listing = code.finish().unwrap().listing().to_string();
        assert!(listing.contains("add rdx, rcx"), "{}", listing);
        assert!(listing.contains("cmp byte ptr [rdx], 0x0"), "{}", listing);
    }

    #[test]
    fn test_address_always_recomputed() {
        let mut code = CodeBuffer::new(Isa::Amd64);
        let mut ops = Amd64Ops::new(&mut code);
        let reg = ops.address_register(&Address::base(RSI), RDI).unwrap();
        assert_eq!(reg, RDI);
        assert_eq!(code.instruction_count(), 1);
    }
}
