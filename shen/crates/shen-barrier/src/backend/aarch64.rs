//! AArch64 barrier leaves
//!
//! `tst` only takes bitmask immediates. Masks without an encoding, such as
//! the weak-strength `HAS_FORWARDED | WEAK_ROOTS`, are tested one bit at a
//! time. Null checks and the cset lookup use compare-and-branch.

use shen_lir::aarch64::is_logical_immediate;
use shen_lir::{
    Address, AluOp, CodeBuffer, Condition, Instruction, Isa, Label, LirError, Operand, Reg, Width,
};

use crate::error::Result;
use crate::ops::{BarrierTargetOps, ScratchPool};

pub struct AArch64Ops<'a> {
    code: &'a mut CodeBuffer,
    scratch: ScratchPool,
}

impl<'a> AArch64Ops<'a> {
    pub fn new(code: &'a mut CodeBuffer) -> Self {
        debug_assert_eq!(code.isa(), Isa::AArch64);
        Self { code, scratch: ScratchPool::new(Isa::AArch64) }
    }

    fn tst(&mut self, value: Reg, mask: u64) -> Result<()> {
        self.emit(Instruction::Test {
            width: Width::W32,
            lhs: Operand::Reg(value),
            rhs: Operand::Imm(mask as i64),
        })
    }
}

impl BarrierTargetOps for AArch64Ops<'_> {
    fn isa(&self) -> Isa {
        Isa::AArch64
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
        let mask = mask as u64;
        if is_logical_immediate(mask, Width::W32) {
            self.tst(value, mask)?;
            return self.branch(Condition::Ne, target);
        }
        for bit in (0..8).map(|i| 1u64 << i).filter(|b| mask & b != 0) {
            self.tst(value, bit)?;
            self.branch(Condition::Ne, target)?;
        }
        Ok(())
    }

    fn branch_if_none_set(&mut self, value: Reg, mask: u8, target: Label) -> Result<()> {
        if is_logical_immediate(mask as u64, Width::W32) {
            self.tst(value, mask as u64)?;
            return self.branch(Condition::Eq, target);
        }
        let skip = self.new_label();
        self.branch_if_any_set(value, mask, skip)?;
        self.jump(target)?;
        self.bind(skip)
    }

    fn branch_if_zero(&mut self, width: Width, reg: Reg, target: Label) -> Result<()> {
        self.emit(Instruction::Cbz { width, reg, target })
    }

    fn branch_if_nonzero(&mut self, width: Width, reg: Reg, target: Label) -> Result<()> {
        self.emit(Instruction::Cbnz { width, reg, target })
    }

    fn branch_if_in_cset(&mut self, table: Reg, index: Reg, target: Label) -> Result<()> {
        self.load(Width::W8, index, Address::indexed(table, index, 0))?;
        self.branch_if_nonzero(Width::W8, index, target)
    }

    fn materialize_address(&mut self, dst: Reg, addr: &Address) -> Result<()> {
        // add with a shifted register has no displacement: split it
        let Some(index) = addr.index.filter(|_| addr.disp != 0) else {
            return self.emit(Instruction::Lea { dst, addr: *addr });
        };
        self.emit(Instruction::Lea { dst, addr: Address::indexed(addr.base, index, addr.shift) })?;
        let (op, imm) = if addr.disp < 0 {
            (AluOp::Sub, -(addr.disp as i64))
        } else {
            (AluOp::Add, addr.disp as i64)
        };
        if imm > 4095 {
            return Err(LirError::Unencodable {
                isa: Isa::AArch64,
                reason: format!("displacement {} with index register", addr.disp),
            }
            .into());
        }
        self.alu_imm(op, Width::W64, dst, imm)
    }

    /// A base-only address is passed in its base register
    fn address_register(&mut self, addr: &Address, spare: Reg) -> Result<Reg> {
        if addr.is_base_only() {
            return Ok(addr.base);
        }
        self.materialize_address(spare, addr)?;
        Ok(spare)
    }

    fn add_thread_word(&mut self, dst: Reg, offset: i32) -> Result<()> {
        let word = self.acquire_scratch()?;
        let slot = self.thread_address(offset);
        self.load(Width::W64, word, slot)?;
        self.alu_reg(AluOp::Add, Width::W64, dst, word)?;
        self.release_scratch(word)
    }

    fn pre_write_out_of_line(&self) -> bool {
        true
    }

    /// `lsr` has a three-register form
    fn shift_right(&mut self, dst: Reg, src: Reg, amount: u8) -> Result<()> {
        self.emit(Instruction::Alu {
            op: AluOp::Shr,
            width: Width::W64,
            dst,
            lhs: src,
            rhs: Operand::Imm(amount as i64),
        })
    }
}
