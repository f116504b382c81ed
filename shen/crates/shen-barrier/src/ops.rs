//! Target operations used by the barrier templates
//!
//! The barrier algorithms are written once against [`BarrierTargetOps`].
//! A backend supplies the code buffer, the scratch pool and the handful of
//! leaf operations whose best encoding differs between instruction sets;
//! everything else has a portable default built from plain LIR.

use shen_lir::{
    Address, AluOp, BlockId, BlockKind, CodeBuffer, Condition, Instruction, Isa, Label, Operand,
    Reg, RegSet, ValueLocation, Width,
};

use crate::config::OopEncoding;
use crate::error::{BarrierError, Result};
use crate::stubs::{StubDescriptor, StubReach};

/// Allocator over the registers the backend reserves for emitters
#[derive(Debug, Clone)]
pub struct ScratchPool {
    isa: Isa,
    held: RegSet,
}

impl ScratchPool {
    pub fn new(isa: Isa) -> Self {
        Self { isa, held: RegSet::empty() }
    }

    /// Lowest free scratch register
    pub fn acquire(&mut self) -> Result<Reg> {
        let reg = self
            .isa
            .reserved_scratch()
            .iter()
            .copied()
            .find(|r| !self.held.contains(*r))
            .ok_or(BarrierError::ScratchExhausted { isa: self.isa })?;
        self.held.insert(reg);
        Ok(reg)
    }

    pub fn release(&mut self, reg: Reg) -> Result<()> {
        if !self.held.contains(reg) {
            return Err(BarrierError::Internal(format!(
                "releasing {} which is not held",
                self.isa.reg_name(reg, Width::W64)
            )));
        }
        self.held.remove(reg);
        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.held.len()
    }

    pub fn available(&self) -> usize {
        self.isa.reserved_scratch().len() - self.held.len()
    }
}

/// Instruction-level operations a barrier template is expressed in
pub trait BarrierTargetOps {
    fn isa(&self) -> Isa;

    fn code(&mut self) -> &mut CodeBuffer;

    fn scratch(&mut self) -> &mut ScratchPool;

    fn scratch_in_use(&self) -> usize;

    // ------------------------------------------------------------------
    // ISA leaves
    // ------------------------------------------------------------------

    /// Branch to `target` if any bit of `mask` is set in the low byte of `value`
    fn branch_if_any_set(&mut self, value: Reg, mask: u8, target: Label) -> Result<()>;

    /// Branch to `target` if no bit of `mask` is set in the low byte of `value`
    fn branch_if_none_set(&mut self, value: Reg, mask: u8, target: Label) -> Result<()>;

    fn branch_if_zero(&mut self, width: Width, reg: Reg, target: Label) -> Result<()>;

    fn branch_if_nonzero(&mut self, width: Width, reg: Reg, target: Label) -> Result<()>;

    /// `table` holds the biased cset base, `index` the region index of the
    /// object; branch to `target` if the region is in the collection set.
    /// Clobbers `index`.
    fn branch_if_in_cset(&mut self, table: Reg, index: Reg, target: Label) -> Result<()>;

    /// `dst = &addr`
    fn materialize_address(&mut self, dst: Reg, addr: &Address) -> Result<()>;

    /// Register holding the value of `addr`, computed into `spare` if needed
    fn address_register(&mut self, addr: &Address, spare: Reg) -> Result<Reg>;

    /// `dst += [thread + offset]`
    fn add_thread_word(&mut self, dst: Reg, offset: i32) -> Result<()>;

    /// Everything after the marking test of a pre-write barrier goes out of line
    fn pre_write_out_of_line(&self) -> bool;

    // ------------------------------------------------------------------
    // Code buffer
    // ------------------------------------------------------------------

    fn emit(&mut self, inst: Instruction) -> Result<()> {
        self.code().emit(inst).map_err(BarrierError::from)
    }

    fn new_label(&mut self) -> Label {
        self.code().new_label()
    }

    fn bind(&mut self, label: Label) -> Result<()> {
        self.code().bind(label).map_err(BarrierError::from)
    }

    /// Create an out-of-line block; returns it with its entry label
    fn out_of_line(&mut self, kind: BlockKind) -> Result<(BlockId, Label)> {
        let id = self.code().new_block(kind);
        let label = self.code().block_label(id)?;
        log::trace!("{}: new {} block {}", self.isa(), kind, label);
        Ok((id, label))
    }

    fn switch_to(&mut self, id: BlockId) -> Result<BlockId> {
        self.code().switch_to(id).map_err(BarrierError::from)
    }

    fn current_block(&mut self) -> BlockId {
        self.code().current_block()
    }

    fn acquire_scratch(&mut self) -> Result<Reg> {
        self.scratch().acquire()
    }

    fn release_scratch(&mut self, reg: Reg) -> Result<()> {
        self.scratch().release(reg)
    }

    // ------------------------------------------------------------------
    // Portable operations
    // ------------------------------------------------------------------

    fn mov(&mut self, dst: Reg, src: Reg) -> Result<()> {
        if dst == src {
            return Ok(());
        }
        self.emit(Instruction::Mov { dst, src })
    }

    fn mov_imm(&mut self, dst: Reg, imm: u64) -> Result<()> {
        self.emit(Instruction::MovImm { dst, imm })
    }

    fn load(&mut self, width: Width, dst: Reg, addr: Address) -> Result<()> {
        self.emit(Instruction::Load { width, dst, addr })
    }

    fn store(&mut self, width: Width, src: Reg, addr: Address) -> Result<()> {
        self.emit(Instruction::Store { width, src, addr })
    }

    fn jump(&mut self, target: Label) -> Result<()> {
        self.emit(Instruction::Jmp { target })
    }

    fn branch(&mut self, cond: Condition, target: Label) -> Result<()> {
        self.emit(Instruction::Jcc { cond, target })
    }

    /// `dst = dst op imm`
    fn alu_imm(&mut self, op: AluOp, width: Width, dst: Reg, imm: i64) -> Result<()> {
        self.emit(Instruction::Alu { op, width, dst, lhs: dst, rhs: Operand::Imm(imm) })
    }

    /// `dst = dst op src`
    fn alu_reg(&mut self, op: AluOp, width: Width, dst: Reg, src: Reg) -> Result<()> {
        self.emit(Instruction::Alu { op, width, dst, lhs: dst, rhs: Operand::Reg(src) })
    }

    fn compare(&mut self, width: Width, lhs: Reg, rhs: Reg) -> Result<()> {
        self.emit(Instruction::Cmp { width, lhs: Operand::Reg(lhs), rhs: Operand::Reg(rhs) })
    }

    /// `dst = src >> amount`
    fn shift_right(&mut self, dst: Reg, src: Reg, amount: u8) -> Result<()> {
        self.mov(dst, src)?;
        self.alu_imm(AluOp::Shr, Width::W64, dst, amount as i64)
    }

    fn thread_address(&self, offset: i32) -> Address {
        Address::with_disp(self.isa().thread_register(), offset)
    }

    /// Load the GC-state byte of the current thread
    fn load_gc_state(&mut self, dst: Reg, offset: i32) -> Result<()> {
        let addr = self.thread_address(offset);
        self.load(Width::W8, dst, addr)
    }

    /// Null-preserving `reg = base + (reg << shift)` on a zero-extended
    /// compressed reference
    fn decode_narrow(&mut self, reg: Reg, encoding: &OopEncoding) -> Result<()> {
        if encoding.is_trivial() {
            return Ok(());
        }
        if encoding.base == 0 {
            return self.alu_imm(AluOp::Shl, Width::W64, reg, encoding.shift as i64);
        }
        let done = self.new_label();
        self.branch_if_zero(Width::W32, reg, done)?;
        if encoding.shift != 0 {
            self.alu_imm(AluOp::Shl, Width::W64, reg, encoding.shift as i64)?;
        }
        let heap_base = self.isa().heap_base_register();
        self.alu_reg(AluOp::Add, Width::W64, reg, heap_base)?;
        self.bind(done)
    }

    /// Null-preserving `reg = (reg - base) >> shift`
    fn encode_narrow(&mut self, reg: Reg, encoding: &OopEncoding) -> Result<()> {
        if encoding.is_trivial() {
            return Ok(());
        }
        if encoding.base == 0 {
            return self.alu_imm(AluOp::Shr, Width::W64, reg, encoding.shift as i64);
        }
        let done = self.new_label();
        self.branch_if_zero(Width::W64, reg, done)?;
        let heap_base = self.isa().heap_base_register();
        self.alu_reg(AluOp::Sub, Width::W64, reg, heap_base)?;
        if encoding.shift != 0 {
            self.alu_imm(AluOp::Shr, Width::W64, reg, encoding.shift as i64)?;
        }
        self.bind(done)
    }

    /// Move `src` into an argument location
    fn move_to_location(&mut self, loc: ValueLocation, src: Reg) -> Result<()> {
        match loc {
            ValueLocation::Register(reg) => self.mov(reg, src),
            ValueLocation::Stack(offset) => {
                let addr = Address::with_disp(self.isa().stack_pointer(), offset);
                self.store(Width::W64, src, addr)
            }
        }
    }

    /// Move a return location into `dst`
    fn move_from_location(&mut self, dst: Reg, loc: ValueLocation) -> Result<()> {
        match loc {
            ValueLocation::Register(reg) => self.mov(dst, reg),
            ValueLocation::Stack(offset) => {
                let addr = Address::with_disp(self.isa().stack_pointer(), offset);
                self.load(Width::W64, dst, addr)
            }
        }
    }

    /// Pass the value of `addr` in an argument location
    fn move_address_to_location(&mut self, loc: ValueLocation, addr: &Address) -> Result<()> {
        match loc {
            ValueLocation::Register(reg) => {
                let value = self.address_register(addr, reg)?;
                self.mov(reg, value)
            }
            ValueLocation::Stack(_) => {
                let spare = self.acquire_scratch()?;
                let value = self.address_register(addr, spare)?;
                self.move_to_location(loc, value)?;
                self.release_scratch(spare)
            }
        }
    }

    /// Call a stub; far stubs are reached through `spare` or a pool register
    fn call_stub(&mut self, stub: &StubDescriptor, spare: Option<Reg>) -> Result<()> {
        match (stub.reach, spare) {
            (StubReach::Near, _) => self.emit(Instruction::Call { target: stub.target, scratch: None }),
            (StubReach::Far, Some(reg)) => {
                self.emit(Instruction::Call { target: stub.target, scratch: Some(reg) })
            }
            (StubReach::Far, None) => {
                let reg = self.acquire_scratch()?;
                self.emit(Instruction::Call { target: stub.target, scratch: Some(reg) })?;
                self.release_scratch(reg)
            }
        }
    }
}
