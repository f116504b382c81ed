//! Reference interpreter for assembled programs
//!
//! Executes a [`Program`] against a register file and a set of mapped memory
//! regions. Calls are handed to a [`ForeignCallHandler`], which plays the
//! role of the runtime. Any access outside a mapped region faults, so an
//! emitter that writes past a buffer is caught rather than silently
//! corrupting neighbouring state.

use thiserror::Error;

use crate::buffer::{BlockKind, Program};
use crate::lir::{Address, AluOp, CallTarget, Condition, Instruction, Operand};
use crate::reg::{Reg, Width};

/// Error raised while executing a program
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpError {
    #[error("memory fault: {width}-bit access at {addr:#x}")]
    Fault { addr: u64, width: u32 },

    #[error("region '{name}' overlaps an existing mapping")]
    Overlap { name: String },

    #[error("step limit of {0} exceeded")]
    StepLimit(usize),

    /// **When returned:** the call handler rejected a call or its operands
    #[error("stub {name} failed: {message}")]
    Stub { name: &'static str, message: String },

    #[error("branch to unresolved label")]
    BadBranch,
}

pub type Result<T> = std::result::Result<T, InterpError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// One recorded memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    pub kind: AccessKind,
    pub addr: u64,
    pub width: Width,
}

#[derive(Debug, Clone)]
struct Region {
    name: String,
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }
}

/// Sparse little-endian memory made of named regions
#[derive(Debug, Clone, Default)]
pub struct Memory {
    regions: Vec<Region>,
    trace: Option<Vec<MemoryAccess>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` zeroed bytes at `base`
    pub fn map(&mut self, name: &str, base: u64, size: usize) -> Result<()> {
        let end = base + size as u64;
        if self.regions.iter().any(|r| base < r.end() && r.base < end) {
            return Err(InterpError::Overlap { name: name.to_string() });
        }
        self.regions.push(Region { name: name.to_string(), base, bytes: vec![0; size] });
        Ok(())
    }

    /// Base and size of the region called `name`
    pub fn region(&self, name: &str) -> Option<(u64, usize)> {
        self.regions
            .iter()
            .find(|r| r.name == name)
            .map(|r| (r.base, r.bytes.len()))
    }

    pub fn is_mapped(&self, addr: u64, len: u64) -> bool {
        self.regions.iter().any(|r| addr >= r.base && addr + len <= r.end())
    }

    /// Start recording every access made by the program
    pub fn enable_trace(&mut self) {
        self.trace = Some(Vec::new());
    }

    pub fn trace(&self) -> &[MemoryAccess] {
        self.trace.as_deref().unwrap_or(&[])
    }

    pub fn take_trace(&mut self) -> Vec<MemoryAccess> {
        self.trace.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Number of recorded reads touching `addr`
    pub fn reads_of(&self, addr: u64) -> usize {
        self.trace()
            .iter()
            .filter(|a| {
                a.kind == AccessKind::Read && addr >= a.addr && addr < a.addr + a.width.bytes() as u64
            })
            .count()
    }

    pub fn writes_to(&self, lo: u64, hi: u64) -> usize {
        self.trace()
            .iter()
            .filter(|a| a.kind == AccessKind::Write && a.addr >= lo && a.addr < hi)
            .count()
    }

    fn locate(&self, addr: u64, width: Width) -> Result<(usize, usize)> {
        let len = width.bytes() as u64;
        self.regions
            .iter()
            .position(|r| addr >= r.base && addr.checked_add(len).is_some_and(|e| e <= r.end()))
            .map(|i| (i, (addr - self.regions[i].base) as usize))
            .ok_or(InterpError::Fault { addr, width: width.bits() })
    }

    fn record(&mut self, kind: AccessKind, addr: u64, width: Width) {
        if let Some(trace) = self.trace.as_mut() {
            trace.push(MemoryAccess { kind, addr, width });
        }
    }

    /// Zero-extending load
    pub fn read(&mut self, addr: u64, width: Width) -> Result<u64> {
        let (region, offset) = self.locate(addr, width)?;
        self.record(AccessKind::Read, addr, width);
        Ok(self.peek_at(region, offset, width))
    }

    pub fn write(&mut self, addr: u64, width: Width, value: u64) -> Result<()> {
        let (region, offset) = self.locate(addr, width)?;
        self.record(AccessKind::Write, addr, width);
        let bytes = value.to_le_bytes();
        let n = width.bytes() as usize;
        self.regions[region].bytes[offset..offset + n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// Read without recording, for inspection by tests and runtimes
    pub fn peek(&self, addr: u64, width: Width) -> Result<u64> {
        let (region, offset) = self.locate(addr, width)?;
        Ok(self.peek_at(region, offset, width))
    }

    /// Write without recording
    pub fn poke(&mut self, addr: u64, width: Width, value: u64) -> Result<()> {
        let (region, offset) = self.locate(addr, width)?;
        let bytes = value.to_le_bytes();
        let n = width.bytes() as usize;
        self.regions[region].bytes[offset..offset + n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    fn peek_at(&self, region: usize, offset: usize, width: Width) -> u64 {
        let n = width.bytes() as usize;
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(&self.regions[region].bytes[offset..offset + n]);
        u64::from_le_bytes(buf)
    }
}

/// Condition flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub zero: bool,
    pub sign: bool,
    pub carry: bool,
    pub overflow: bool,
}

impl Flags {
    pub fn holds(&self, cond: Condition) -> bool {
        match cond {
            Condition::Eq => self.zero,
            Condition::Ne => !self.zero,
            Condition::Lt => self.sign != self.overflow,
            Condition::Ge => self.sign == self.overflow,
            Condition::Gt => !self.zero && self.sign == self.overflow,
            Condition::Le => self.zero || self.sign != self.overflow,
            Condition::Below => self.carry,
            Condition::AboveEq => !self.carry,
        }
    }
}

/// Register file, flags and memory
#[derive(Debug, Clone)]
pub struct Machine {
    regs: [u64; 32],
    pub flags: Flags,
    pub memory: Memory,
}

impl Machine {
    pub fn new(memory: Memory) -> Self {
        Self { regs: [0; 32], flags: Flags::default(), memory }
    }

    pub fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg.index() & 31]
    }

    pub fn set_reg(&mut self, reg: Reg, value: u64) {
        self.regs[reg.index() & 31] = value;
    }

    pub fn effective_address(&self, addr: &Address) -> u64 {
        let index = addr.index.map_or(0, |r| self.reg(r) << addr.shift);
        self.reg(addr.base)
            .wrapping_add(index)
            .wrapping_add(addr.disp as i64 as u64)
    }

    fn operand(&mut self, op: &Operand, width: Width) -> Result<u64> {
        Ok(match op {
            Operand::Reg(reg) => self.reg(*reg) & width.mask(),
            Operand::Imm(imm) => (*imm as u64) & width.mask(),
            Operand::Mem(addr) => {
                let ea = self.effective_address(addr);
                self.memory.read(ea, width)?
            }
        })
    }
}

/// Services `Call` instructions on behalf of the runtime
pub trait ForeignCallHandler {
    fn call(&mut self, target: &CallTarget, machine: &mut Machine) -> Result<()>;
}

/// Handler that accepts every call and does nothing
pub struct NoopCalls;

impl ForeignCallHandler for NoopCalls {
    fn call(&mut self, _target: &CallTarget, _machine: &mut Machine) -> Result<()> {
        Ok(())
    }
}

/// What happened during a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub steps: usize,
    pub calls: Vec<CallTarget>,
    /// Transfers of control into a mid-path or slow-path block
    pub out_of_line_entries: usize,
    pub mid_path_entries: usize,
    pub slow_path_entries: usize,
}

impl ExecStats {
    pub fn called(&self, name: &str) -> usize {
        self.calls.iter().filter(|c| c.name == name).count()
    }
}

/// Runs programs to completion
#[derive(Debug, Clone, Copy)]
pub struct Interpreter {
    step_limit: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self { step_limit: 100_000 }
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step_limit(step_limit: usize) -> Self {
        Self { step_limit }
    }

    /// Execute from the start of the main block until control falls through
    /// its last instruction
    pub fn run(
        &self,
        program: &Program,
        machine: &mut Machine,
        handler: &mut dyn ForeignCallHandler,
    ) -> Result<ExecStats> {
        let code = program.instructions();
        let main_end = program.main_block().end;
        let mut stats = ExecStats::default();
        let mut pc = 0usize;
        if main_end == 0 {
            return Ok(stats);
        }

        loop {
            if stats.steps >= self.step_limit {
                return Err(InterpError::StepLimit(self.step_limit));
            }
            stats.steps += 1;
            let inst = code.get(pc).ok_or(InterpError::BadBranch)?;
            let mut next = pc + 1;

            match inst {
                Instruction::Label(_) => {}
                Instruction::Mov { dst, src } => {
                    let value = machine.reg(*src);
                    machine.set_reg(*dst, value);
                }
                Instruction::MovImm { dst, imm } => machine.set_reg(*dst, *imm),
                Instruction::Load { width, dst, addr } => {
                    let ea = machine.effective_address(addr);
                    let value = machine.memory.read(ea, *width)?;
                    machine.set_reg(*dst, value);
                }
                Instruction::Store { width, src, addr } => {
                    let ea = machine.effective_address(addr);
                    let value = machine.reg(*src) & width.mask();
                    machine.memory.write(ea, *width, value)?;
                }
                Instruction::Lea { dst, addr } => {
                    let ea = machine.effective_address(addr);
                    machine.set_reg(*dst, ea);
                }
                Instruction::Alu { op, width, dst, lhs, rhs } => {
                    let a = machine.reg(*lhs) & width.mask();
                    let b = machine.operand(rhs, *width)?;
                    let shift = (b as u32) & (width.bits() - 1);
                    let result = match op {
                        AluOp::Add => a.wrapping_add(b),
                        AluOp::Sub => a.wrapping_sub(b),
                        AluOp::And => a & b,
                        AluOp::Shl => a << shift,
                        AluOp::Shr => a >> shift,
                    };
                    machine.set_reg(*dst, result & width.mask());
                }
                Instruction::Test { width, lhs, rhs } => {
                    let a = machine.operand(lhs, *width)?;
                    let b = machine.operand(rhs, *width)?;
                    let r = a & b;
                    machine.flags = Flags {
                        zero: r == 0,
                        sign: r & width.sign_bit() != 0,
                        carry: false,
                        overflow: false,
                    };
                }
                Instruction::Cmp { width, lhs, rhs } => {
                    let a = machine.operand(lhs, *width)?;
                    let b = machine.operand(rhs, *width)?;
                    let r = a.wrapping_sub(b) & width.mask();
                    machine.flags = Flags {
                        zero: r == 0,
                        sign: r & width.sign_bit() != 0,
                        carry: a < b,
                        overflow: ((a ^ b) & (a ^ r) & width.sign_bit()) != 0,
                    };
                }
                Instruction::Jcc { cond, target } => {
                    if machine.flags.holds(*cond) {
                        next = program.label_position(*target).ok_or(InterpError::BadBranch)?;
                    }
                }
                Instruction::Jmp { target } => {
                    next = program.label_position(*target).ok_or(InterpError::BadBranch)?;
                }
                Instruction::Cbz { width, reg, target } => {
                    if machine.reg(*reg) & width.mask() == 0 {
                        next = program.label_position(*target).ok_or(InterpError::BadBranch)?;
                    }
                }
                Instruction::Cbnz { width, reg, target } => {
                    if machine.reg(*reg) & width.mask() != 0 {
                        next = program.label_position(*target).ok_or(InterpError::BadBranch)?;
                    }
                }
                Instruction::Call { target, .. } => {
                    stats.calls.push(*target);
                    handler.call(target, machine)?;
                }
            }

            if next != pc + 1 {
                let from = program.block_at(pc).map(|b| b.start);
                if let Some(block) = program.block_at(next) {
                    if Some(block.start) != from && block.kind.is_out_of_line() {
                        stats.out_of_line_entries += 1;
                        match block.kind {
                            BlockKind::MidPath => stats.mid_path_entries += 1,
                            BlockKind::SlowPath => stats.slow_path_entries += 1,
                            BlockKind::Main => {}
                        }
                    }
                }
            }
            if next == main_end && next == pc + 1 {
                break;
            }
            pc = next;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amd64::{RAX, RCX};
    use crate::buffer::CodeBuffer;
    use crate::reg::Isa;

    #[test]
    fn test_memory_faults_outside_regions() {
        let mut mem = Memory::new();
        mem.map("data", 0x1000, 16).unwrap();
        assert!(mem.write(0x1008, Width::W64, 7).is_ok());
        assert_eq!(mem.read(0x1008, Width::W64).unwrap(), 7);
        assert_eq!(
            mem.read(0x100c, Width::W64),
            Err(InterpError::Fault { addr: 0x100c, width: 64 })
        );
        assert!(mem.write(0xff8, Width::W64, 1).is_err());
    }

    #[test]
    fn test_overlapping_map_rejected() {
        let mut mem = Memory::new();
        mem.map("a", 0x1000, 0x100).unwrap();
        assert!(mem.map("b", 0x10f0, 0x100).is_err());
        assert!(mem.map("c", 0x1100, 0x100).is_ok());
    }

    #[test]
    fn test_trace_records_reads() {
        let mut mem = Memory::new();
        mem.map("data", 0x1000, 16).unwrap();
        mem.enable_trace();
        mem.read(0x1000, Width::W8).unwrap();
        mem.peek(0x1000, Width::W8).unwrap();
        assert_eq!(mem.reads_of(0x1000), 1);
        assert_eq!(mem.reads_of(0x1001), 0);
    }

    #[test]
    fn test_compare_flags() {
        let mut machine = Machine::new(Memory::new());
        machine.set_reg(RAX, 1);
        machine.set_reg(RCX, 2);
        let mut buf = CodeBuffer::new(Isa::Amd64);
        buf.emit(Instruction::Cmp {
            width: Width::W64,
            lhs: Operand::Reg(RAX),
            rhs: Operand::Reg(RCX),
        })
        .unwrap();
        let program = buf.finish().unwrap();
        Interpreter::new().run(&program, &mut machine, &mut NoopCalls).unwrap();
        assert!(machine.flags.holds(Condition::Below));
        assert!(machine.flags.holds(Condition::Lt));
        assert!(machine.flags.holds(Condition::Ne));
        assert!(!machine.flags.holds(Condition::AboveEq));
    }

    #[test]
    fn test_step_limit() {
        let mut buf = CodeBuffer::new(Isa::Amd64);
        let top = buf.new_label();
        buf.bind(top).unwrap();
        buf.emit(Instruction::Jmp { target: top }).unwrap();
        let program = buf.finish().unwrap();
        let mut machine = Machine::new(Memory::new());
        let result = Interpreter::with_step_limit(50).run(&program, &mut machine, &mut NoopCalls);
        assert_eq!(result, Err(InterpError::StepLimit(50)));
    }
}
