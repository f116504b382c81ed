//! LIR instructions
//!
//! The instruction set is the union of what the barrier emitters need on
//! both targets. Forms that only exist on one ISA (memory operands on AMD64,
//! compare-and-branch on AArch64) are rejected by the per-ISA encodability
//! check when appended to a [`CodeBuffer`](crate::CodeBuffer).

use std::fmt;

use crate::reg::{Reg, Width};

/// Branch target, allocated by a code buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

impl Label {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Memory address: `base + (index << shift) + disp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub base: Reg,
    pub index: Option<Reg>,
    pub shift: u8,
    pub disp: i32,
}

impl Address {
    pub const fn base(base: Reg) -> Self {
        Self { base, index: None, shift: 0, disp: 0 }
    }

    pub const fn with_disp(base: Reg, disp: i32) -> Self {
        Self { base, index: None, shift: 0, disp }
    }

    pub const fn indexed(base: Reg, index: Reg, shift: u8) -> Self {
        Self { base, index: Some(index), shift, disp: 0 }
    }

    /// Address is exactly the contents of `base`
    pub fn is_base_only(&self) -> bool {
        self.index.is_none() && self.disp == 0
    }

    pub fn registers(&self) -> impl Iterator<Item = Reg> {
        std::iter::once(self.base).chain(self.index)
    }

    pub fn uses(&self, reg: Reg) -> bool {
        self.base == reg || self.index == Some(reg)
    }
}

/// Second operand of an ALU, test or compare instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(Address),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Shl,
    Shr,
}

impl AluOp {
    pub fn is_shift(self) -> bool {
        matches!(self, AluOp::Shl | AluOp::Shr)
    }
}

/// Branch condition, evaluated against the flags of the last test or compare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    /// Unsigned less-than
    Below,
    /// Unsigned greater-or-equal
    AboveEq,
}

impl Condition {
    pub fn negate(self) -> Condition {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Ge => Condition::Lt,
            Condition::Gt => Condition::Le,
            Condition::Le => Condition::Gt,
            Condition::Below => Condition::AboveEq,
            Condition::AboveEq => Condition::Below,
        }
    }
}

/// Foreign call target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallTarget {
    pub id: u16,
    pub name: &'static str,
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Pseudo-instruction marking a bound label
    Label(Label),
    Mov { dst: Reg, src: Reg },
    MovImm { dst: Reg, imm: u64 },
    /// Zero-extending load
    Load { width: Width, dst: Reg, addr: Address },
    Store { width: Width, src: Reg, addr: Address },
    Lea { dst: Reg, addr: Address },
    Alu { op: AluOp, width: Width, dst: Reg, lhs: Reg, rhs: Operand },
    /// Bitwise AND, flags only
    Test { width: Width, lhs: Operand, rhs: Operand },
    /// Subtract, flags only
    Cmp { width: Width, lhs: Operand, rhs: Operand },
    Jcc { cond: Condition, target: Label },
    Jmp { target: Label },
    /// Branch if the register is zero
    Cbz { width: Width, reg: Reg, target: Label },
    /// Branch if the register is nonzero
    Cbnz { width: Width, reg: Reg, target: Label },
    /// Direct call; far calls materialise the target in `scratch`
    Call { target: CallTarget, scratch: Option<Reg> },
}

impl Instruction {
    pub fn branch_target(&self) -> Option<Label> {
        match self {
            Instruction::Jcc { target, .. }
            | Instruction::Jmp { target }
            | Instruction::Cbz { target, .. }
            | Instruction::Cbnz { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Control never continues to the next instruction
    pub fn is_unconditional_transfer(&self) -> bool {
        matches!(self, Instruction::Jmp { .. })
    }

    pub fn is_branch(&self) -> bool {
        self.branch_target().is_some()
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Instruction::Call { .. })
    }

    /// Writes memory
    pub fn is_store(&self) -> bool {
        matches!(self, Instruction::Store { .. })
    }
}
