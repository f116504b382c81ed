//! AMD64 register file, System V conventions and instruction encodability

use std::fmt;

use crate::error::{LirError, Result};
use crate::lir::{Address, AluOp, Condition, Instruction, Operand};
use crate::reg::{Isa, Reg, Width};

pub const RAX: Reg = Reg(0);
pub const RCX: Reg = Reg(1);
pub const RDX: Reg = Reg(2);
pub const RBX: Reg = Reg(3);
pub const RSP: Reg = Reg(4);
pub const RBP: Reg = Reg(5);
pub const RSI: Reg = Reg(6);
pub const RDI: Reg = Reg(7);
pub const R8: Reg = Reg(8);
pub const R9: Reg = Reg(9);
pub const R10: Reg = Reg(10);
pub const R11: Reg = Reg(11);
pub const R12: Reg = Reg(12);
pub const R13: Reg = Reg(13);
pub const R14: Reg = Reg(14);
pub const R15: Reg = Reg(15);

/// Current thread
pub const THREAD: Reg = R15;
/// Compressed-reference heap base
pub const HEAP_BASE: Reg = R12;
/// Never handed out by the register allocator
pub const SCRATCH: [Reg; 2] = [R10, R11];

const NAMES_64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const NAMES_32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
    "r12d", "r13d", "r14d", "r15d",
];
const NAMES_8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];

pub fn register_name(reg: Reg, width: Width) -> &'static str {
    let names = match width {
        Width::W8 => &NAMES_8,
        Width::W32 => &NAMES_32,
        Width::W64 => &NAMES_64,
    };
    names.get(reg.index()).copied().unwrap_or("<invalid>")
}

/// System V AMD64 ABI calling convention handler
pub struct SystemVAbi;

impl SystemVAbi {
    /// Integer/pointer argument registers in order
    pub const ARG_REGS: [Reg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

    /// Return register for integer/pointer types
    pub const RET_REG: Reg = RAX;

    pub const CALLER_SAVED: &'static [Reg] = &[RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

    /// Get the argument register for a given argument index (0-5)
    pub fn get_arg_register(index: usize) -> Option<Reg> {
        Self::ARG_REGS.get(index).copied()
    }
}

fn check_reg(reg: Reg) -> Result<()> {
    if !Isa::Amd64.is_valid_register(reg) {
        return Err(LirError::unencodable(Isa::Amd64, format!("no register r{}", reg.0)));
    }
    Ok(())
}

fn check_address(addr: &Address) -> Result<()> {
    check_reg(addr.base)?;
    if let Some(index) = addr.index {
        check_reg(index)?;
        if index == RSP {
            return Err(LirError::unencodable(Isa::Amd64, "rsp cannot be an index"));
        }
        if addr.shift > 3 {
            return Err(LirError::unencodable(
                Isa::Amd64,
                format!("index scale 1 << {} out of range", addr.shift),
            ));
        }
    } else if addr.shift != 0 {
        return Err(LirError::unencodable(Isa::Amd64, "scale without index"));
    }
    Ok(())
}

fn fits_imm32(imm: i64) -> bool {
    imm >= i32::MIN as i64 && imm <= i32::MAX as i64
}

fn check_operand(op: &Operand, width: Width) -> Result<()> {
    match op {
        Operand::Reg(reg) => check_reg(*reg),
        Operand::Mem(addr) => check_address(addr),
        Operand::Imm(imm) => {
            let ok = match width {
                Width::W8 => *imm >= i8::MIN as i64 && *imm <= u8::MAX as i64,
                _ => fits_imm32(*imm),
            };
            if ok {
                Ok(())
            } else {
                Err(LirError::unencodable(
                    Isa::Amd64,
                    format!("immediate {:#x} does not fit {} bits", imm, width.bits()),
                ))
            }
        }
    }
}

/// Flag-setting instructions take `r/m, r/imm`
fn check_flag_operands(lhs: &Operand, rhs: &Operand, width: Width) -> Result<()> {
    if matches!(lhs, Operand::Imm(_)) {
        return Err(LirError::unencodable(Isa::Amd64, "immediate as first operand"));
    }
    if matches!(rhs, Operand::Mem(_)) && matches!(lhs, Operand::Mem(_)) {
        return Err(LirError::unencodable(Isa::Amd64, "two memory operands"));
    }
    check_operand(lhs, width)?;
    check_operand(rhs, width)
}

/// Check that `inst` has an AMD64 encoding
pub fn check_encodable(inst: &Instruction) -> Result<()> {
    match inst {
        Instruction::Label(_) | Instruction::Jcc { .. } | Instruction::Jmp { .. } => Ok(()),
        Instruction::Mov { dst, src } => {
            check_reg(*dst)?;
            check_reg(*src)
        }
        Instruction::MovImm { dst, .. } => check_reg(*dst),
        Instruction::Load { dst, addr, .. } => {
            check_reg(*dst)?;
            check_address(addr)
        }
        Instruction::Store { src, addr, .. } => {
            check_reg(*src)?;
            check_address(addr)
        }
        Instruction::Lea { dst, addr } => {
            check_reg(*dst)?;
            check_address(addr)
        }
        Instruction::Alu { op, width, dst, lhs, rhs } => {
            check_reg(*dst)?;
            if dst != lhs {
                return Err(LirError::unencodable(
                    Isa::Amd64,
                    "two-address form requires dst == lhs",
                ));
            }
            match rhs {
                Operand::Imm(imm) if op.is_shift() => {
                    if *imm < 0 || *imm >= width.bits() as i64 {
                        return Err(LirError::unencodable(
                            Isa::Amd64,
                            format!("shift amount {} out of range", imm),
                        ));
                    }
                    Ok(())
                }
                Operand::Mem(_) if op.is_shift() => {
                    Err(LirError::unencodable(Isa::Amd64, "shift count from memory"))
                }
                Operand::Reg(_) if op.is_shift() => {
                    Err(LirError::unencodable(Isa::Amd64, "variable shifts need cl"))
                }
                other => check_operand(other, *width),
            }
        }
        Instruction::Test { width, lhs, rhs } | Instruction::Cmp { width, lhs, rhs } => {
            check_flag_operands(lhs, rhs, *width)
        }
        Instruction::Cbz { .. } | Instruction::Cbnz { .. } => Err(LirError::unencodable(
            Isa::Amd64,
            "no compare-and-branch instruction",
        )),
        Instruction::Call { scratch, .. } => match scratch {
            Some(reg) => check_reg(*reg),
            None => Ok(()),
        },
    }
}

fn ptr_size(width: Width) -> &'static str {
    match width {
        Width::W8 => "byte",
        Width::W32 => "dword",
        Width::W64 => "qword",
    }
}

struct Addr<'a>(&'a Address);

impl fmt::Display for Addr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.0;
        write!(f, "[{}", register_name(addr.base, Width::W64))?;
        if let Some(index) = addr.index {
            write!(f, "+{}", register_name(index, Width::W64))?;
            if addr.shift != 0 {
                write!(f, "*{}", 1u32 << addr.shift)?;
            }
        }
        match addr.disp {
            0 => {}
            d if d < 0 => write!(f, "-{:#x}", -(d as i64))?,
            d => write!(f, "+{:#x}", d)?,
        }
        f.write_str("]")
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, op: &Operand, width: Width) -> fmt::Result {
    match op {
        Operand::Reg(reg) => f.write_str(register_name(*reg, width)),
        Operand::Imm(imm) => write!(f, "{:#x}", imm),
        Operand::Mem(addr) => write!(f, "{} ptr {}", ptr_size(width), Addr(addr)),
    }
}

fn condition_suffix(cond: Condition) -> &'static str {
    match cond {
        Condition::Eq => "e",
        Condition::Ne => "ne",
        Condition::Lt => "l",
        Condition::Ge => "ge",
        Condition::Gt => "g",
        Condition::Le => "le",
        Condition::Below => "b",
        Condition::AboveEq => "ae",
    }
}

/// Intel-syntax rendering of one instruction
pub fn format_instruction(f: &mut fmt::Formatter<'_>, inst: &Instruction) -> fmt::Result {
    let r64 = |reg: Reg| register_name(reg, Width::W64);
    match inst {
        Instruction::Label(label) => write!(f, "{}:", label),
        Instruction::Mov { dst, src } => write!(f, "    mov {}, {}", r64(*dst), r64(*src)),
        Instruction::MovImm { dst, imm } => write!(f, "    mov {}, {:#x}", r64(*dst), imm),
        Instruction::Load { width, dst, addr } => match width {
            Width::W8 => write!(
                f,
                "    movzx {}, byte ptr {}",
                register_name(*dst, Width::W32),
                Addr(addr)
            ),
            w => write!(
                f,
                "    mov {}, {} ptr {}",
                register_name(*dst, *w),
                ptr_size(*w),
                Addr(addr)
            ),
        },
        Instruction::Store { width, src, addr } => write!(
            f,
            "    mov {} ptr {}, {}",
            ptr_size(*width),
            Addr(addr),
            register_name(*src, *width)
        ),
        Instruction::Lea { dst, addr } => write!(f, "    lea {}, {}", r64(*dst), Addr(addr)),
        Instruction::Alu { op, width, dst, rhs, .. } => {
            let mnemonic = match op {
                AluOp::Add => "add",
                AluOp::Sub => "sub",
                AluOp::And => "and",
                AluOp::Shl => "shl",
                AluOp::Shr => "shr",
            };
            write!(f, "    {} {}, ", mnemonic, register_name(*dst, *width))?;
            write_operand(f, rhs, *width)
        }
        Instruction::Test { width, lhs, rhs } => {
            f.write_str("    test ")?;
            write_operand(f, lhs, *width)?;
            f.write_str(", ")?;
            write_operand(f, rhs, *width)
        }
        Instruction::Cmp { width, lhs, rhs } => {
            f.write_str("    cmp ")?;
            write_operand(f, lhs, *width)?;
            f.write_str(", ")?;
            write_operand(f, rhs, *width)
        }
        Instruction::Jcc { cond, target } => {
            write!(f, "    j{} {}", condition_suffix(*cond), target)
        }
        Instruction::Jmp { target } => write!(f, "    jmp {}", target),
        Instruction::Cbz { reg, target, .. } => {
            write!(f, "    <cbz {}, {}>", r64(*reg), target)
        }
        Instruction::Cbnz { reg, target, .. } => {
            write!(f, "    <cbnz {}, {}>", r64(*reg), target)
        }
        Instruction::Call { target, scratch } => match scratch {
            Some(reg) => write!(f, "    mov {}, {}\n    call {}", r64(*reg), target, r64(*reg)),
            None => write!(f, "    call {}", target),
        },
    }
}
