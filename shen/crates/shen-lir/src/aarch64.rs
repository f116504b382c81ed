//! AArch64 register file, AAPCS64 conventions and instruction encodability

use std::fmt;

use crate::error::{LirError, Result};
use crate::lir::{Address, AluOp, Condition, Instruction, Operand};
use crate::reg::{Isa, Reg, Width};

pub const X0: Reg = Reg(0);
pub const X1: Reg = Reg(1);
pub const X2: Reg = Reg(2);
pub const X3: Reg = Reg(3);
pub const X4: Reg = Reg(4);
pub const X5: Reg = Reg(5);
pub const X6: Reg = Reg(6);
pub const X7: Reg = Reg(7);
pub const X8: Reg = Reg(8);
pub const X9: Reg = Reg(9);
pub const X10: Reg = Reg(10);
pub const X11: Reg = Reg(11);
pub const X12: Reg = Reg(12);
pub const X13: Reg = Reg(13);
pub const X14: Reg = Reg(14);
pub const X15: Reg = Reg(15);
pub const X19: Reg = Reg(19);
pub const X20: Reg = Reg(20);
pub const X21: Reg = Reg(21);
pub const X22: Reg = Reg(22);
pub const X27: Reg = Reg(27);
pub const X28: Reg = Reg(28);
pub const LR: Reg = Reg(30);
/// Stack pointer when used as an address base
pub const SP: Reg = Reg(31);

/// Current thread
pub const THREAD: Reg = X28;
/// Compressed-reference heap base
pub const HEAP_BASE: Reg = X27;
/// Never handed out by the register allocator
pub const SCRATCH: [Reg; 2] = [X8, X9];

const NAMES_64: [&str; 32] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "x30", "sp",
];
const NAMES_32: [&str; 32] = [
    "w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10", "w11", "w12", "w13",
    "w14", "w15", "w16", "w17", "w18", "w19", "w20", "w21", "w22", "w23", "w24", "w25", "w26",
    "w27", "w28", "w29", "w30", "wsp",
];

/// 8-bit accesses use the `w` view
pub fn register_name(reg: Reg, width: Width) -> &'static str {
    let names = match width {
        Width::W64 => &NAMES_64,
        Width::W8 | Width::W32 => &NAMES_32,
    };
    names.get(reg.index()).copied().unwrap_or("<invalid>")
}

/// AAPCS64 calling convention handler
pub struct Aapcs64;

impl Aapcs64 {
    pub const ARG_REGS: [Reg; 8] = [X0, X1, X2, X3, X4, X5, X6, X7];

    pub const RET_REG: Reg = X0;

    pub const CALLER_SAVED: &'static [Reg] = &[
        X0,
        X1,
        X2,
        X3,
        X4,
        X5,
        X6,
        X7,
        X8,
        X9,
        X10,
        X11,
        X12,
        X13,
        X14,
        X15,
        Reg(16),
        Reg(17),
        Reg(18),
    ];

    pub fn get_arg_register(index: usize) -> Option<Reg> {
        Self::ARG_REGS.get(index).copied()
    }
}

/// Whether `value` is encodable as an AArch64 bitmask immediate
///
/// A bitmask immediate is an element of 2, 4, 8, 16, 32 or 64 bits holding
/// a single rotated run of ones, replicated across the register. All-zeros
/// and all-ones are never encodable.
pub fn is_logical_immediate(value: u64, width: Width) -> bool {
    let imm = match width {
        Width::W64 => value,
        Width::W8 | Width::W32 => {
            if value >> 32 != 0 {
                return false;
            }
            value | (value << 32)
        }
    };
    if imm == 0 || imm == u64::MAX {
        return false;
    }

    let mut size = 64u32;
    while size > 2 {
        let half = size / 2;
        let mask = (1u64 << half) - 1;
        if imm & mask != (imm >> half) & mask {
            break;
        }
        size = half;
    }

    let mask = if size == 64 { u64::MAX } else { (1u64 << size) - 1 };
    let elem = imm & mask;
    let rotated = ((elem >> 1) | ((elem & 1) << (size - 1))) & mask;
    // one circular run of ones has exactly two edges
    (elem ^ rotated).count_ones() == 2
}

fn check_reg(reg: Reg) -> Result<()> {
    if !Isa::AArch64.is_valid_register(reg) {
        return Err(LirError::unencodable(Isa::AArch64, format!("no register x{}", reg.0)));
    }
    Ok(())
}

fn check_mem_address(addr: &Address, width: Width) -> Result<()> {
    check_reg(addr.base)?;
    let size = width.bytes() as i64;
    match addr.index {
        Some(index) => {
            check_reg(index)?;
            if addr.disp != 0 {
                return Err(LirError::unencodable(
                    Isa::AArch64,
                    "register offset with displacement",
                ));
            }
            if addr.shift != 0 && (1i64 << addr.shift) != size {
                return Err(LirError::unencodable(
                    Isa::AArch64,
                    format!("index shift {} does not match access size", addr.shift),
                ));
            }
        }
        None => {
            let disp = addr.disp as i64;
            let unscaled = (-256..=255).contains(&disp);
            let scaled = disp >= 0 && disp % size == 0 && disp / size <= 4095;
            if !unscaled && !scaled {
                return Err(LirError::unencodable(
                    Isa::AArch64,
                    format!("displacement {} out of range", disp),
                ));
            }
        }
    }
    Ok(())
}

fn check_arith_imm(imm: i64) -> Result<()> {
    if (0..=4095).contains(&imm) {
        Ok(())
    } else {
        Err(LirError::unencodable(
            Isa::AArch64,
            format!("arithmetic immediate {} out of range", imm),
        ))
    }
}

fn check_logical_imm(imm: i64, width: Width) -> Result<()> {
    if is_logical_immediate(imm as u64, width) {
        Ok(())
    } else {
        Err(LirError::unencodable(
            Isa::AArch64,
            format!("{:#x} is not a logical immediate", imm),
        ))
    }
}

fn reg_operand(op: &Operand) -> Result<Reg> {
    match op {
        Operand::Reg(reg) => {
            check_reg(*reg)?;
            Ok(*reg)
        }
        _ => Err(LirError::unencodable(Isa::AArch64, "expected register operand")),
    }
}

/// Check that `inst` has an AArch64 encoding
pub fn check_encodable(inst: &Instruction) -> Result<()> {
    match inst {
        Instruction::Label(_) | Instruction::Jcc { .. } | Instruction::Jmp { .. } => Ok(()),
        Instruction::Mov { dst, src } => {
            check_reg(*dst)?;
            check_reg(*src)
        }
        Instruction::MovImm { dst, .. } => check_reg(*dst),
        Instruction::Load { width, dst, addr } | Instruction::Store { width, src: dst, addr } => {
            check_reg(*dst)?;
            check_mem_address(addr, *width)
        }
        Instruction::Lea { dst, addr } => {
            check_reg(*dst)?;
            check_reg(addr.base)?;
            match addr.index {
                Some(index) => {
                    check_reg(index)?;
                    if addr.disp != 0 {
                        return Err(LirError::unencodable(
                            Isa::AArch64,
                            "add with shifted register and displacement",
                        ));
                    }
                    Ok(())
                }
                None => check_arith_imm((addr.disp as i64).abs()),
            }
        }
        Instruction::Alu { op, width, dst, lhs, rhs } => {
            check_reg(*dst)?;
            check_reg(*lhs)?;
            match rhs {
                Operand::Mem(_) => {
                    Err(LirError::unencodable(Isa::AArch64, "memory operand in ALU op"))
                }
                Operand::Reg(reg) => check_reg(*reg),
                Operand::Imm(imm) => match op {
                    AluOp::Add | AluOp::Sub => check_arith_imm(*imm),
                    AluOp::And => check_logical_imm(*imm, *width),
                    AluOp::Shl | AluOp::Shr => {
                        if *imm < 0 || *imm >= width.bits() as i64 {
                            return Err(LirError::unencodable(
                                Isa::AArch64,
                                format!("shift amount {} out of range", imm),
                            ));
                        }
                        Ok(())
                    }
                },
            }
        }
        Instruction::Test { width, lhs, rhs } => {
            reg_operand(lhs)?;
            match rhs {
                Operand::Imm(imm) => check_logical_imm(*imm, *width),
                other => reg_operand(other).map(|_| ()),
            }
        }
        Instruction::Cmp { lhs, rhs, .. } => {
            reg_operand(lhs)?;
            match rhs {
                Operand::Imm(imm) => check_arith_imm(*imm),
                other => reg_operand(other).map(|_| ()),
            }
        }
        Instruction::Cbz { reg, .. } | Instruction::Cbnz { reg, .. } => check_reg(*reg),
        Instruction::Call { scratch, .. } => match scratch {
            Some(reg) => check_reg(*reg),
            None => Ok(()),
        },
    }
}

struct Addr<'a>(&'a Address);

impl fmt::Display for Addr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.0;
        write!(f, "[{}", register_name(addr.base, Width::W64))?;
        if let Some(index) = addr.index {
            write!(f, ", {}", register_name(index, Width::W64))?;
            if addr.shift != 0 {
                write!(f, ", lsl #{}", addr.shift)?;
            }
        } else if addr.disp != 0 {
            write!(f, ", #{}", addr.disp)?;
        }
        f.write_str("]")
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, op: &Operand, width: Width) -> fmt::Result {
    match op {
        Operand::Reg(reg) => f.write_str(register_name(*reg, width)),
        Operand::Imm(imm) => write!(f, "#{:#x}", imm),
        Operand::Mem(addr) => write!(f, "{}", Addr(addr)),
    }
}

fn condition_suffix(cond: Condition) -> &'static str {
    match cond {
        Condition::Eq => "eq",
        Condition::Ne => "ne",
        Condition::Lt => "lt",
        Condition::Ge => "ge",
        Condition::Gt => "gt",
        Condition::Le => "le",
        Condition::Below => "lo",
        Condition::AboveEq => "hs",
    }
}

/// Rendering of one instruction in standard AArch64 assembler syntax
pub fn format_instruction(f: &mut fmt::Formatter<'_>, inst: &Instruction) -> fmt::Result {
    let x = |reg: Reg| register_name(reg, Width::W64);
    match inst {
        Instruction::Label(label) => write!(f, "{}:", label),
        Instruction::Mov { dst, src } => write!(f, "    mov {}, {}", x(*dst), x(*src)),
        Instruction::MovImm { dst, imm } => write!(f, "    mov {}, #{:#x}", x(*dst), imm),
        Instruction::Load { width, dst, addr } => {
            let mnemonic = if *width == Width::W8 { "ldrb" } else { "ldr" };
            write!(f, "    {} {}, {}", mnemonic, register_name(*dst, *width), Addr(addr))
        }
        Instruction::Store { width, src, addr } => {
            let mnemonic = if *width == Width::W8 { "strb" } else { "str" };
            write!(f, "    {} {}, {}", mnemonic, register_name(*src, *width), Addr(addr))
        }
        Instruction::Lea { dst, addr } => match addr.index {
            Some(index) if addr.shift != 0 => write!(
                f,
                "    add {}, {}, {}, lsl #{}",
                x(*dst),
                x(addr.base),
                x(index),
                addr.shift
            ),
            Some(index) => write!(f, "    add {}, {}, {}", x(*dst), x(addr.base), x(index)),
            None if addr.disp < 0 => {
                write!(f, "    sub {}, {}, #{}", x(*dst), x(addr.base), -(addr.disp as i64))
            }
            None if addr.disp == 0 => write!(f, "    mov {}, {}", x(*dst), x(addr.base)),
            None => write!(f, "    add {}, {}, #{}", x(*dst), x(addr.base), addr.disp),
        },
        Instruction::Alu { op, width, dst, lhs, rhs } => {
            let mnemonic = match op {
                AluOp::Add => "add",
                AluOp::Sub => "sub",
                AluOp::And => "and",
                AluOp::Shl => "lsl",
                AluOp::Shr => "lsr",
            };
            write!(
                f,
                "    {} {}, {}, ",
                mnemonic,
                register_name(*dst, *width),
                register_name(*lhs, *width)
            )?;
            write_operand(f, rhs, *width)
        }
        Instruction::Test { width, lhs, rhs } => {
            f.write_str("    tst ")?;
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
            write!(f, "    b.{} {}", condition_suffix(*cond), target)
        }
        Instruction::Jmp { target } => write!(f, "    b {}", target),
        Instruction::Cbz { width, reg, target } => {
            write!(f, "    cbz {}, {}", register_name(*reg, *width), target)
        }
        Instruction::Cbnz { width, reg, target } => {
            write!(f, "    cbnz {}, {}", register_name(*reg, *width), target)
        }
        Instruction::Call { target, scratch } => match scratch {
            Some(reg) => write!(f, "    ldr {}, ={}\n    blr {}", x(*reg), target, x(*reg)),
            None => write!(f, "    bl {}", target),
        },
    }
}
