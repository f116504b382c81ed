//! Common types and utilities for shent commands.

use clap::ValueEnum;
use shen_barrier::{BarrierType, ReferenceStrength, RuntimeStubs};
use shen_lir::{aarch64, amd64, Isa, Reg};

// ============================================================================
// Argument Values
// ============================================================================

/// Target instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IsaArg {
    Amd64,
    Aarch64,
}

impl From<IsaArg> for Isa {
    fn from(arg: IsaArg) -> Self {
        match arg {
            IsaArg::Amd64 => Isa::Amd64,
            IsaArg::Aarch64 => Isa::AArch64,
        }
    }
}

/// Reference strength of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StrengthArg {
    #[default]
    Strong,
    Weak,
    Phantom,
}

impl From<StrengthArg> for ReferenceStrength {
    fn from(arg: StrengthArg) -> Self {
        match arg {
            StrengthArg::Strong => ReferenceStrength::Strong,
            StrengthArg::Weak => ReferenceStrength::Weak,
            StrengthArg::Phantom => ReferenceStrength::Phantom,
        }
    }
}

impl StrengthArg {
    /// Access kind a compiler would attach to a load of this strength
    pub fn barrier_type(self) -> BarrierType {
        match self {
            StrengthArg::Strong => BarrierType::Field,
            StrengthArg::Weak => BarrierType::WeakRefersTo,
            StrengthArg::Phantom => BarrierType::PhantomRefersTo,
        }
    }
}

/// Barrier to emit or simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BarrierArg {
    /// Load reference barrier on an already loaded reference
    Lrb,
    /// Reference load followed by its load reference barrier
    Load,
    /// SATB pre-write barrier
    PreWrite,
    /// Pre-write barrier over a range of array slots
    ArrayRange,
    /// Card mark after a store (generational mode)
    Card,
    /// Full reference store: pre-write, store, card mark
    Store,
    /// `Reference.get()`: weak load plus keep-alive
    Referent,
}

impl BarrierArg {
    pub fn name(self) -> &'static str {
        match self {
            BarrierArg::Lrb => "lrb",
            BarrierArg::Load => "load",
            BarrierArg::PreWrite => "pre-write",
            BarrierArg::ArrayRange => "array-range",
            BarrierArg::Card => "card",
            BarrierArg::Store => "store",
            BarrierArg::Referent => "referent",
        }
    }
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

// ============================================================================
// Register Assignment
// ============================================================================

/// Registers handed to the emitters; none of them is reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operands {
    pub result: Reg,
    pub object: Reg,
    pub base: Reg,
    pub tmp1: Reg,
    pub tmp2: Reg,
    pub extra: Reg,
    pub extra2: Reg,
}

/// Displacement of the reference field inside the holder object
pub const FIELD_OFFSET: i32 = 8;

pub fn operands(isa: Isa) -> Operands {
    match isa {
        Isa::Amd64 => Operands {
            result: amd64::RAX,
            object: amd64::RBX,
            base: amd64::RSI,
            tmp1: amd64::RCX,
            tmp2: amd64::RDX,
            extra: amd64::R8,
            extra2: amd64::R9,
        },
        Isa::AArch64 => Operands {
            result: aarch64::X0,
            object: aarch64::X1,
            base: aarch64::X2,
            tmp1: aarch64::X3,
            tmp2: aarch64::X4,
            extra: aarch64::X5,
            extra2: aarch64::X6,
        },
    }
}

/// Stub table for `isa`, in native registers or outgoing stack slots
pub fn stubs(isa: Isa, native: bool) -> RuntimeStubs {
    if native {
        RuntimeStubs::native(isa)
    } else {
        RuntimeStubs::stack_slots(isa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isa_arg_conversion() {
        assert_eq!(Isa::from(IsaArg::Amd64), Isa::Amd64);
        assert_eq!(Isa::from(IsaArg::Aarch64), Isa::AArch64);
    }

    #[test]
    fn test_strength_barrier_type_round_trip() {
        for arg in [StrengthArg::Strong, StrengthArg::Weak, StrengthArg::Phantom] {
            assert_eq!(arg.barrier_type().strength(), Ok(ReferenceStrength::from(arg)));
        }
    }

    #[test]
    fn test_barrier_names_match_value_names() {
        for arg in BarrierArg::value_variants() {
            let value = arg.to_possible_value().unwrap();
            assert_eq!(value.get_name(), arg.name());
        }
    }

    #[test]
    fn test_operands_avoid_reserved_registers() {
        for isa in Isa::ALL {
            let ops = operands(isa);
            let regs = [ops.result, ops.object, ops.base, ops.tmp1, ops.tmp2, ops.extra, ops.extra2];
            for reg in regs {
                assert_ne!(reg, isa.thread_register());
                assert_ne!(reg, isa.heap_base_register());
                assert_ne!(reg, isa.stack_pointer());
            }
        }
    }
}
