//! Machine registers, operand widths and instruction-set selection

use std::fmt;
use std::str::FromStr;

use crate::error::LirError;
use crate::{aarch64, amd64};

/// Physical register, identified by its hardware encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

impl Reg {
    pub const fn new(encoding: u8) -> Self {
        Self(encoding)
    }

    pub const fn encoding(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Operand width of a load, store or ALU operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W32,
    W64,
}

impl Width {
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    /// Mask selecting the low `bits()` bits of a 64-bit value
    pub const fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xff,
            Width::W32 => 0xffff_ffff,
            Width::W64 => u64::MAX,
        }
    }

    pub const fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    pub fn from_bytes(bytes: u32) -> Option<Width> {
        match bytes {
            1 => Some(Width::W8),
            4 => Some(Width::W32),
            8 => Some(Width::W64),
            _ => None,
        }
    }
}

/// Target instruction set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    Amd64,
    AArch64,
}

impl Isa {
    pub const ALL: [Isa; 2] = [Isa::Amd64, Isa::AArch64];

    pub const fn word_size(self) -> u32 {
        8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Isa::Amd64 => "amd64",
            Isa::AArch64 => "aarch64",
        }
    }

    /// Number of general purpose register encodings
    pub const fn register_count(self) -> usize {
        match self {
            Isa::Amd64 => 16,
            Isa::AArch64 => 32,
        }
    }

    pub const fn stack_pointer(self) -> Reg {
        match self {
            Isa::Amd64 => amd64::RSP,
            Isa::AArch64 => aarch64::SP,
        }
    }

    /// Register holding the current thread block for compiled code
    pub const fn thread_register(self) -> Reg {
        match self {
            Isa::Amd64 => amd64::THREAD,
            Isa::AArch64 => aarch64::THREAD,
        }
    }

    /// Register holding the compressed-reference heap base
    pub const fn heap_base_register(self) -> Reg {
        match self {
            Isa::Amd64 => amd64::HEAP_BASE,
            Isa::AArch64 => aarch64::HEAP_BASE,
        }
    }

    /// Registers the compiler never allocates; free for emitters to use as scratch
    pub fn reserved_scratch(self) -> &'static [Reg] {
        match self {
            Isa::Amd64 => &amd64::SCRATCH,
            Isa::AArch64 => &aarch64::SCRATCH,
        }
    }

    /// Registers a native call may clobber
    pub fn caller_saved(self) -> &'static [Reg] {
        match self {
            Isa::Amd64 => amd64::SystemVAbi::CALLER_SAVED,
            Isa::AArch64 => aarch64::Aapcs64::CALLER_SAVED,
        }
    }

    pub fn reg_name(self, reg: Reg, width: Width) -> &'static str {
        match self {
            Isa::Amd64 => amd64::register_name(reg, width),
            Isa::AArch64 => aarch64::register_name(reg, width),
        }
    }

    pub fn is_valid_register(self, reg: Reg) -> bool {
        reg.index() < self.register_count()
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Isa {
    type Err = LirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x64" => Ok(Isa::Amd64),
            "aarch64" | "arm64" => Ok(Isa::AArch64),
            _ => Err(LirError::UnknownIsa(s.to_string())),
        }
    }
}

/// Small register set, one bit per encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegSet(u64);

impl RegSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_slice(regs: &[Reg]) -> Self {
        let mut set = Self::empty();
        for &reg in regs {
            set.insert(reg);
        }
        set
    }

    /// Insert `reg`; returns false if it was already present
    pub fn insert(&mut self, reg: Reg) -> bool {
        let bit = 1u64 << reg.0;
        let fresh = self.0 & bit == 0;
        self.0 |= bit;
        fresh
    }

    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1u64 << reg.0);
    }

    pub fn contains(&self, reg: Reg) -> bool {
        self.0 & (1u64 << reg.0) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Reg> + '_ {
        (0..64u8).filter(move |i| self.0 & (1u64 << i) != 0).map(Reg)
    }
}
