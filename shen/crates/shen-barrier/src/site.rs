//! Barrier sites
//!
//! A site is everything the compiler knows about one access: the already
//! allocated registers, the address, the strength and the null-ness facts.
//! Sites are built per access and consumed immediately by an emitter, which
//! validates them before emitting a single instruction.

use shen_lir::{Address, Isa, Reg, Width};

use crate::error::{BarrierError, Result};
use crate::strength::ReferenceStrength;

/// Load reference barrier operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBarrierSite {
    /// Receives the barriered reference
    pub result: Reg,
    /// Reference just loaded from `address`, decoded to full width
    pub object: Reg,
    /// Slot the reference was loaded from
    pub address: Address,
    pub strength: ReferenceStrength,
    /// Slot holds a compressed reference
    pub narrow: bool,
    /// Compiler proved `object` non-null
    pub not_null: bool,
    pub tmp1: Reg,
    pub tmp2: Reg,
}

impl LoadBarrierSite {
    pub fn new(
        result: Reg,
        object: Reg,
        address: Address,
        strength: ReferenceStrength,
        [tmp1, tmp2]: [Reg; 2],
    ) -> Self {
        Self { result, object, address, strength, narrow: false, not_null: false, tmp1, tmp2 }
    }

    pub fn narrow(mut self, narrow: bool) -> Self {
        self.narrow = narrow;
        self
    }

    pub fn not_null(mut self, not_null: bool) -> Self {
        self.not_null = not_null;
        self
    }

    pub fn validate(&self, isa: Isa) -> Result<()> {
        let mut regs = DistinctRegs::new("load reference", isa);
        regs.add("result", self.result)?;
        regs.add("object", self.object)?;
        regs.add("tmp1", self.tmp1)?;
        regs.add("tmp2", self.tmp2)?;
        // object holds the value loaded through the address, so it cannot be
        // the base; the slow path recomputes the address after result and
        // temps are written
        let written = [("object", self.object), ("result", self.result), ("tmp1", self.tmp1), ("tmp2", self.tmp2)];
        for (role, reg) in written {
            if self.address.uses(reg) {
                return Err(BarrierError::AliasedRegisters {
                    site: "load reference",
                    first: format!("address {}", isa.reg_name(reg, Width::W64)),
                    second: role.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Where the pre-write barrier gets the value about to be overwritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousValue {
    /// Load it from the target address into `temp2`
    Load,
    /// Caller already loaded it
    Known { reg: Reg, width: Width },
    /// Statically null; nothing to log
    ConstantNull,
}

/// SATB pre-write barrier operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreWriteSite {
    /// Slot about to be overwritten
    pub address: Address,
    pub previous: PreviousValue,
    /// Compiler proved the previous value non-null
    pub non_null: bool,
    pub temp: Reg,
    /// Receives the previous value when it is loaded here
    pub temp2: Option<Reg>,
}

impl PreWriteSite {
    /// Previous value loaded from `address` into `temp2`
    pub fn load(address: Address, temp: Reg, temp2: Reg) -> Self {
        Self { address, previous: PreviousValue::Load, non_null: false, temp, temp2: Some(temp2) }
    }

    /// Previous value already in `prev`
    pub fn known(address: Address, prev: Reg, temp: Reg) -> Self {
        Self {
            address,
            previous: PreviousValue::Known { reg: prev, width: Width::W64 },
            non_null: false,
            temp,
            temp2: None,
        }
    }

    pub fn non_null(mut self, non_null: bool) -> Self {
        self.non_null = non_null;
        self
    }

    /// Register holding the previous value once it is available
    pub fn previous_register(&self) -> Option<Reg> {
        match self.previous {
            PreviousValue::Load => self.temp2,
            PreviousValue::Known { reg, .. } => Some(reg),
            PreviousValue::ConstantNull => None,
        }
    }

    pub fn validate(&self, isa: Isa) -> Result<()> {
        const SITE: &str = "pre-write";
        match self.previous {
            PreviousValue::ConstantNull => return Ok(()),
            PreviousValue::Load if self.temp2.is_none() => {
                return Err(BarrierError::invalid_site(SITE, "loading the previous value needs temp2"));
            }
            PreviousValue::Known { .. } if self.temp2.is_some() => {
                return Err(BarrierError::invalid_site(
                    SITE,
                    "temp2 must be absent when the previous value is known",
                ));
            }
            PreviousValue::Known { width, .. } if width != Width::W64 => {
                return Err(BarrierError::invalid_site(
                    SITE,
                    "known previous value must be an uncompressed reference",
                ));
            }
            _ => {}
        }

        let mut regs = DistinctRegs::new(SITE, isa);
        regs.claim("thread", isa.thread_register())?;
        regs.add("temp", self.temp)?;
        if let Some(prev) = self.previous_register() {
            regs.add("previous", prev)?;
        }
        regs.claim("address base", self.address.base)?;
        if let Some(index) = self.address.index {
            regs.claim("address index", index)?;
        }
        Ok(())
    }
}

/// Bulk pre-write barrier over `length` slots starting at `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRangeSite {
    /// Address of the first slot
    pub start: Reg,
    /// Number of slots
    pub length: Reg,
    /// Bytes per slot
    pub element_stride: u32,
    pub cursor: Reg,
    pub end: Reg,
    /// Cached SATB index
    pub index: Reg,
}

impl ArrayRangeSite {
    pub fn new(start: Reg, length: Reg, element_stride: u32, [cursor, end, index]: [Reg; 3]) -> Self {
        Self { start, length, element_stride, cursor, end, index }
    }

    /// `oop_size` is the slot size of the configured reference encoding
    pub fn validate(&self, isa: Isa, oop_size: u32) -> Result<()> {
        const SITE: &str = "array range";
        if self.element_stride != oop_size {
            return Err(BarrierError::invalid_site(
                SITE,
                format!("element stride {} does not match reference size {}", self.element_stride, oop_size),
            ));
        }
        let mut regs = DistinctRegs::new(SITE, isa);
        regs.add("start", self.start)?;
        regs.add("length", self.length)?;
        regs.add("cursor", self.cursor)?;
        regs.add("end", self.end)?;
        regs.add("index", self.index)?;
        Ok(())
    }

    pub fn stride_shift(&self) -> u8 {
        self.element_stride.trailing_zeros() as u8
    }
}

/// Card-marking operands for generational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardMarkSite {
    /// Address of the stored-to slot
    pub address: Address,
    pub temp: Reg,
}

impl CardMarkSite {
    pub fn new(address: Address, temp: Reg) -> Self {
        Self { address, temp }
    }

    pub fn validate(&self, isa: Isa) -> Result<()> {
        let mut regs = DistinctRegs::new("card mark", isa);
        regs.add("temp", self.temp)?;
        regs.claim("address base", self.address.base)?;
        if let Some(index) = self.address.index {
            regs.claim("address index", index)?;
        }
        Ok(())
    }
}

/// Pairwise-distinctness checker for the registers of one site
struct DistinctRegs {
    site: &'static str,
    isa: Isa,
    seen: Vec<(&'static str, Reg)>,
}

impl DistinctRegs {
    fn new(site: &'static str, isa: Isa) -> Self {
        Self { site, isa, seen: Vec::with_capacity(6) }
    }

    /// Allocatable register: must not be reserved by the backend
    fn add(&mut self, role: &'static str, reg: Reg) -> Result<()> {
        let isa = self.isa;
        let reserved = reg == isa.thread_register()
            || reg == isa.heap_base_register()
            || reg == isa.stack_pointer()
            || isa.reserved_scratch().contains(&reg);
        if !isa.is_valid_register(reg) || reserved {
            return Err(BarrierError::invalid_site(
                self.site,
                format!("{} uses reserved register {}", role, isa.reg_name(reg, Width::W64)),
            ));
        }
        self.claim(role, reg)
    }

    /// Register that only has to be distinct from the others
    fn claim(&mut self, role: &'static str, reg: Reg) -> Result<()> {
        if let Some((other, _)) = self.seen.iter().find(|(_, r)| *r == reg) {
            return Err(BarrierError::AliasedRegisters {
                site: self.site,
                first: other.to_string(),
                second: role.to_string(),
            });
        }
        self.seen.push((role, reg));
        Ok(())
    }
}
