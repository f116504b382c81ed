//! Runtime Stub Contract
//!
//! Stubs are the only way emitted code reaches the collector's mutable
//! state. Each stub has a fixed arity and a calling convention resolved once
//! per compilation session:
//!
//! ```text
//!   load_barrier_{strong,weak,phantom}[_narrow]   (object, address) -> object
//!   pre_write_barrier                              (previous)        -> ()
//!   verify_oop                                     (object)          -> object
//! ```

use std::fmt;

use indexmap::IndexMap;
use shen_lir::{CallTarget, CallingConvention, Isa, ValueLocation};

use crate::error::{BarrierError, Result};
use crate::strength::ReferenceStrength;

/// Runtime entry points called by barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StubKind {
    LoadBarrierStrong,
    LoadBarrierStrongNarrow,
    LoadBarrierWeak,
    LoadBarrierWeakNarrow,
    LoadBarrierPhantom,
    LoadBarrierPhantomNarrow,
    PreWrite,
    VerifyOop,
}

impl StubKind {
    pub const ALL: [StubKind; 8] = [
        StubKind::LoadBarrierStrong,
        StubKind::LoadBarrierStrongNarrow,
        StubKind::LoadBarrierWeak,
        StubKind::LoadBarrierWeakNarrow,
        StubKind::LoadBarrierPhantom,
        StubKind::LoadBarrierPhantomNarrow,
        StubKind::PreWrite,
        StubKind::VerifyOop,
    ];

    /// Load barrier stub for a strength; `narrow` selects the variant that
    /// heals a compressed slot
    pub const fn load_barrier(strength: ReferenceStrength, narrow: bool) -> StubKind {
        match (strength, narrow) {
            (ReferenceStrength::Strong, false) => StubKind::LoadBarrierStrong,
            (ReferenceStrength::Strong, true) => StubKind::LoadBarrierStrongNarrow,
            (ReferenceStrength::Weak, false) => StubKind::LoadBarrierWeak,
            (ReferenceStrength::Weak, true) => StubKind::LoadBarrierWeakNarrow,
            (ReferenceStrength::Phantom, false) => StubKind::LoadBarrierPhantom,
            (ReferenceStrength::Phantom, true) => StubKind::LoadBarrierPhantomNarrow,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            StubKind::LoadBarrierStrong => "load_barrier_strong",
            StubKind::LoadBarrierStrongNarrow => "load_barrier_strong_narrow",
            StubKind::LoadBarrierWeak => "load_barrier_weak",
            StubKind::LoadBarrierWeakNarrow => "load_barrier_weak_narrow",
            StubKind::LoadBarrierPhantom => "load_barrier_phantom",
            StubKind::LoadBarrierPhantomNarrow => "load_barrier_phantom_narrow",
            StubKind::PreWrite => "pre_write_barrier",
            StubKind::VerifyOop => "verify_oop",
        }
    }

    pub const fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<StubKind> {
        Self::ALL.get(id as usize).copied()
    }

    pub const fn target(self) -> CallTarget {
        CallTarget { id: self.id(), name: self.name() }
    }

    /// Strength handled by a load barrier stub
    pub const fn strength(self) -> Option<ReferenceStrength> {
        match self {
            StubKind::LoadBarrierStrong | StubKind::LoadBarrierStrongNarrow => {
                Some(ReferenceStrength::Strong)
            }
            StubKind::LoadBarrierWeak | StubKind::LoadBarrierWeakNarrow => {
                Some(ReferenceStrength::Weak)
            }
            StubKind::LoadBarrierPhantom | StubKind::LoadBarrierPhantomNarrow => {
                Some(ReferenceStrength::Phantom)
            }
            StubKind::PreWrite | StubKind::VerifyOop => None,
        }
    }

    pub const fn is_load_barrier(self) -> bool {
        self.strength().is_some()
    }

    pub const fn is_narrow(self) -> bool {
        matches!(
            self,
            StubKind::LoadBarrierStrongNarrow
                | StubKind::LoadBarrierWeakNarrow
                | StubKind::LoadBarrierPhantomNarrow
        )
    }

    pub const fn arg_count(self) -> usize {
        if self.is_load_barrier() {
            2
        } else {
            1
        }
    }

    pub const fn has_return(self) -> bool {
        !matches!(self, StubKind::PreWrite)
    }
}

impl fmt::Display for StubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a stub is reachable with a direct branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubReach {
    Near,
    /// Target must be materialised in a register first
    Far,
}

/// Call target and convention of one stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubDescriptor {
    pub kind: StubKind,
    pub target: CallTarget,
    pub convention: CallingConvention,
    pub reach: StubReach,
    /// Stub saves every register except its return location
    pub preserves_registers: bool,
}

impl StubDescriptor {
    pub fn new(kind: StubKind, convention: CallingConvention) -> Self {
        Self {
            kind,
            target: kind.target(),
            convention,
            reach: StubReach::Near,
            preserves_registers: true,
        }
    }

    /// Check the convention matches the stub's arity
    pub fn check(&self) -> Result<()> {
        let actual = self.convention.arg_count();
        let expected = self.kind.arg_count();
        if actual != expected {
            return Err(BarrierError::CallingConvention { stub: self.kind, expected, actual });
        }
        match (self.kind.has_return(), self.convention.return_location()) {
            (true, None) => Err(BarrierError::MissingReturn { stub: self.kind }),
            (false, Some(_)) => Err(BarrierError::UnexpectedReturn { stub: self.kind }),
            _ => Ok(()),
        }
    }

    pub fn argument(&self, index: usize) -> Result<ValueLocation> {
        self.convention.argument(index).ok_or(BarrierError::CallingConvention {
            stub: self.kind,
            expected: index + 1,
            actual: self.convention.arg_count(),
        })
    }

    pub fn return_location(&self) -> Result<ValueLocation> {
        self.convention
            .return_location()
            .ok_or(BarrierError::MissingReturn { stub: self.kind })
    }
}

/// Stub table for one compilation session
#[derive(Debug, Clone)]
pub struct RuntimeStubs {
    isa: Isa,
    stubs: IndexMap<StubKind, StubDescriptor>,
}

impl RuntimeStubs {
    /// Operands passed in outgoing stack slots; stubs save every register
    pub fn stack_slots(isa: Isa) -> Self {
        Self::build(isa, |kind| {
            StubDescriptor::new(
                kind,
                CallingConvention::stack_slots(isa, kind.arg_count(), kind.has_return()),
            )
        })
    }

    /// Operands passed in native ABI registers; calls clobber caller-saved
    /// registers
    pub fn native(isa: Isa) -> Self {
        Self::build(isa, |kind| StubDescriptor {
            preserves_registers: false,
            ..StubDescriptor::new(
                kind,
                CallingConvention::native(isa, kind.arg_count(), kind.has_return()),
            )
        })
    }

    fn build(isa: Isa, make: impl Fn(StubKind) -> StubDescriptor) -> Self {
        let stubs = StubKind::ALL.iter().map(|&kind| (kind, make(kind))).collect();
        Self { isa, stubs }
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    /// Mark every stub as out of direct branch range
    pub fn with_reach(mut self, reach: StubReach) -> Self {
        for stub in self.stubs.values_mut() {
            stub.reach = reach;
        }
        self
    }

    /// Replace the descriptor of one stub
    pub fn insert(&mut self, descriptor: StubDescriptor) {
        self.stubs.insert(descriptor.kind, descriptor);
    }

    pub fn get(&self, kind: StubKind) -> Result<&StubDescriptor> {
        self.stubs
            .get(&kind)
            .ok_or_else(|| BarrierError::Internal(format!("stub {} not registered", kind)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StubDescriptor> {
        self.stubs.values()
    }

    /// Check every registered stub against its arity
    pub fn validate(&self) -> Result<()> {
        for kind in StubKind::ALL {
            self.get(kind)?.check()?;
        }
        Ok(())
    }
}
