//! Reference strength and access kinds

use std::fmt;
use std::str::FromStr;

use crate::error::BarrierError;
use crate::gc_state::GcState;

/// Reachability strength of a loaded reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceStrength {
    /// Plain field or array element
    Strong,
    /// `Reference.get()` style referent read
    Weak,
    /// Phantom-reachability read
    Phantom,
}

impl ReferenceStrength {
    pub const ALL: [ReferenceStrength; 3] =
        [ReferenceStrength::Strong, ReferenceStrength::Weak, ReferenceStrength::Phantom];

    /// GC-state bits that send a load of this strength off the fast path
    pub const fn gc_state_mask(self) -> GcState {
        match self {
            ReferenceStrength::Strong => GcState::HAS_FORWARDED,
            ReferenceStrength::Weak | ReferenceStrength::Phantom => {
                GcState::HAS_FORWARDED.union(GcState::WEAK_ROOTS)
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ReferenceStrength::Strong => "strong",
            ReferenceStrength::Weak => "weak",
            ReferenceStrength::Phantom => "phantom",
        }
    }
}

impl fmt::Display for ReferenceStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReferenceStrength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strong" => Ok(ReferenceStrength::Strong),
            "weak" => Ok(ReferenceStrength::Weak),
            "phantom" => Ok(ReferenceStrength::Phantom),
            other => Err(format!("unknown reference strength '{}'", other)),
        }
    }
}

/// Static access kind attached to a memory operation by the compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierType {
    Read,
    Field,
    Array,
    None,
    ReferenceGet,
    WeakRefersTo,
    PhantomRefersTo,
    Unknown,
    PostInitWrite,
    AsNoKeepaliveWrite,
}

impl BarrierType {
    /// Strength a load of this kind is barriered with
    ///
    /// Write-only kinds and `Unknown` never reach a load barrier; asking for
    /// their strength is an internal error.
    pub fn strength(self) -> Result<ReferenceStrength, BarrierError> {
        match self {
            BarrierType::Read | BarrierType::Field | BarrierType::Array | BarrierType::None => {
                Ok(ReferenceStrength::Strong)
            }
            BarrierType::ReferenceGet | BarrierType::WeakRefersTo => Ok(ReferenceStrength::Weak),
            BarrierType::PhantomRefersTo => Ok(ReferenceStrength::Phantom),
            BarrierType::Unknown | BarrierType::PostInitWrite | BarrierType::AsNoKeepaliveWrite => {
                Err(BarrierError::UnsupportedBarrierType(self))
            }
        }
    }
}
