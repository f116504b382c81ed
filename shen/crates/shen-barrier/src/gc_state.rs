//! GC State Model
//!
//! The collector publishes its phase as a one-byte bitmask in every thread
//! block. Barriers load that byte at each site and test bits with a single
//! test-and-branch, so the state is kept as a plain `u8` with named bit
//! constants rather than a set of booleans.
//!
//! ```text
//!   bit 0  HAS_FORWARDED   heap has forwarded objects, LRB required
//!   bit 1  MARKING         SATB barrier required
//!   bit 2  EVACUATION      barriers may evacuate objects
//!   bit 3  UPDATE_REFS     references are being updated
//!   bit 4  WEAK_ROOTS      weak/phantom loads must null dead referents
//!   bit 5  YOUNG_MARKING   generational: young marking in progress
//!   bit 6  OLD_MARKING     generational: old marking in progress
//! ```

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use static_assertions::assert_eq_size;

/// Snapshot of the per-thread GC-state byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GcState(u8);

assert_eq_size!(GcState, u8);

impl GcState {
    pub const IDLE: GcState = GcState(0);
    pub const HAS_FORWARDED: GcState = GcState(1 << 0);
    pub const MARKING: GcState = GcState(1 << 1);
    pub const EVACUATION: GcState = GcState(1 << 2);
    pub const UPDATE_REFS: GcState = GcState(1 << 3);
    pub const WEAK_ROOTS: GcState = GcState(1 << 4);
    pub const YOUNG_MARKING: GcState = GcState(1 << 5);
    pub const OLD_MARKING: GcState = GcState(1 << 6);

    const NAMED: [(GcState, &'static str); 7] = [
        (GcState::HAS_FORWARDED, "HAS_FORWARDED"),
        (GcState::MARKING, "MARKING"),
        (GcState::EVACUATION, "EVACUATION"),
        (GcState::UPDATE_REFS, "UPDATE_REFS"),
        (GcState::WEAK_ROOTS, "WEAK_ROOTS"),
        (GcState::YOUNG_MARKING, "YOUNG_MARKING"),
        (GcState::OLD_MARKING, "OLD_MARKING"),
    ];

    const ALL_BITS: u8 = 0x7f;

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Drop bits the collector never sets
    pub const fn from_bits_truncate(bits: u8) -> Self {
        GcState(bits & Self::ALL_BITS)
    }

    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL_BITS == 0 {
            Some(GcState(bits))
        } else {
            None
        }
    }

    pub const fn union(self, other: GcState) -> Self {
        GcState(self.0 | other.0)
    }

    pub const fn contains(self, other: GcState) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: GcState) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: GcState) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: GcState) {
        self.0 &= !other.0;
    }

    /// `EVACUATION` is only ever published together with `HAS_FORWARDED`
    pub const fn is_consistent(self) -> bool {
        !self.contains(GcState::EVACUATION) || self.contains(GcState::HAS_FORWARDED)
    }

    pub fn iter_names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMED
            .into_iter()
            .filter(move |(bit, _)| self.contains(*bit))
            .map(|(_, name)| name)
    }
}

impl BitOr for GcState {
    type Output = GcState;

    fn bitor(self, rhs: GcState) -> GcState {
        self.union(rhs)
    }
}

impl BitOrAssign for GcState {
    fn bitor_assign(&mut self, rhs: GcState) {
        self.insert(rhs);
    }
}

impl BitAnd for GcState {
    type Output = GcState;

    fn bitand(self, rhs: GcState) -> GcState {
        GcState(self.0 & rhs.0)
    }
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("IDLE");
        }
        let names: Vec<_> = self.iter_names().collect();
        f.write_str(&names.join("|"))
    }
}

/// Error parsing a GC state description
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown GC state flag '{0}'")]
pub struct ParseGcStateError(pub String);

impl FromStr for GcState {
    type Err = ParseGcStateError;

    /// Parse `"marking,has_forwarded"` or `"MARKING|WEAK_ROOTS"`; empty or
    /// `idle` yields the idle state
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = GcState::IDLE;
        for token in s.split([',', '|']).map(str::trim).filter(|t| !t.is_empty()) {
            let upper = token.to_ascii_uppercase().replace('-', "_");
            if upper == "IDLE" {
                continue;
            }
            let bit = Self::NAMED
                .iter()
                .find(|(_, name)| *name == upper)
                .map(|(bit, _)| *bit)
                .ok_or_else(|| ParseGcStateError(token.to_string()))?;
            state |= bit;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(GcState::HAS_FORWARDED.bits(), 0x01);
        assert_eq!(GcState::MARKING.bits(), 0x02);
        assert_eq!(GcState::EVACUATION.bits(), 0x04);
        assert_eq!(GcState::UPDATE_REFS.bits(), 0x08);
        assert_eq!(GcState::WEAK_ROOTS.bits(), 0x10);
        assert_eq!(GcState::YOUNG_MARKING.bits(), 0x20);
        assert_eq!(GcState::OLD_MARKING.bits(), 0x40);
    }

    #[test]
    fn test_evacuation_requires_forwarded() {
        assert!(GcState::IDLE.is_consistent());
        assert!((GcState::EVACUATION | GcState::HAS_FORWARDED).is_consistent());
        assert!(!GcState::EVACUATION.is_consistent());
        assert!(!(GcState::EVACUATION | GcState::MARKING).is_consistent());
    }

    #[test]
    fn test_display_and_parse() {
        let state = GcState::MARKING | GcState::WEAK_ROOTS;
        assert_eq!(state.to_string(), "MARKING|WEAK_ROOTS");
        assert_eq!("MARKING|WEAK_ROOTS".parse::<GcState>().unwrap(), state);
        assert_eq!("weak-roots, marking".parse::<GcState>().unwrap(), state);
        assert_eq!("idle".parse::<GcState>().unwrap(), GcState::IDLE);
        assert_eq!("".parse::<GcState>().unwrap(), GcState::IDLE);
        assert_eq!(GcState::IDLE.to_string(), "IDLE");
        assert!("compacting".parse::<GcState>().is_err());
    }

    #[test]
    fn test_from_bits() {
        assert_eq!(GcState::from_bits(0x13), Some(GcState(0x13)));
        assert_eq!(GcState::from_bits(0x80), None);
        assert_eq!(GcState::from_bits_truncate(0xff).bits(), 0x7f);
    }
}
