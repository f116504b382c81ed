//! Barrier Statistics - Emission Monitoring
//!
//! Counters for what the barrier set emitted during a compilation session:
//! - Sites per barrier kind
//! - Load barriers per reference strength
//! - Code size (instructions and out-of-line blocks)
//! - Aborted emissions

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::strength::ReferenceStrength;

/// Barrier kinds emitted by a barrier set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierKind {
    LoadReference,
    PreWrite,
    ArrayRange,
    CardMark,
}

impl BarrierKind {
    pub const fn name(self) -> &'static str {
        match self {
            BarrierKind::LoadReference => "load_reference",
            BarrierKind::PreWrite => "pre_write",
            BarrierKind::ArrayRange => "array_range",
            BarrierKind::CardMark => "card_mark",
        }
    }
}

impl fmt::Display for BarrierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of emission counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BarrierStats {
    pub load_strong: u64,
    pub load_weak: u64,
    pub load_phantom: u64,
    pub pre_write: u64,
    /// Pre-write sites with a statically null previous value
    pub pre_write_elided: u64,
    pub array_range: u64,
    pub card_mark: u64,
    pub instructions: u64,
    pub out_of_line_blocks: u64,
    pub aborted: u64,
}

impl BarrierStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge stats from another session
    pub fn merge(&mut self, other: &BarrierStats) {
        self.load_strong += other.load_strong;
        self.load_weak += other.load_weak;
        self.load_phantom += other.load_phantom;
        self.pre_write += other.pre_write;
        self.pre_write_elided += other.pre_write_elided;
        self.array_range += other.array_range;
        self.card_mark += other.card_mark;
        self.instructions += other.instructions;
        self.out_of_line_blocks += other.out_of_line_blocks;
        self.aborted += other.aborted;
    }

    pub fn load_barriers(&self) -> u64 {
        self.load_strong + self.load_weak + self.load_phantom
    }

    /// Barrier sites successfully emitted
    pub fn total_sites(&self) -> u64 {
        self.load_barriers() + self.pre_write + self.pre_write_elided + self.array_range + self.card_mark
    }

    /// Average instructions per emitted site
    pub fn instructions_per_site(&self) -> f64 {
        match self.total_sites() {
            0 => 0.0,
            sites => self.instructions as f64 / sites as f64,
        }
    }
}

impl fmt::Display for BarrierStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Barrier Statistics:")?;
        writeln!(
            f,
            "  Load barriers: {} (strong {}, weak {}, phantom {})",
            self.load_barriers(),
            self.load_strong,
            self.load_weak,
            self.load_phantom
        )?;
        writeln!(f, "  Pre-write barriers: {} ({} elided)", self.pre_write, self.pre_write_elided)?;
        writeln!(f, "  Array-range barriers: {}", self.array_range)?;
        writeln!(f, "  Card marks: {}", self.card_mark)?;
        writeln!(
            f,
            "  Instructions: {} ({:.1} per site), out-of-line blocks: {}",
            self.instructions,
            self.instructions_per_site(),
            self.out_of_line_blocks
        )?;
        write!(f, "  Aborted: {}", self.aborted)
    }
}

/// Thread-safe emission counters
///
/// Shared by every compiler thread using the same barrier set.
#[derive(Debug, Default)]
pub struct AtomicBarrierStats {
    load_strong: AtomicU64,
    load_weak: AtomicU64,
    load_phantom: AtomicU64,
    pre_write: AtomicU64,
    pre_write_elided: AtomicU64,
    array_range: AtomicU64,
    card_mark: AtomicU64,
    instructions: AtomicU64,
    out_of_line_blocks: AtomicU64,
    aborted: AtomicU64,
}

impl AtomicBarrierStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_load(&self, strength: ReferenceStrength) {
        let counter = match strength {
            ReferenceStrength::Strong => &self.load_strong,
            ReferenceStrength::Weak => &self.load_weak,
            ReferenceStrength::Phantom => &self.load_phantom,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_site(&self, kind: BarrierKind) {
        let counter = match kind {
            BarrierKind::PreWrite => &self.pre_write,
            BarrierKind::ArrayRange => &self.array_range,
            BarrierKind::CardMark => &self.card_mark,
            // counted per strength
            BarrierKind::LoadReference => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_elided_pre_write(&self) {
        self.pre_write_elided.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_code(&self, instructions: usize, out_of_line_blocks: usize) {
        self.instructions.fetch_add(instructions as u64, Ordering::Relaxed);
        self.out_of_line_blocks.fetch_add(out_of_line_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BarrierStats {
        BarrierStats {
            load_strong: self.load_strong.load(Ordering::Relaxed),
            load_weak: self.load_weak.load(Ordering::Relaxed),
            load_phantom: self.load_phantom.load(Ordering::Relaxed),
            pre_write: self.pre_write.load(Ordering::Relaxed),
            pre_write_elided: self.pre_write_elided.load(Ordering::Relaxed),
            array_range: self.array_range.load(Ordering::Relaxed),
            card_mark: self.card_mark.load(Ordering::Relaxed),
            instructions: self.instructions.load(Ordering::Relaxed),
            out_of_line_blocks: self.out_of_line_blocks.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.load_strong,
            &self.load_weak,
            &self.load_phantom,
            &self.pre_write,
            &self.pre_write_elided,
            &self.array_range,
            &self.card_mark,
            &self.instructions,
            &self.out_of_line_blocks,
            &self.aborted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
