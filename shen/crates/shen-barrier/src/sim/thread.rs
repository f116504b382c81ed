//! Thread block of the simulated mutator

use shen_lir::interp::Memory;
use shen_lir::Width;

use super::{SimError, SimResult};
use crate::card::CLEAN_CARD;
use crate::config::ThreadLayout;
use crate::gc_state::GcState;
use crate::satb::SATB_ENTRY;

/// Thread-local barrier state as compiled code sees it
///
/// Holds addresses only; the values live in machine memory.
#[derive(Debug, Clone)]
pub struct SimThread {
    base: u64,
    layout: ThreadLayout,
    satb_buffer: u64,
    satb_capacity: u64,
    card_table: u64,
    /// Physical card table start and length
    cards: (u64, usize),
}

impl SimThread {
    /// `card_table` is the biased table base stored in the thread block
    pub fn new(
        base: u64,
        layout: ThreadLayout,
        satb_buffer: u64,
        satb_entries: usize,
        card_table: u64,
        cards: (u64, usize),
    ) -> Self {
        Self {
            base,
            layout,
            satb_buffer,
            satb_capacity: satb_entries as u64 * SATB_ENTRY as u64,
            card_table,
            cards,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// SATB buffer size in bytes
    pub fn satb_capacity(&self) -> u64 {
        self.satb_capacity
    }

    fn field(&self, offset: i32) -> u64 {
        self.base.wrapping_add(offset as i64 as u64)
    }

    /// Empty SATB buffer, clean cards, idle GC state
    pub fn init(&self, memory: &mut Memory) -> SimResult<()> {
        memory.poke(self.field(self.layout.gc_state_offset), Width::W8, 0)?;
        memory.poke(self.field(self.layout.satb_buffer_offset), Width::W64, self.satb_buffer)?;
        memory.poke(self.field(self.layout.card_table_offset), Width::W64, self.card_table)?;
        self.reset_satb(memory)?;
        let (start, len) = self.cards;
        for card in 0..len as u64 {
            memory.poke(start + card, Width::W8, CLEAN_CARD as u64)?;
        }
        Ok(())
    }

    pub fn gc_state(&self, memory: &Memory) -> SimResult<GcState> {
        let bits = memory.peek(self.field(self.layout.gc_state_offset), Width::W8)?;
        Ok(GcState::from_bits_truncate(bits as u8))
    }

    pub fn set_gc_state(&self, memory: &mut Memory, state: GcState) -> SimResult<()> {
        if !state.is_consistent() {
            return Err(SimError::InconsistentGcState(state));
        }
        memory.poke(self.field(self.layout.gc_state_offset), Width::W8, state.bits() as u64)?;
        Ok(())
    }

    /// Free bytes left in the SATB buffer
    pub fn satb_index(&self, memory: &Memory) -> SimResult<u64> {
        Ok(memory.peek(self.field(self.layout.satb_index_offset), Width::W64)?)
    }

    pub fn set_satb_index(&self, memory: &mut Memory, index: u64) -> SimResult<()> {
        memory.poke(self.field(self.layout.satb_index_offset), Width::W64, index)?;
        Ok(())
    }

    pub fn reset_satb(&self, memory: &mut Memory) -> SimResult<()> {
        self.set_satb_index(memory, self.satb_capacity)
    }

    /// Logged values, newest first
    pub fn satb_entries(&self, memory: &Memory) -> SimResult<Vec<u64>> {
        let index = self.satb_index(memory)?.min(self.satb_capacity);
        (index..self.satb_capacity)
            .step_by(SATB_ENTRY as usize)
            .map(|offset| memory.peek(self.satb_buffer + offset, Width::W64).map_err(SimError::from))
            .collect()
    }

    /// Push one value the way the runtime does; the caller handles a full buffer
    pub fn push_satb(&self, memory: &mut Memory, value: u64) -> SimResult<()> {
        let index = self
            .satb_index(memory)?
            .checked_sub(SATB_ENTRY as u64)
            .ok_or(SimError::SatbFull)?;
        memory.write(self.satb_buffer + index, Width::W64, value)?;
        self.set_satb_index(memory, index)
    }

    /// Card byte covering `addr`
    pub fn card(&self, memory: &Memory, addr: u64, card_shift: u8) -> SimResult<u8> {
        let card = self.card_table.wrapping_add(addr >> card_shift);
        Ok(memory.peek(card, Width::W8)? as u8)
    }
}
