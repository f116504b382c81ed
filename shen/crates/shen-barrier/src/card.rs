//! Card-marking barrier for generational mode
//!
//! After a reference store the card covering the slot is dirtied so the
//! young collection can find old-to-young pointers. The card table pointer
//! is per-thread and pre-biased, so the card address is simply
//! `table + (addr >> card_shift)`.

use shen_lir::{Address, AluOp, Width};

use crate::config::BarrierConfig;
use crate::ensure;
use crate::error::{BarrierError, Result};
use crate::ops::BarrierTargetOps;
use crate::site::CardMarkSite;

pub const DIRTY_CARD: u8 = 0;
pub const CLEAN_CARD: u8 = 0xff;

/// Dirty the card covering `site.address`
pub fn emit_card_barrier(
    ops: &mut dyn BarrierTargetOps,
    config: &BarrierConfig,
    site: &CardMarkSite,
) -> Result<()> {
    ensure!(
        config.generational,
        BarrierError::invalid_site("card mark", "card marking requires generational mode")
    );
    site.validate(ops.isa())?;

    let card = site.temp;
    ops.materialize_address(card, &site.address)?;
    ops.alu_imm(AluOp::Shr, Width::W64, card, config.heap.card_shift as i64)?;

    let table = ops.acquire_scratch()?;
    let value = ops.acquire_scratch()?;
    let slot = Address::indexed(table, card, 0);
    let table_slot = ops.thread_address(config.thread.card_table_offset);
    ops.load(Width::W64, table, table_slot)?;

    let done = config.conditional_card_mark.then(|| ops.new_label());
    if let Some(done) = done {
        ops.load(Width::W8, value, slot)?;
        ops.branch_if_zero(Width::W8, value, done)?;
    }
    ops.mov_imm(value, DIRTY_CARD as u64)?;
    ops.store(Width::W8, value, slot)?;
    if let Some(done) = done {
        ops.bind(done)?;
    }

    ops.release_scratch(value)?;
    ops.release_scratch(table)
}
