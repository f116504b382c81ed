//! Array-range pre-write barrier
//!
//! Bulk stores into a reference array (arraycopy, fill) log every old
//! element once before the range is overwritten. The marking flag and the
//! SATB index are read once; the loop then logs inline until it observes a
//! full buffer, after which the cached index stays zero and every remaining
//! element goes through the single-object stub.
//!
//! ```text
//!   MARKING clear or length == 0 ─► done
//!   index = [thread + satb_index]; cursor = start; end = start + length * stride
//!   loop: prev = [cursor]
//!         prev == null ─► next
//!         index == 0 ─► slow
//!         index -= 8; [buffer + index] = prev; [thread + satb_index] = index
//!   next: cursor += stride; cursor < end ─► loop
//!   done:
//!
//!   slow: arg0 = prev; call pre_write_barrier; jmp next
//! ```

use shen_lir::{Address, AluOp, BlockKind, Condition, ValueLocation, Width};

use crate::config::BarrierConfig;
use crate::ensure;
use crate::error::{BarrierError, Result};
use crate::gc_state::GcState;
use crate::ops::BarrierTargetOps;
use crate::satb::{check_pre_write_stub, emit_verify_oop, SATB_ENTRY};
use crate::site::ArrayRangeSite;
use crate::stubs::{RuntimeStubs, StubKind};

const SITE: &str = "array range";

/// Emit the array-range barrier loop at the current position
pub fn emit_array_range_pre_write_barrier(
    ops: &mut dyn BarrierTargetOps,
    config: &BarrierConfig,
    stubs: &RuntimeStubs,
    site: &ArrayRangeSite,
) -> Result<()> {
    let isa = ops.isa();
    site.validate(isa, config.oop_size())?;

    let stub = stubs.get(StubKind::PreWrite)?;
    check_pre_write_stub(stub)?;
    ensure!(
        stub.preserves_registers,
        BarrierError::invalid_site(SITE, "pre-write stub must preserve registers across the loop")
    );
    if let ValueLocation::Register(arg) = stub.argument(0)? {
        let live = [site.start, site.length, site.cursor, site.end, site.index];
        ensure!(
            !live.contains(&arg),
            BarrierError::AliasedRegisters {
                site: SITE,
                first: "pre-write stub argument".to_string(),
                second: isa.reg_name(arg, Width::W64).to_string(),
            }
        );
    }
    let verify = if config.verify_oops { Some(stubs.get(StubKind::VerifyOop)?) } else { None };

    let prev = ops.acquire_scratch()?;
    let tmp = ops.acquire_scratch()?;
    let home = ops.current_block();
    let done = ops.new_label();
    let top = ops.new_label();
    let next = ops.new_label();
    let index_slot = ops.thread_address(config.thread.satb_index_offset);
    let buffer_slot = ops.thread_address(config.thread.satb_buffer_offset);

    ops.load_gc_state(tmp, config.thread.gc_state_offset)?;
    ops.branch_if_none_set(tmp, GcState::MARKING.bits(), done)?;
    ops.branch_if_zero(Width::W64, site.length, done)?;

    ops.load(Width::W64, site.index, index_slot)?;
    ops.mov(site.cursor, site.start)?;
    ops.mov(site.end, site.length)?;
    ops.alu_imm(AluOp::Shl, Width::W64, site.end, site.stride_shift() as i64)?;
    ops.alu_reg(AluOp::Add, Width::W64, site.end, site.cursor)?;

    ops.bind(top)?;
    match &config.compressed_oops {
        Some(encoding) => {
            ops.load(Width::W32, prev, Address::base(site.cursor))?;
            ops.decode_narrow(prev, encoding)?;
        }
        None => ops.load(Width::W64, prev, Address::base(site.cursor))?,
    }
    if let Some(verify) = verify {
        emit_verify_oop(ops, verify, prev, Some(tmp))?;
    }
    ops.branch_if_zero(Width::W64, prev, next)?;

    let (slow, slow_label) = ops.out_of_line(BlockKind::SlowPath)?;
    ops.branch_if_zero(Width::W64, site.index, slow_label)?;
    ops.alu_imm(AluOp::Sub, Width::W64, site.index, SATB_ENTRY)?;
    ops.load(Width::W64, tmp, buffer_slot)?;
    ops.store(Width::W64, prev, Address::indexed(tmp, site.index, 0))?;
    ops.store(Width::W64, site.index, index_slot)?;

    ops.bind(next)?;
    ops.alu_imm(AluOp::Add, Width::W64, site.cursor, site.element_stride as i64)?;
    ops.compare(Width::W64, site.cursor, site.end)?;
    ops.branch(Condition::Below, top)?;
    ops.bind(done)?;

    ops.switch_to(slow)?;
    ops.move_to_location(stub.argument(0)?, prev)?;
    ops.call_stub(stub, Some(tmp))?;
    ops.jump(next)?;
    ops.switch_to(home)?;

    ops.release_scratch(tmp)?;
    ops.release_scratch(prev)
}
