//! Load Reference Barrier
//!
//! ```text
//!   main:  mov   result, obj
//!          [null check obj ─► done]
//!          tmp1 = gc_state
//!          strong:        HAS_FORWARDED set         ─► mid
//!          weak/phantom:  HAS_FORWARDED|WEAK_ROOTS  ─► slow
//!   done:
//!
//!   mid:   tmp1 = cset base; tmp2 = obj >> region shift
//!          cset[tmp2] != 0 ─► slow
//!          jmp done
//!
//!   slow:  arg0 = obj; arg1 = &slot; call stub; result = ret; jmp done
//! ```

use shen_lir::{BlockKind, Label, ValueLocation, Width};

use crate::config::BarrierConfig;
use crate::ensure;
use crate::error::{BarrierError, Result};
use crate::ops::BarrierTargetOps;
use crate::policy::LoadBarrierPlan;
use crate::site::LoadBarrierSite;
use crate::stubs::{RuntimeStubs, StubDescriptor};

/// Emit a load reference barrier for `site` at the current position
pub fn emit_load_reference_barrier(
    ops: &mut dyn BarrierTargetOps,
    config: &BarrierConfig,
    stubs: &RuntimeStubs,
    site: &LoadBarrierSite,
) -> Result<LoadBarrierPlan> {
    site.validate(ops.isa())?;
    let plan = LoadBarrierPlan::for_site(site);
    let stub = stubs.get(plan.stub)?;

    let home = ops.current_block();
    let done = ops.new_label();

    ops.mov(site.result, site.object)?;
    if plan.null_check {
        ops.branch_if_zero(Width::W64, site.object, done)?;
    }
    ops.load_gc_state(site.tmp1, config.thread.gc_state_offset)?;

    let mid = if plan.cset_mid_path { Some(ops.out_of_line(BlockKind::MidPath)?) } else { None };
    let (slow, slow_label) = ops.out_of_line(BlockKind::SlowPath)?;

    match mid {
        Some((_, mid_label)) => ops.branch_if_any_set(site.tmp1, plan.mask.bits(), mid_label)?,
        None => ops.branch_if_any_set(site.tmp1, plan.mask.bits(), slow_label)?,
    }
    ops.bind(done)?;

    if let Some((mid, _)) = mid {
        ops.switch_to(mid)?;
        ops.mov_imm(site.tmp1, config.heap.cset_table_base)?;
        ops.shift_right(site.tmp2, site.object, config.heap.region_size_shift)?;
        ops.branch_if_in_cset(site.tmp1, site.tmp2, slow_label)?;
        ops.jump(done)?;
    }

    ops.switch_to(slow)?;
    emit_slow_path(ops, stub, site, done)?;

    ops.switch_to(home)?;
    Ok(plan)
}

fn emit_slow_path(
    ops: &mut dyn BarrierTargetOps,
    stub: &StubDescriptor,
    site: &LoadBarrierSite,
    done: Label,
) -> Result<()> {
    let arg_count = stub.convention.arg_count();
    ensure!(
        arg_count == 2,
        BarrierError::CallingConvention { stub: stub.kind, expected: 2, actual: arg_count }
    );
    let ret = stub.return_location()?;
    let object_arg = stub.argument(0)?;
    let address_arg = stub.argument(1)?;

    let as_reg = |loc: ValueLocation| match loc {
        ValueLocation::Register(reg) => Some(reg),
        ValueLocation::Stack(_) => None,
    };

    // order the two argument moves so neither overwrites the other's source
    if as_reg(address_arg) != Some(site.object) {
        ops.move_address_to_location(address_arg, &site.address)?;
        ops.move_to_location(object_arg, site.object)?;
    } else if !as_reg(object_arg).is_some_and(|reg| site.address.uses(reg)) {
        ops.move_to_location(object_arg, site.object)?;
        ops.move_address_to_location(address_arg, &site.address)?;
    } else {
        let spare = ops.acquire_scratch()?;
        ops.materialize_address(spare, &site.address)?;
        ops.move_to_location(object_arg, site.object)?;
        ops.move_to_location(address_arg, spare)?;
        ops.release_scratch(spare)?;
    }

    ops.call_stub(stub, None)?;
    ops.move_from_location(site.result, ret)?;
    ops.jump(done)
}
