//! SATB pre-write barrier
//!
//! Logs the value about to be overwritten while marking is active. The
//! thread-local queue fills downward: `index` is the number of free bytes
//! left and a zero index means the buffer is full.
//!
//! ```text
//!   tmp = gc_state
//!   MARKING clear ─► done
//!   prev = [addr]                 (unless already known)
//!   prev == null ─► done          (unless proven non-null)
//!   tmp = index; tmp == 0 ─► runtime
//!   tmp -= 8; index = tmp; tmp += buffer; [tmp] = prev
//!   done:
//!
//!   runtime: arg0 = prev; call pre_write_barrier; jmp done
//! ```

use shen_lir::{Address, AluOp, BlockKind, Label, Reg, Width};

use crate::config::BarrierConfig;
use crate::ensure;
use crate::error::{BarrierError, Result};
use crate::gc_state::GcState;
use crate::ops::BarrierTargetOps;
use crate::policy::PreWritePlan;
use crate::site::{PreWriteSite, PreviousValue};
use crate::stubs::{RuntimeStubs, StubDescriptor, StubKind};

pub(crate) const SATB_ENTRY: i64 = 8;

/// Emit a pre-write barrier for `site` at the current position
pub fn emit_pre_write_barrier(
    ops: &mut dyn BarrierTargetOps,
    config: &BarrierConfig,
    stubs: &RuntimeStubs,
    site: &PreWriteSite,
) -> Result<PreWritePlan> {
    site.validate(ops.isa())?;
    let plan = PreWritePlan::for_site(site, config);
    if plan.elided {
        return Ok(plan);
    }

    let stub = stubs.get(StubKind::PreWrite)?;
    check_pre_write_stub(stub)?;
    let verify = if plan.verify { Some(stubs.get(StubKind::VerifyOop)?) } else { None };

    let home = ops.current_block();
    let done = ops.new_label();
    ops.load_gc_state(site.temp, config.thread.gc_state_offset)?;

    let out_of_line = ops.pre_write_out_of_line();
    let (runtime, runtime_label) = if out_of_line {
        let (mid, mid_label) = ops.out_of_line(BlockKind::MidPath)?;
        let runtime = ops.out_of_line(BlockKind::SlowPath)?;
        ops.branch_if_any_set(site.temp, GcState::MARKING.bits(), mid_label)?;
        ops.bind(done)?;
        ops.switch_to(mid)?;
        runtime
    } else {
        let runtime = ops.out_of_line(BlockKind::SlowPath)?;
        ops.branch_if_none_set(site.temp, GcState::MARKING.bits(), done)?;
        runtime
    };

    let prev = load_previous(ops, config, site)?;
    if plan.null_check {
        ops.branch_if_zero(Width::W64, prev, done)?;
    }
    if let Some(verify) = verify {
        emit_verify_oop(ops, verify, prev, None)?;
    }

    if plan.inline_enqueue {
        emit_enqueue(ops, config, prev, site.temp, runtime_label)?;
        if out_of_line {
            ops.jump(done)?;
        }
    } else {
        ops.jump(runtime_label)?;
    }
    if !out_of_line {
        ops.bind(done)?;
    }

    ops.switch_to(runtime)?;
    ops.move_to_location(stub.argument(0)?, prev)?;
    ops.call_stub(stub, None)?;
    ops.jump(done)?;

    ops.switch_to(home)?;
    Ok(plan)
}

pub(crate) fn check_pre_write_stub(stub: &StubDescriptor) -> Result<()> {
    let arg_count = stub.convention.arg_count();
    ensure!(
        arg_count == 1,
        BarrierError::CallingConvention { stub: stub.kind, expected: 1, actual: arg_count }
    );
    stub.check()
}

/// Register holding the previous value, loading and decoding it if needed
fn load_previous(
    ops: &mut dyn BarrierTargetOps,
    config: &BarrierConfig,
    site: &PreWriteSite,
) -> Result<Reg> {
    match (site.previous, site.temp2) {
        (PreviousValue::Known { reg, .. }, _) => Ok(reg),
        (PreviousValue::Load, Some(prev)) => {
            match &config.compressed_oops {
                Some(encoding) => {
                    ops.load(Width::W32, prev, site.address)?;
                    ops.decode_narrow(prev, encoding)?;
                }
                None => ops.load(Width::W64, prev, site.address)?,
            }
            Ok(prev)
        }
        _ => Err(BarrierError::Internal("pre-write site without previous value".to_string())),
    }
}

/// `value = verify_oop(value)`
pub(crate) fn emit_verify_oop(
    ops: &mut dyn BarrierTargetOps,
    verify: &StubDescriptor,
    value: Reg,
    spare: Option<Reg>,
) -> Result<()> {
    verify.check()?;
    ops.move_to_location(verify.argument(0)?, value)?;
    ops.call_stub(verify, spare)?;
    ops.move_from_location(value, verify.return_location()?)
}

/// Inline SATB enqueue of `prev`; branches to `runtime` if the buffer is full
fn emit_enqueue(
    ops: &mut dyn BarrierTargetOps,
    config: &BarrierConfig,
    prev: Reg,
    tmp: Reg,
    runtime: Label,
) -> Result<()> {
    let index = ops.thread_address(config.thread.satb_index_offset);
    ops.load(Width::W64, tmp, index)?;
    ops.branch_if_zero(Width::W64, tmp, runtime)?;
    ops.alu_imm(AluOp::Sub, Width::W64, tmp, SATB_ENTRY)?;
    ops.store(Width::W64, tmp, index)?;
    ops.add_thread_word(tmp, config.thread.satb_buffer_offset)?;
    ops.store(Width::W64, prev, Address::base(tmp))
}
