//! Load Reference Barrier Execution Tests
//!
//! These tests run emitted load barriers on the simulated runtime:
//! - Fast path leaves the reference alone when nothing is forwarded
//! - Collection-set filtering before the stub call
//! - Evacuation on demand and slot healing
//! - Weak and phantom loads of dead referents
//!
//! ============================================================================
//! Every test runs on both instruction sets
//! ============================================================================

mod common;

use common::*;
use proptest::prelude::*;
use shen_barrier::backend::ops_for;
use shen_barrier::sim::{Scenario, HEAP_START, THREAD_BASE};
use shen_barrier::{
    BarrierConfig, BarrierError, BarrierType, GcState, LoadBarrierSite, OopEncoding, ReferenceStrength, RuntimeStubs,
    StubKind,
};
use shen_lir::{Address, CodeBuffer, Isa, Program};

/// LRB on `object` (already loaded from `[base + FIELD]`) into `result`
fn lrb_program(isa: Isa, config: &BarrierConfig, strength: ReferenceStrength, not_null: bool) -> Program {
    let r = regs(isa);
    let site = LoadBarrierSite::new(
        r.result,
        r.object,
        Address::with_disp(r.base, FIELD),
        strength,
        [r.tmp1, r.tmp2],
    )
    .not_null(not_null);
    emit(isa, config, |barriers, ops| barriers.emit_load_reference_barrier(ops, &site)).0
}

/// Point `base` at `holder` and `object` at `value`
fn set_operands(world: &mut shen_barrier::sim::SimWorld, holder: u64, value: u64) {
    let r = regs(world.isa());
    world.machine.set_reg(r.base, holder);
    world.machine.set_reg(r.object, value);
}

// ============================================================================
// FAST PATH
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Strong LRB with HAS_FORWARDED and WEAK_ROOTS clear
    ///
    /// **Bug this finds:** fast-path mask testing the wrong bits
    /// **Invariant verified:** result equals input and no stub is called,
    /// even for an object in the collection set
    #[test]
    fn prop_strong_fast_path_returns_input(
        bits in (0u8..0x80).prop_map(|s| s & !0x15),
        in_cset in any::<bool>(),
        isa in prop::sample::select(Isa::ALL.to_vec()),
    ) {
        let config = config();
        let program = lrb_program(isa, &config, ReferenceStrength::Strong, false);
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        if in_cset {
            world.add_to_cset(1).unwrap();
        }
        world.set_gc_state(GcState::from_bits_truncate(bits)).unwrap();
        set_operands(&mut world, holder, target);

        let stats = world.run(&program).unwrap();

        prop_assert_eq!(world.machine.reg(regs(isa).result), target);
        prop_assert!(stats.calls.is_empty());
        prop_assert_eq!(stats.out_of_line_entries, 0);
    }

    /// Weak and phantom loads never take the cset mid path
    ///
    /// **Bug this finds:** weak strength sharing the strong layout
    /// **Invariant verified:** any state with WEAK_ROOTS or HAS_FORWARDED set
    /// goes straight to the slow path
    #[test]
    fn prop_weak_slow_path_skips_cset(
        bits in (0u8..0x80)
            .prop_filter("needs a barrier bit", |s| s & 0x11 != 0)
            .prop_filter("publishable", publishable),
        phantom in any::<bool>(),
        isa in prop::sample::select(Isa::ALL.to_vec()),
    ) {
        let strength = if phantom { ReferenceStrength::Phantom } else { ReferenceStrength::Weak };
        let config = config();
        let program = lrb_program(isa, &config, strength, false);
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.set_gc_state(GcState::from_bits_truncate(bits)).unwrap();
        set_operands(&mut world, holder, target);

        let stats = world.run(&program).unwrap();

        prop_assert_eq!(stats.mid_path_entries, 0);
        prop_assert_eq!(stats.slow_path_entries, 1);
        prop_assert_eq!(stats.calls.len(), 1);
        prop_assert_eq!(world.machine.reg(regs(isa).result), target);
    }
}

/// Strong, not-null, HAS_FORWARDED clear
///
/// **Bug this finds:** inline path branching out of line unconditionally
/// **Invariant verified:** zero out-of-line entries, result == input
#[test]
fn test_strong_not_null_stays_inline() {
    for isa in Isa::ALL {
        let config = config();
        let program = lrb_program(isa, &config, ReferenceStrength::Strong, true);
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.set_gc_state(GcState::MARKING).unwrap();
        set_operands(&mut world, holder, target);

        let stats = world.run(&program).unwrap();

        assert_eq!(stats.out_of_line_entries, 0, "{}", isa);
        assert_eq!(world.machine.reg(regs(isa).result), target);
    }
}

/// Weak LRB on a null input
///
/// **Bug this finds:** GC state read before the null check
/// **Invariant verified:** returns null without touching the GC-state byte
#[test]
fn test_weak_null_input_skips_gc_state() {
    for isa in Isa::ALL {
        let config = config();
        let program = lrb_program(isa, &config, ReferenceStrength::Weak, false);
        let mut world = world(isa, &config);
        let (holder, _) = holder_and_target(&mut world, 1, false);
        world.set_gc_state(GcState::HAS_FORWARDED | GcState::WEAK_ROOTS).unwrap();
        set_operands(&mut world, holder, 0);
        world.machine.set_reg(regs(isa).result, 0x5555);
        world.machine.memory.enable_trace();

        let stats = world.run(&program).unwrap();

        assert_eq!(world.machine.reg(regs(isa).result), 0);
        assert!(stats.calls.is_empty());
        let gc_state = THREAD_BASE + config.thread.gc_state_offset as u64;
        assert_eq!(world.machine.memory.reads_of(gc_state), 0, "{}", isa);
    }
}

// ============================================================================
// COLLECTION SET AND EVACUATION
// ============================================================================

/// Strong load of an in-cset object while forwarding is active
///
/// **Bug this finds:** cset index computed with the wrong shift or base
/// **Invariant verified:** the stub is reached through the mid path, the
/// result is the to-space copy and the slot is healed
#[test]
fn test_strong_in_cset_reaches_stub_and_heals() {
    for isa in Isa::ALL {
        let config = config();
        let program = lrb_program(isa, &config, ReferenceStrength::Strong, false);
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.add_to_cset(1).unwrap();
        world.set_gc_state(GcState::HAS_FORWARDED | GcState::EVACUATION).unwrap();
        set_operands(&mut world, holder, target);

        let stats = world.run(&program).unwrap();

        assert_eq!(stats.mid_path_entries, 1, "{}", isa);
        assert_eq!(stats.slow_path_entries, 1, "{}", isa);
        assert_eq!(stats.called(StubKind::LoadBarrierStrong.name()), 1);
        let copy = world.machine.reg(regs(isa).result);
        assert_ne!(copy, target);
        assert_eq!(world.runtime.heap.forwardee(target), Some(copy));
        assert_eq!(world.read_ref(holder + FIELD as u64, false).unwrap(), copy);
    }
}

/// Strong load of an object outside the cset while forwarding is active
///
/// **Invariant verified:** the mid path filters the call out
#[test]
fn test_strong_outside_cset_filtered_by_mid_path() {
    for isa in Isa::ALL {
        let config = config();
        let program = lrb_program(isa, &config, ReferenceStrength::Strong, false);
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.add_to_cset(2).unwrap();
        world.set_gc_state(GcState::HAS_FORWARDED).unwrap();
        set_operands(&mut world, holder, target);
        world.machine.memory.enable_trace();

        let stats = world.run(&program).unwrap();

        assert_eq!(stats.mid_path_entries, 1);
        assert!(stats.calls.is_empty());
        assert_eq!(world.machine.reg(regs(isa).result), target);
        let (table, _) = world.runtime.heap.cset_table();
        assert_eq!(world.machine.memory.reads_of(table + 1), 1, "{}", isa);
    }
}

/// Two barriered loads of the same slot in succession
///
/// **Bug this finds:** healing with a stale value, double evacuation
/// **Invariant verified:** both loads yield the same reference
#[test]
fn test_load_barrier_is_idempotent() {
    for isa in Isa::ALL {
        let config = config();
        let r = regs(isa);
        let address = Address::with_disp(r.base, FIELD);
        let (program, _) = emit(isa, &config, |barriers, ops| {
            barriers.emit_barriered_load(ops, BarrierType::Field, r.result, address, false, [r.object, r.tmp1, r.tmp2])?;
            barriers.emit_barriered_load(ops, BarrierType::Field, r.extra, address, false, [r.object, r.tmp1, r.tmp2])
        });
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.add_to_cset(1).unwrap();
        world.set_gc_state(GcState::HAS_FORWARDED).unwrap();
        world.machine.set_reg(r.base, holder);

        let stats = world.run(&program).unwrap();

        let first = world.machine.reg(r.result);
        assert_ne!(first, target);
        assert_eq!(world.machine.reg(r.extra), first, "{}", isa);
        assert_eq!(stats.calls.len(), 1);
        assert_eq!(world.runtime.heap.evacuated(), 1);
    }
}

/// Narrow slot healing
///
/// **Bug this finds:** healing a compressed slot with a full-width store
/// **Invariant verified:** the slot holds the encoded to-space copy
#[test]
fn test_narrow_slot_healed_with_encoded_copy() {
    for isa in Isa::ALL {
        let config = BarrierConfig { compressed_oops: Some(OopEncoding::DEFAULT), ..config() };
        let r = regs(isa);
        let (program, _) = emit(isa, &config, |barriers, ops| {
            barriers.emit_barriered_load(
                ops,
                BarrierType::Array,
                r.result,
                Address::with_disp(r.base, FIELD),
                true,
                [r.object, r.tmp1, r.tmp2],
            )
        });
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 2, true);
        world.add_to_cset(2).unwrap();
        world.set_gc_state(GcState::HAS_FORWARDED).unwrap();
        world.machine.set_reg(r.base, holder);

        let stats = world.run(&program).unwrap();

        assert_eq!(stats.called(StubKind::LoadBarrierStrongNarrow.name()), 1);
        let copy = world.machine.reg(r.result);
        assert!(copy >= HEAP_START && copy != target);
        assert_eq!(world.read_ref(holder + FIELD as u64, true).unwrap(), copy);
        let raw = world.machine.memory.peek(holder + FIELD as u64 + 4, shen_lir::Width::W32).unwrap();
        assert_eq!(raw, 0, "healing must not spill into the next slot");
    }
}

// ============================================================================
// WEAK AND PHANTOM REFERENCES
// ============================================================================

/// Weak and phantom loads of a dead referent while weak roots are processed
///
/// **Invariant verified:** the barrier returns null and leaves the slot alone
#[test]
fn test_dead_referent_reads_as_null() {
    for isa in Isa::ALL {
        for strength in [ReferenceStrength::Weak, ReferenceStrength::Phantom] {
            let config = config();
            let program = lrb_program(isa, &config, strength, false);
            let mut world = world(isa, &config);
            let (holder, target) = holder_and_target(&mut world, 1, false);
            world.runtime.heap.mark_unreachable(target);
            world.set_gc_state(GcState::WEAK_ROOTS | GcState::MARKING).unwrap();
            set_operands(&mut world, holder, target);

            world.run(&program).unwrap();

            assert_eq!(world.machine.reg(regs(isa).result), 0, "{} {}", isa, strength);
            assert_eq!(world.read_ref(holder + FIELD as u64, false).unwrap(), target);
        }
    }
}

/// Strong loads keep a dead referent alive
#[test]
fn test_strong_load_never_clears() {
    for isa in Isa::ALL {
        let config = config();
        let program = lrb_program(isa, &config, ReferenceStrength::Strong, false);
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.runtime.heap.mark_unreachable(target);
        world.set_gc_state(GcState::WEAK_ROOTS | GcState::HAS_FORWARDED).unwrap();
        set_operands(&mut world, holder, target);

        world.run(&program).unwrap();

        assert_eq!(world.machine.reg(regs(isa).result), target);
    }
}

// ============================================================================
// CALLING CONVENTIONS
// ============================================================================

/// Native-register stubs that clobber caller-saved registers
///
/// **Bug this finds:** argument moves overwriting each other, result read
/// from a clobbered register
#[test]
fn test_native_stubs_deliver_result() {
    for isa in Isa::ALL {
        let config = config();
        let r = regs(isa);
        let site = LoadBarrierSite::new(
            r.result,
            r.object,
            Address::with_disp(r.base, FIELD),
            ReferenceStrength::Strong,
            [r.tmp1, r.tmp2],
        );
        let barriers =
            shen_barrier::BarrierSetAssembler::new(config.clone(), RuntimeStubs::native(isa)).unwrap();
        let mut code = CodeBuffer::new(isa);
        barriers
            .emit_load_reference_barrier(&mut *ops_for(&mut code), &site)
            .unwrap();
        let program = code.finish().unwrap();

        let mut world = world_with(Scenario::new(isa, config).stubs(RuntimeStubs::native(isa)));
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.add_to_cset(1).unwrap();
        world.set_gc_state(GcState::HAS_FORWARDED).unwrap();
        set_operands(&mut world, holder, target);

        world.run(&program).unwrap();

        let copy = world.machine.reg(r.result);
        assert_eq!(world.runtime.heap.forwardee(target), Some(copy), "{}", isa);
        assert_eq!(world.read_ref(holder + FIELD as u64, false).unwrap(), copy);
    }
}

/// Far stub calls through a scratch register
#[test]
fn test_far_stub_calls_execute() {
    for isa in Isa::ALL {
        let config = BarrierConfig { far_stub_calls: true, ..config() };
        let program = lrb_program(isa, &config, ReferenceStrength::Weak, false);
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.set_gc_state(GcState::WEAK_ROOTS).unwrap();
        set_operands(&mut world, holder, target);

        let stats = world.run(&program).unwrap();

        assert_eq!(stats.called(StubKind::LoadBarrierWeak.name()), 1);
        assert_eq!(world.machine.reg(regs(isa).result), target);
    }
}

/// Barriered loads whose raw value would land in the address base
///
/// **Bug this finds:** the slow path healing a slot computed from the
/// loaded reference instead of the holder
/// **Invariant verified:** rejected before any code is emitted
#[test]
fn test_load_into_address_base_rejected() {
    for isa in Isa::ALL {
        let r = regs(isa);
        let barriers = barrier_set(isa, &config());
        let mut code = CodeBuffer::new(isa);
        {
            let mut ops = ops_for(&mut code);
            let address = Address::with_disp(r.object, FIELD);
            let load = barriers.emit_barriered_load(
                &mut *ops,
                BarrierType::Field,
                r.result,
                address,
                false,
                [r.object, r.tmp1, r.tmp2],
            );
            assert!(matches!(load, Err(BarrierError::AliasedRegisters { .. })), "{}: {:?}", isa, load);
            let referent = barriers.emit_referent_load(&mut *ops, r.result, address, [r.object, r.tmp1, r.tmp2]);
            assert!(matches!(referent, Err(BarrierError::AliasedRegisters { .. })), "{}: {:?}", isa, referent);
        }
        assert_eq!(code.instruction_count(), 0, "{}", isa);
    }
}
