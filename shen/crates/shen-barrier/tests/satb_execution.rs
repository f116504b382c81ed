//! SATB Pre-Write Barrier Execution Tests
//!
//! Runs emitted pre-write barriers, referent loads and reference stores on
//! the simulated runtime:
//! - Nothing is logged outside marking
//! - The thread-local buffer fills downward and overflows into the stub
//! - Diagnostic modes (forced slow path, value verification)
//! - Card dirtying after stores in generational mode

mod common;

use common::*;
use proptest::prelude::*;
use shen_barrier::card::{CLEAN_CARD, DIRTY_CARD};
use shen_barrier::sim::{Scenario, SimError, SimWorld, CARD_TABLE_BASE, HEAP_START, SATB_BASE};
use shen_barrier::backend::ops_for;
use shen_barrier::{
    BarrierConfig, BarrierError, BarrierSetAssembler, GcState, OopEncoding, PreWriteSite, RuntimeStubs, StubKind,
};
use shen_lir::interp::InterpError;
use shen_lir::{Address, CodeBuffer, Isa, Program};

/// Pre-write barrier loading the previous value from `[base + FIELD]`
fn pre_write_program(isa: Isa, config: &BarrierConfig) -> Program {
    let r = regs(isa);
    let site = PreWriteSite::load(Address::with_disp(r.base, FIELD), r.tmp1, r.tmp2);
    emit(isa, config, |barriers, ops| barriers.emit_pre_write_barrier(ops, &site)).0
}

/// Run `program` once per fresh holder; returns the previous values in order
fn overwrite_fresh_slots(world: &mut SimWorld, program: &Program, count: usize) -> Vec<u64> {
    let base = regs(world.isa()).base;
    (0..count)
        .map(|_| {
            let (holder, target) = holder_and_target(world, 1, false);
            world.machine.set_reg(base, holder);
            world.run(program).expect("pre-write should run");
            target
        })
        .collect()
}

fn satb_index(world: &SimWorld) -> u64 {
    world.runtime.thread.satb_index(&world.machine.memory).unwrap()
}

// ============================================================================
// MARKING INACTIVE
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Pre-write barrier with MARKING clear
    ///
    /// **Bug this finds:** marking test on the wrong bit, inverted branch
    /// **Invariant verified:** no buffer write, no index update, no stub call
    #[test]
    fn prop_no_logging_outside_marking(
        bits in (0u8..0x80).prop_map(|s| s & !0x02).prop_filter("publishable", publishable),
        slow_path_only in any::<bool>(),
        isa in prop::sample::select(Isa::ALL.to_vec()),
    ) {
        let config = BarrierConfig { slow_path_only, ..config() };
        let program = pre_write_program(isa, &config);
        let mut world = world(isa, &config);
        world.set_gc_state(GcState::from_bits_truncate(bits)).unwrap();
        world.machine.memory.enable_trace();

        overwrite_fresh_slots(&mut world, &program, 3);

        prop_assert!(world.logged().unwrap().is_empty());
        prop_assert_eq!(world.runtime.total_calls(), 0);
        prop_assert_eq!(world.machine.memory.writes_to(SATB_BASE, SATB_BASE + 0x1000), 0);
        prop_assert_eq!(satb_index(&world), 16 * 8);
    }

    /// N pre-writes into a buffer with room for at least N entries
    ///
    /// **Bug this finds:** index decremented by the wrong amount, entry
    /// written above the index instead of at it
    /// **Invariant verified:** index drops by exactly N entries and the
    /// buffer holds the N values newest first
    #[test]
    fn prop_buffer_fills_downward(
        n in 1usize..=8,
        extra_marking in any::<bool>(),
        isa in prop::sample::select(Isa::ALL.to_vec()),
    ) {
        let config = config();
        let program = pre_write_program(isa, &config);
        let mut world = world_with(Scenario::new(isa, config).satb_entries(8));
        let mut state = GcState::MARKING;
        if extra_marking {
            state.insert(GcState::OLD_MARKING);
        }
        world.set_gc_state(state).unwrap();

        let values = overwrite_fresh_slots(&mut world, &program, n);

        prop_assert_eq!(satb_index(&world), ((8 - n) * 8) as u64);
        let mut newest_first = values.clone();
        newest_first.reverse();
        prop_assert_eq!(world.satb_entries().unwrap(), newest_first);
        for (i, value) in values.iter().enumerate() {
            let slot = SATB_BASE + ((7 - i) * 8) as u64;
            prop_assert_eq!(world.machine.memory.peek(slot, shen_lir::Width::W64).unwrap(), *value);
        }
        prop_assert_eq!(world.runtime.total_calls(), 0);
    }
}

/// Null previous value while marking
///
/// **Invariant verified:** nothing is logged for a null slot
#[test]
fn test_null_previous_not_logged() {
    for isa in Isa::ALL {
        let config = config();
        let program = pre_write_program(isa, &config);
        let mut world = world(isa, &config);
        world.set_gc_state(GcState::MARKING).unwrap();
        let holder = world.allocate(0, OBJECT_SIZE).unwrap();
        world.machine.set_reg(regs(isa).base, holder);

        let stats = world.run(&program).unwrap();

        assert!(stats.calls.is_empty());
        assert!(world.logged().unwrap().is_empty(), "{}", isa);
    }
}

// ============================================================================
// BUFFER EXHAUSTION
// ============================================================================

/// Pre-writes past the buffer capacity
///
/// **Bug this finds:** writing below the buffer once the index hits zero
/// **Invariant verified:** the stub takes every entry that does not fit,
/// nothing is lost and the order is preserved
#[test]
fn test_full_buffer_goes_to_stub() {
    for isa in Isa::ALL {
        let config = config();
        let program = pre_write_program(isa, &config);
        let mut world = world_with(Scenario::new(isa, config).satb_entries(2));
        world.set_gc_state(GcState::MARKING).unwrap();

        let values = overwrite_fresh_slots(&mut world, &program, 5);

        assert_eq!(world.runtime.calls(StubKind::PreWrite), 2, "{}", isa);
        assert_eq!(world.runtime.runtime_logged(), &[values[2], values[4]]);
        assert_eq!(world.runtime.completed_buffers().len(), 2);
        assert_eq!(world.logged().unwrap(), values);
    }
}

/// Index already at zero when marking starts
#[test]
fn test_zero_index_always_calls_stub() {
    for isa in Isa::ALL {
        let config = config();
        let program = pre_write_program(isa, &config);
        let mut world = world(isa, &config);
        world.set_gc_state(GcState::MARKING).unwrap();
        world.runtime.thread.set_satb_index(&mut world.machine.memory, 0).unwrap();

        let values = overwrite_fresh_slots(&mut world, &program, 1);

        assert_eq!(world.runtime.runtime_logged(), values.as_slice(), "{}", isa);
    }
}

// ============================================================================
// DIAGNOSTIC MODES
// ============================================================================

/// Forced slow path
///
/// **Invariant verified:** every logged value goes through the stub and the
/// inline buffer write never runs
#[test]
fn test_slow_path_only_logs_through_stub() {
    for isa in Isa::ALL {
        let config = BarrierConfig { slow_path_only: true, ..config() };
        let program = pre_write_program(isa, &config);
        let mut world = world(isa, &config);
        world.set_gc_state(GcState::MARKING).unwrap();

        let values = overwrite_fresh_slots(&mut world, &program, 4);

        assert_eq!(world.runtime.runtime_logged(), values.as_slice(), "{}", isa);
        assert_eq!(world.runtime.calls(StubKind::PreWrite), 4);
        assert_eq!(world.logged().unwrap(), values);
    }
}

/// Value verification on a corrupted slot
///
/// **Invariant verified:** the verify stub aborts the run before logging
#[test]
fn test_verify_rejects_bad_previous_value() {
    for isa in Isa::ALL {
        let config = BarrierConfig { verify_oops: true, ..config() };
        let program = pre_write_program(isa, &config);
        let mut world = world(isa, &config);
        world.set_gc_state(GcState::MARKING).unwrap();
        let holder = world.allocate(0, OBJECT_SIZE).unwrap();
        world.write_ref(holder + FIELD as u64, 0x1234, false).unwrap();
        world.machine.set_reg(regs(isa).base, holder);

        let err = world.run(&program).unwrap_err();

        assert!(
            matches!(&err, SimError::Interp(InterpError::Stub { name, .. }) if *name == "verify_oop"),
            "{}: {}",
            isa,
            err
        );
        assert!(world.logged().unwrap().is_empty());
    }
}

/// Value verification on a valid slot passes the value through unchanged
#[test]
fn test_verify_passes_heap_reference() {
    for isa in Isa::ALL {
        let config = BarrierConfig { verify_oops: true, ..config() };
        let program = pre_write_program(isa, &config);
        let mut world = world(isa, &config);
        world.set_gc_state(GcState::MARKING).unwrap();

        let values = overwrite_fresh_slots(&mut world, &program, 2);

        assert_eq!(world.runtime.calls(StubKind::VerifyOop), 2);
        assert_eq!(world.logged().unwrap(), values, "{}", isa);
    }
}

// ============================================================================
// REFERENT LOADS
// ============================================================================

/// `Reference.get()` during marking
///
/// **Bug this finds:** referent read without keeping it alive
/// **Invariant verified:** the returned referent is logged
#[test]
fn test_referent_load_keeps_referent_alive() {
    for isa in Isa::ALL {
        let config = config();
        let r = regs(isa);
        let (program, _) = emit(isa, &config, |barriers, ops| {
            barriers.emit_referent_load(ops, r.result, Address::with_disp(r.base, FIELD), [r.object, r.tmp1, r.tmp2])
        });
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, false);
        world.set_gc_state(GcState::MARKING | GcState::WEAK_ROOTS).unwrap();
        world.machine.set_reg(r.base, holder);

        world.run(&program).unwrap();

        assert_eq!(world.machine.reg(r.result), target, "{}", isa);
        assert_eq!(world.logged().unwrap(), vec![target]);
    }
}

/// `Reference.get()` of a dead referent
///
/// **Invariant verified:** the barrier clears it and nothing is logged
#[test]
fn test_dead_referent_not_resurrected() {
    for isa in Isa::ALL {
        let config = BarrierConfig { compressed_oops: Some(OopEncoding::DEFAULT), ..config() };
        let r = regs(isa);
        let (program, _) = emit(isa, &config, |barriers, ops| {
            barriers.emit_referent_load(ops, r.result, Address::with_disp(r.base, FIELD), [r.object, r.tmp1, r.tmp2])
        });
        let mut world = world(isa, &config);
        let (holder, target) = holder_and_target(&mut world, 1, true);
        world.runtime.heap.mark_unreachable(target);
        world.set_gc_state(GcState::MARKING | GcState::WEAK_ROOTS).unwrap();
        world.machine.set_reg(r.base, holder);

        world.run(&program).unwrap();

        assert_eq!(world.machine.reg(r.result), 0, "{}", isa);
        assert!(world.logged().unwrap().is_empty());
        assert_eq!(world.runtime.calls(StubKind::LoadBarrierWeakNarrow), 1);
    }
}

// ============================================================================
// REFERENCE STORES
// ============================================================================

fn store_program(isa: Isa, config: &BarrierConfig) -> Program {
    let r = regs(isa);
    emit(isa, config, |barriers, ops| {
        barriers.emit_reference_store(ops, Address::with_disp(r.base, FIELD), r.extra, [r.tmp1, r.tmp2])
    })
    .0
}

fn card_address(slot: u64, config: &BarrierConfig) -> u64 {
    CARD_TABLE_BASE + ((slot - HEAP_START) >> config.heap.card_shift)
}

/// Generational store during marking
///
/// **Invariant verified:** old value logged, new value stored, card dirtied
#[test]
fn test_store_logs_stores_and_dirties_card() {
    for isa in Isa::ALL {
        for compressed in [false, true] {
            let config = BarrierConfig {
                generational: true,
                compressed_oops: compressed.then_some(OopEncoding::DEFAULT),
                ..config()
            };
            let program = store_program(isa, &config);
            let mut world = world(isa, &config);
            let (holder, old) = holder_and_target(&mut world, 1, compressed);
            let new = world.allocate(2, OBJECT_SIZE).unwrap();
            world.set_gc_state(GcState::MARKING | GcState::YOUNG_MARKING).unwrap();
            let r = regs(isa);
            world.machine.set_reg(r.base, holder);
            world.machine.set_reg(r.extra, new);

            world.run(&program).unwrap();

            let slot = holder + FIELD as u64;
            assert_eq!(world.logged().unwrap(), vec![old], "{} compressed={}", isa, compressed);
            assert_eq!(world.read_ref(slot, compressed).unwrap(), new);
            assert_eq!(world.card(slot).unwrap(), DIRTY_CARD);
            assert_eq!(world.card(new).unwrap(), CLEAN_CARD);
        }
    }
}

/// Non-generational store leaves the card table alone
#[test]
fn test_store_without_generations_skips_cards() {
    for isa in Isa::ALL {
        let config = config();
        let program = store_program(isa, &config);
        let mut world = world(isa, &config);
        let (holder, _) = holder_and_target(&mut world, 1, false);
        let r = regs(isa);
        world.machine.set_reg(r.base, holder);
        world.machine.set_reg(r.extra, 0);
        world.machine.memory.enable_trace();

        world.run(&program).unwrap();

        assert_eq!(world.read_ref(holder + FIELD as u64, false).unwrap(), 0);
        assert_eq!(world.card(holder).unwrap(), CLEAN_CARD, "{}", isa);
        assert!(world.logged().unwrap().is_empty());
    }
}

/// Conditional card marking on an already dirty card
///
/// **Invariant verified:** the card byte is read but not rewritten
#[test]
fn test_conditional_card_mark_skips_dirty_card() {
    for isa in Isa::ALL {
        let config = BarrierConfig { generational: true, conditional_card_mark: true, ..config() };
        let program = store_program(isa, &config);
        let mut world = world(isa, &config);
        let (holder, _) = holder_and_target(&mut world, 1, false);
        let r = regs(isa);
        world.machine.set_reg(r.base, holder);
        world.machine.set_reg(r.extra, 0);

        world.run(&program).unwrap();
        let card = card_address(holder + FIELD as u64, &config);
        assert_eq!(world.card(holder).unwrap(), DIRTY_CARD);

        world.machine.memory.enable_trace();
        world.run(&program).unwrap();

        assert_eq!(world.machine.memory.reads_of(card), 1, "{}", isa);
        assert_eq!(world.machine.memory.writes_to(card, card + 1), 0, "{}", isa);
    }
}

/// Store whose old value lands in a full SATB buffer
///
/// **Bug this finds:** address base or new value read back after the
/// pre-write stub call overwrote them
/// **Invariant verified:** both stores complete and both old values are logged
#[test]
fn test_store_through_full_buffer_keeps_operands() {
    for isa in Isa::ALL {
        let config = config();
        let program = store_program(isa, &config);
        let mut world = world_with(Scenario::new(isa, config.clone()).satb_entries(1));
        let (first, old1) = holder_and_target(&mut world, 1, false);
        let (second, old2) = holder_and_target(&mut world, 1, false);
        let new1 = world.allocate(2, OBJECT_SIZE).unwrap();
        let new2 = world.allocate(2, OBJECT_SIZE).unwrap();
        world.set_gc_state(GcState::MARKING).unwrap();
        let r = regs(isa);

        for (holder, new) in [(first, new1), (second, new2)] {
            world.machine.set_reg(r.base, holder);
            world.machine.set_reg(r.extra, new);
            world.run(&program).unwrap();
        }

        assert_eq!(world.read_ref(first + FIELD as u64, false).unwrap(), new1, "{}", isa);
        assert_eq!(world.read_ref(second + FIELD as u64, false).unwrap(), new2, "{}", isa);
        assert_eq!(world.logged().unwrap(), vec![old1, old2]);
        assert_eq!(world.runtime.calls(StubKind::PreWrite), 1);
    }
}

/// Composite sequences with stubs that clobber caller-saved registers
///
/// **Invariant verified:** rejected before any code is emitted
#[test]
fn test_composite_sequences_reject_clobbering_stubs() {
    for isa in Isa::ALL {
        let r = regs(isa);
        let barriers = BarrierSetAssembler::new(config(), RuntimeStubs::native(isa)).unwrap();
        let mut code = CodeBuffer::new(isa);
        {
            let mut ops = ops_for(&mut code);
            let store =
                barriers.emit_reference_store(&mut *ops, Address::with_disp(r.base, FIELD), r.extra, [r.tmp1, r.tmp2]);
            assert!(
                matches!(store, Err(BarrierError::InvalidSite { site: "reference store", .. })),
                "{}: {:?}",
                isa,
                store
            );
            let referent = barriers.emit_referent_load(
                &mut *ops,
                r.result,
                Address::with_disp(r.base, FIELD),
                [r.object, r.tmp1, r.tmp2],
            );
            assert!(
                matches!(referent, Err(BarrierError::InvalidSite { site: "referent load", .. })),
                "{}: {:?}",
                isa,
                referent
            );
        }
        assert_eq!(code.instruction_count(), 0, "{}", isa);
    }
}
