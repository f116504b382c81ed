//! Test Utilities for Barrier Execution Tests
//!
//! Emits barriers through the public facade and runs them on the simulated
//! runtime. Every fixture uses 64KB regions so the whole heap stays small.

#![allow(dead_code)]

use shen_barrier::backend::ops_for;
use shen_barrier::sim::{Scenario, SimWorld};
use shen_barrier::{BarrierConfig, BarrierSetAssembler, BarrierTargetOps, GcState, HeapLayout, Result, RuntimeStubs};
use shen_lir::{aarch64, amd64, CodeBuffer, Isa, Program, Reg};

/// Region size shift used by every fixture
pub const REGION_SHIFT: u8 = 16;

/// Bytes of a test object: header word plus one reference field
pub const OBJECT_SIZE: u64 = 16;

/// Offset of the reference field inside a test object
pub const FIELD: i32 = 8;

/// ============================================================================
/// REGISTER ASSIGNMENT
/// ============================================================================

/// Registers a test hands to the emitters, none of them reserved
#[derive(Debug, Clone, Copy)]
pub struct Regs {
    pub result: Reg,
    pub object: Reg,
    pub base: Reg,
    pub tmp1: Reg,
    pub tmp2: Reg,
    pub extra: Reg,
    pub extra2: Reg,
}

pub fn regs(isa: Isa) -> Regs {
    match isa {
        Isa::Amd64 => Regs {
            result: amd64::RAX,
            object: amd64::RBX,
            base: amd64::RSI,
            tmp1: amd64::RCX,
            tmp2: amd64::RDX,
            extra: amd64::R8,
            extra2: amd64::R9,
        },
        Isa::AArch64 => Regs {
            result: aarch64::X0,
            object: aarch64::X1,
            base: aarch64::X2,
            tmp1: aarch64::X3,
            tmp2: aarch64::X4,
            extra: aarch64::X5,
            extra2: aarch64::X6,
        },
    }
}

/// ============================================================================
/// CONFIGURATION
/// ============================================================================

/// Default configuration with small regions
pub fn config() -> BarrierConfig {
    BarrierConfig {
        heap: HeapLayout { region_size_shift: REGION_SHIFT, ..Default::default() },
        ..Default::default()
    }
}

pub fn barrier_set(isa: Isa, config: &BarrierConfig) -> BarrierSetAssembler {
    BarrierSetAssembler::new(config.clone(), RuntimeStubs::stack_slots(isa))
        .expect("test configuration should be valid")
}

/// ============================================================================
/// EMISSION AND EXECUTION
/// ============================================================================

/// Emit one program through a fresh barrier set
pub fn emit<T>(
    isa: Isa,
    config: &BarrierConfig,
    body: impl FnOnce(&BarrierSetAssembler, &mut dyn BarrierTargetOps) -> Result<T>,
) -> (Program, T) {
    let barriers = barrier_set(isa, config);
    let mut code = CodeBuffer::new(isa);
    let value = {
        let mut ops = ops_for(&mut code);
        body(&barriers, &mut *ops).expect("emission should succeed")
    };
    (code.finish().expect("program should assemble"), value)
}

/// Machine and runtime for `config`
pub fn world(isa: Isa, config: &BarrierConfig) -> SimWorld {
    world_with(Scenario::new(isa, config.clone()))
}

pub fn world_with(scenario: Scenario) -> SimWorld {
    scenario.build().expect("scenario should build")
}

/// Holder object in region 0 whose field points at a fresh object in
/// `target_region`; returns `(holder, target)`
pub fn holder_and_target(world: &mut SimWorld, target_region: usize, narrow: bool) -> (u64, u64) {
    let holder = world.allocate(0, OBJECT_SIZE).expect("allocate holder");
    let target = world.allocate(target_region, OBJECT_SIZE).expect("allocate target");
    world
        .write_ref(holder + FIELD as u64, target, narrow)
        .expect("store field");
    (holder, target)
}

/// The collector never publishes `EVACUATION` without `HAS_FORWARDED`
pub fn publishable(bits: &u8) -> bool {
    GcState::from_bits_truncate(*bits).is_consistent()
}
