//! # Shen Barrier - Shenandoah GC Barrier Emission
//!
//! Emits the read and write barriers a concurrent evacuating collector needs
//! into JIT-compiled code, for AMD64 and AArch64.
//!
//! ## Overview
//!
//! - **Load Reference Barrier**: after every reference load, resolve the
//!   loaded object to its to-space copy while evacuation is in progress, and
//!   return null for dead referents of weak and phantom loads
//! - **SATB Pre-Write Barrier**: before every reference store, log the value
//!   about to be overwritten while concurrent marking runs
//! - **Array-Range Barrier**: the pre-write barrier over a whole range of
//!   slots for bulk copies
//! - **Card Marking**: dirty the card of a stored-to slot in generational mode
//!
//! Every barrier has an inline fast path that tests one byte of per-thread
//! GC state, and moves everything else into out-of-line blocks that end in
//! a call to a runtime stub.
//!
//! ## Quick Start
//!
//! ```rust
//! use shen_barrier::{BarrierConfig, BarrierSetAssembler, BarrierType, RuntimeStubs};
//! use shen_barrier::backend::Amd64Ops;
//! use shen_lir::amd64::{RAX, RBX, RCX, RDX, RSI};
//! use shen_lir::{Address, CodeBuffer, Isa};
//!
//! fn main() -> Result<(), shen_barrier::BarrierError> {
//!     let barriers = BarrierSetAssembler::new(
//!         BarrierConfig::default(),
//!         RuntimeStubs::stack_slots(Isa::Amd64),
//!     )?;
//!
//!     let mut code = CodeBuffer::new(Isa::Amd64);
//!     barriers.emit_barriered_load(
//!         &mut Amd64Ops::new(&mut code),
//!         BarrierType::Field,
//!         RAX,
//!         Address::with_disp(RSI, 16),
//!         false,
//!         [RBX, RCX, RDX],
//!     )?;
//!
//!     let program = code.finish()?;
//!     println!("{}", program.listing());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │             BarrierSetAssembler              │
//! │   config · stub table · stats · logger       │
//! └──────────────────────┬───────────────────────┘
//!                        │ sites
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │  lrb · satb · array_range · card templates   │
//! │        (policy decides the shape)            │
//! └──────────────────────┬───────────────────────┘
//!                        │ BarrierTargetOps
//!                        ▼
//! ┌──────────────────────┬───────────────────────┐
//! │      Amd64Ops        │      AArch64Ops       │
//! └──────────────────────┴───────────────────────┘
//!                        │
//!                        ▼
//!               shen_lir::CodeBuffer
//! ```
//!
//! ## Testing
//!
//! The [`sim`] module runs emitted code on the LIR interpreter against a
//! simulated heap, thread block and runtime stubs.

// Core modules
pub mod config;
pub mod error;
pub mod gc_state;
pub mod strength;

// Emission contract
pub mod ops;
pub mod site;
pub mod stubs;

// Barrier templates
pub mod array_range;
pub mod card;
pub mod lrb;
pub mod policy;
pub mod satb;

// Backends and facade
pub mod backend;
pub mod barrier_set;

// Monitoring
pub mod logging;
pub mod stats;

// Simulation
pub mod sim;

// Re-export main types for convenience
pub use barrier_set::BarrierSetAssembler;
pub use config::{BarrierConfig, ConfigError, HeapLayout, OopEncoding, ThreadLayout};
pub use error::{BarrierError, Result};
pub use gc_state::GcState;
pub use ops::{BarrierTargetOps, ScratchPool};
pub use policy::{LoadBarrierPlan, PreWritePlan};
pub use site::{ArrayRangeSite, CardMarkSite, LoadBarrierSite, PreWriteSite, PreviousValue};
pub use stats::{BarrierKind, BarrierStats};
pub use strength::{BarrierType, ReferenceStrength};
pub use stubs::{RuntimeStubs, StubDescriptor, StubKind, StubReach};

/// Shen barrier version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
