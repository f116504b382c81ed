//! LIR (Low-level Intermediate Representation) Crate
//!
//! The instruction stream GC barriers are emitted into. Provides physical
//! registers for AMD64 and AArch64, addresses and instructions, labels and
//! basic blocks, foreign-call conventions, per-ISA encodability checks and
//! assembly listings, and an interpreter used to execute emitted code
//! against a simulated runtime.

pub mod aarch64;
pub mod amd64;
pub mod buffer;
pub mod calling_convention;
pub mod error;
pub mod interp;
pub mod lir;
pub mod reg;

pub use buffer::*;
pub use calling_convention::*;
pub use error::{LirError, Result};
pub use lir::*;
pub use reg::*;
