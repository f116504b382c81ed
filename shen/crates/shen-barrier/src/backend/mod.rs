//! Per-ISA implementations of [`BarrierTargetOps`]

pub mod aarch64;
pub mod amd64;

pub use aarch64::AArch64Ops;
pub use amd64::Amd64Ops;

use shen_lir::{CodeBuffer, Isa};

use crate::ops::BarrierTargetOps;

/// Backend for the instruction set of `code`
pub fn ops_for(code: &mut CodeBuffer) -> Box<dyn BarrierTargetOps + '_> {
    match code.isa() {
        Isa::Amd64 => Box::new(Amd64Ops::new(code)),
        Isa::AArch64 => Box::new(AArch64Ops::new(code)),
    }
}
