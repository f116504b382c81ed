//! Error Module - Barrier Emission Error Types
//!
//! Almost every error here is a compiler-correctness bug: the barrier
//! emitter refuses to produce code rather than emit a sequence that could
//! corrupt the heap. The method being compiled must be abandoned.
//!
//! # Error Categories
//!
//! ## Contract Violations
//! - `CallingConvention` - Stub convention has the wrong arity
//! - `MissingReturn` - Stub convention has no return location
//! - `AliasedRegisters` - Registers that must be distinct alias
//! - `UnsupportedBarrierType` - Access kind has no reference strength
//! - `InvalidSite` - Malformed barrier site
//!
//! ## Emission Errors
//! - `ScratchExhausted` - No scratch register left
//! - `ScratchLeak` - Scratch register not released after a barrier
//! - `Lir` - Unencodable instruction or broken label
//!
//! ## Configuration Errors
//! - `Config` - Invalid barrier configuration

use shen_lir::{Isa, LirError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::strength::BarrierType;
use crate::stubs::StubKind;

/// Main error type for barrier emission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierError {
    /// Stub calling convention has the wrong number of arguments
    ///
    /// **When returned:** A load barrier stub without exactly two arguments, a
    /// pre-write stub without exactly one
    ///
    /// **Recovery strategy:** None - the stub table is broken
    #[error("stub {stub} expects {expected} arguments, calling convention has {actual}")]
    CallingConvention { stub: StubKind, expected: usize, actual: usize },

    /// Stub that produces a value has no return location
    #[error("stub {stub} has no return location")]
    MissingReturn { stub: StubKind },

    /// Stub without a result declares a return location
    #[error("stub {stub} must not return a value")]
    UnexpectedReturn { stub: StubKind },

    /// Two registers that must be pairwise distinct are the same
    ///
    /// **When returned:** Site construction, before any instruction is emitted
    ///
    /// **Recovery strategy:** None - register allocation handed out aliasing operands
    #[error("{site} barrier: {first} and {second} must be distinct registers")]
    AliasedRegisters { site: &'static str, first: String, second: String },

    /// Access kind has no reference strength
    #[error("unsupported barrier type {0:?}")]
    UnsupportedBarrierType(BarrierType),

    /// Site violates a structural precondition
    #[error("invalid {site} barrier site: {reason}")]
    InvalidSite { site: &'static str, reason: String },

    /// Scratch pool is empty
    #[error("no scratch register available on {isa}")]
    ScratchExhausted { isa: Isa },

    /// Emitter returned without releasing its scratch registers
    #[error("{count} scratch register(s) still held after {site} barrier")]
    ScratchLeak { site: &'static str, count: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lir(#[from] LirError),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl BarrierError {
    pub(crate) fn invalid_site(site: &'static str, reason: impl Into<String>) -> Self {
        BarrierError::InvalidSite { site, reason: reason.into() }
    }

    /// Check if this error indicates a bug in the compiler
    pub fn is_bug(&self) -> bool {
        !matches!(self, BarrierError::Config(_))
    }
}

/// Result type for barrier operations
pub type Result<T> = std::result::Result<T, BarrierError>;

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err.into());
        }
    };
}
