//! LIR construction errors

use thiserror::Error;

use crate::lir::Label;
use crate::reg::Isa;

/// Error raised while building or assembling LIR
///
/// Every variant is a compiler bug from the point of view of generated code:
/// the caller must abandon the method being compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LirError {
    /// **When returned:** `bind` called twice for the same label
    #[error("label {0} bound more than once")]
    LabelRebound(Label),

    /// **When returned:** a branch targets a label that was never bound
    #[error("branch to unbound label {0}")]
    UnboundLabel(Label),

    /// **When returned:** an out-of-line block does not end in a jump
    #[error("out-of-line block {0} falls through")]
    FallThrough(Label),

    /// **When returned:** the instruction has no encoding on the target
    #[error("instruction not encodable on {isa}: {reason}")]
    Unencodable { isa: Isa, reason: String },

    #[error("unknown block {0}")]
    UnknownBlock(u32),

    #[error("unknown instruction set: {0}")]
    UnknownIsa(String),
}

impl LirError {
    pub(crate) fn unencodable(isa: Isa, reason: impl Into<String>) -> Self {
        LirError::Unencodable { isa, reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, LirError>;
