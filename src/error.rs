//! Errors raised while lowering foreign lifter output into the IR.
//!
//! There are two categories: [`LowerError`] is terminal for the current
//! translation unit, while [`FastPathError`] is an expected signal from the per-instruction fast
//! path that the caller answers by falling back to the general lifting path.

use thiserror::Error;

/// A fatal lowering failure. The first one encountered aborts the whole block or program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LowerError {
    /// The foreign source referenced a name that no enclosing scope declared
    #[error("undeclared variable `{0}`")]
    UndeclaredVariable(String),
    /// A foreign operator with no IR equivalent (e.g. the deprecated rotates)
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// A foreign expression or statement kind the lowering engine does not handle
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),
    /// A foreign width outside of 1/8/16/32/64 bits
    #[error("unsupported register width: {0} bits")]
    UnsupportedWidth(u32),
    /// The left-hand side of a move lowered to something other than a variable or a load
    #[error("invalid assignment target: {0}")]
    InvalidAssignmentTarget(String),
    /// The binary image could not supply its section contents
    #[error("could not read sections: {0}")]
    SectionReadFailure(String),
    /// The binary image could not enumerate its symbols
    #[error("could not enumerate symbols: {0}")]
    SymbolEnumerationFailure(String),
    /// The general lifting path failed for an address
    #[error("lifting failed at {address:#x}: {reason}")]
    LiftFailure { address: u64, reason: String },
    /// Lowering an address returned a next address that does not move forward
    #[error("lowering {address:#x} did not advance (next address {next:#x})")]
    NonAdvancingAddress { address: u64, next: u64 },
    /// The lifter handle was used after it was released
    #[error("lifter handle used after release")]
    LifterReleased,
}

/// The outcome of a failed fast-path lowering. Neither variant is fatal by itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FastPathError {
    /// The fast path has no translation for this instruction
    #[error("not implemented by the fast path")]
    Unimplemented,
    /// The fast path failed for a reason that the general path may not share
    #[error("fast path failed: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, LowerError>;
