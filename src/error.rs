//! Translation errors.
//!
//! Apart from `Verify`, every variant is a translator-internal invariant
//! violation: a correct opcode table and runtime never produce one from
//! verified bytecode. They abort the compilation of the current function
//! body, which then keeps running in the interpreter.

use crate::jit::memory::MemoryError;
use crate::vm::{Opcode, VerifyError};

pub type JitResult<T> = Result<T, JitError>;

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("label reused (already placed at offset {placed_at})")]
    LabelReused { placed_at: usize },
    #[error("label used too many times (limit {limit})")]
    TooManyLabelUses { limit: usize },
    #[error("branch too far: displacement {displacement} does not fit {width} byte(s) at offset {site}")]
    BranchTooFar {
        site: usize,
        displacement: i64,
        width: usize,
    },
    #[error("displacement {0} does not fit a 32-bit operand")]
    DisplacementOutOfRange(i64),
    #[error("call target {0:#x} is outside the reach of the selected call encoding")]
    CallTargetOutOfRange(usize),
    #[error("epilogue does not match the entry sequence: {0}")]
    EpilogueMismatch(&'static str),
    #[error("patch of {len} byte(s) at offset {offset} is outside the code buffer")]
    PatchOutOfBounds { offset: usize, len: usize },
    #[error("{op:?} requires immediate #{index}")]
    MissingImmediate { op: Opcode, index: usize },
    #[error("{op:?} at bytecode {pc} has no branch target")]
    MissingBranchTarget { op: Opcode, pc: usize },
    #[error("branch to bytecode {target} is outside the function body ({len} instructions)")]
    UnresolvedBranch { target: usize, len: usize },
    #[error("generated code cannot run on this host")]
    UnsupportedHost,
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}
