//! The SSA-to-native lowering stage of an ahead-of-time compiler.
//!
//! The input is a statically-typed flow graph in SSA form ([ssa_ir]), produced by an upstream
//! optimiser together with a precomputed liveness oracle ([liveness]). The output is a module of
//! an external native code-generation backend ([backend]) plus one call-site metadata record per
//! patch point ([irsmp]).
//!
//! The interesting parts live in [lower]: reconstructing dataflow merges (phi nodes) while
//! visiting blocks in an order that does not guarantee predecessors come first, merging values
//! into exception handlers from call sites that are not graph predecessors, and wrapping every
//! call in a safepoint that exposes the live heap references to a precise, moving collector.
//!
//! This stage is invoked programmatically, once per function, via [lower::lower_function]. It is
//! single-threaded and synchronous: a function either lowers completely or the compilation unit
//! is abandoned with a [LowerError].

pub mod backend;
pub mod liveness;
mod log;
pub mod lower;
pub mod ssa_ir;

pub use lower::{lower_function, LoweredFunction};

use thiserror::Error;

/// A failure to lower a function.
///
/// All of these are non-recoverable: there is no partial result or retry path. The surrounding
/// compiler driver reports them as internal-compiler-error diagnostics and stops.
#[derive(Debug, Error)]
pub enum LowerError {
    /// The lowering for this operation has not been implemented.
    #[error("unsupported IR operation: {0}")]
    Unsupported(&'static str),
    /// An SSA id was read with no recorded value descriptor (use before def, or a liveness set
    /// naming an id the predecessor never defined).
    #[error("no value recorded for SSA id {0}")]
    UndefinedValue(usize),
    /// Two predecessors supplied phi inputs whose native types are outside the coercion table.
    #[error("cannot reconcile phi input types: {from} -> {to}")]
    PhiInputType { from: backend::Ty, to: backend::Ty },
    /// Two throwing call sites disagreed about a constant flowing into the same handler.
    #[error("exception-edge merge: conflicting constants for SSA id {0}")]
    ConstantMismatch(usize),
    /// An internal invariant did not hold; this is a bug in the lowering engine.
    #[error("internal error: {0}")]
    Internal(String),
    /// An index type overflowed its representation.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

impl From<irsmp::StackMapError> for LowerError {
    fn from(e: irsmp::StackMapError) -> Self {
        LowerError::Internal(e.to_string())
    }
}
