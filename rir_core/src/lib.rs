//! Core data model for the RIR execution engine.
//!
//! This crate holds everything both the compiler tiers and the interpreter
//! need to agree on: the host value shim ([`value`]), the symbol interner
//! ([`intern`]), the append-only constant and source pools ([`pool`]), code
//! objects and dispatch tables ([`code`], [`function`]), inline runtime
//! feedback ([`feedback`]), the assumption lattice ([`assumptions`]), the
//! deoptimization metadata layout ([`deopt`]), and the shared error taxonomy
//! ([`error`]).

pub mod assumptions;
pub mod ast;
pub mod code;
pub mod debug;
pub mod deopt;
pub mod error;
pub mod feedback;
pub mod function;
pub mod intern;
pub mod pool;
pub mod value;

pub use assumptions::{ArgAssume, Assumptions, OptimizationContext};
pub use code::Code;
pub use debug::DebugFlags;
pub use deopt::{DeoptMetadata, FrameInfo};
pub use error::{RirError, Unwind};
pub use feedback::{CallFeedback, FeedbackSlot, ObservedType, TypeFeedback};
pub use function::{DispatchTable, Function, FunctionSignature};
pub use intern::{sym, Symbol};
pub use pool::{ConstPool, PoolIdx, SrcIdx, SrcPool};
pub use value::{Env, RVal};
