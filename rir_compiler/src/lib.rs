//! RIR: the stack-machine bytecode, its front compiler, and the code
//! analysis framework.
//!
//! The host hands unevaluated syntax trees to [`compile`], which produces
//! code objects in the compact bytecode defined by [`bytecode`]. The
//! [`analysis`] module supplies the cursor/dispatcher/driver triad used for
//! linear rewrites and forward abstract interpretation over bytecode.

pub mod analysis;
pub mod bytecode;
pub mod compile;

pub use bytecode::builder::CodeBuilder;
pub use bytecode::instruction::{Opcode, BC};
pub use compile::Compiler;
