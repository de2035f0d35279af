//! The RIR bytecode model: opcodes, immediate layout, decoder, and the
//! code-object builder.

pub mod builder;
pub mod instruction;

pub use builder::{CodeBuilder, Label};
pub use instruction::{Opcode, BC, DOTS_ARG_IDX, MISSING_ARG_IDX};
