//! The PIR data model.

pub mod bb;
pub mod effects;
pub mod instruction;
pub mod module;
pub mod types;

pub use bb::{BBId, BB};
pub use effects::Effects;
pub use instruction::{BinopKind, Instr, InstrId, InstrKind, UnopKind, Val};
pub use module::{ClosId, ClosureVersion, Module, PirClosure, PirPromise, PromId};
pub use types::PirType;
