//! Code analysis framework: editor, cursor, dispatcher, drivers.

pub mod editor;
pub mod framework;
pub mod peephole;

pub use editor::{CodeEditor, EditNode, JumpKind, LabelId, NodeId};
pub use framework::{AbstractState, Dispatcher, ForwardAnalysis, ForwardDriver, LinearDriver};
