//! Basic blocks.

use crate::pir::instruction::InstrId;
use smallvec::SmallVec;

/// Arena index of a basic block within one closure version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BBId(pub u32);

/// An ordered instruction sequence with at most two successors. Phi
/// instructions precede all non-phi instructions; the last instruction is
/// the unique terminator.
#[derive(Debug, Clone, Default)]
pub struct BB {
    pub instrs: Vec<InstrId>,
    pub succs: SmallVec<[BBId; 2]>,
}

impl BB {
    #[must_use]
    pub fn new() -> BB {
        BB::default()
    }

    /// Set a single successor.
    pub fn set_next(&mut self, next: BBId) {
        self.succs.clear();
        self.succs.push(next);
    }

    /// Set the two-way branch successors: index 0 taken when true.
    pub fn set_branch(&mut self, on_true: BBId, on_false: BBId) {
        self.succs.clear();
        self.succs.push(on_true);
        self.succs.push(on_false);
    }
}
