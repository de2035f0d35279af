//! Dead-instruction elimination.
//!
//! An instruction is live if it has observable effects, is a terminator, or
//! is used by another live instruction. Liveness propagates backwards
//! through the use-def chains; everything unmarked is removed from its
//! block.

use crate::opt::Pass;
use crate::pir::{ClosureVersion, InstrId, Val};
use rir_core::pool::ConstPool;

pub struct Dce {
    removed: usize,
}

impl Dce {
    #[must_use]
    pub fn new() -> Self {
        Dce { removed: 0 }
    }

    /// Instructions removed over the lifetime of this pass object.
    #[must_use]
    pub fn removed(&self) -> usize {
        self.removed
    }
}

impl Default for Dce {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Dce {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&mut self, version: &mut ClosureVersion, _cp: &mut ConstPool) -> bool {
        let n = version.num_instrs();
        let mut live = vec![false; n];
        let mut worklist: Vec<InstrId> = Vec::new();

        // Roots: effectful instructions and terminators.
        for bb in &version.bbs {
            for &id in &bb.instrs {
                let instr = version.instr(id);
                if instr.is_terminator() || !instr.effects.is_pure() {
                    live[id.0 as usize] = true;
                    worklist.push(id);
                }
            }
        }

        // Propagate backwards through inputs.
        while let Some(id) = worklist.pop() {
            for input in version.instr(id).inputs() {
                if let Val::Instr(def) = input {
                    if !live[def.0 as usize] {
                        live[def.0 as usize] = true;
                        worklist.push(def);
                    }
                }
            }
        }

        let mut removed = 0;
        for bb in &mut version.bbs {
            bb.instrs.retain(|id| {
                let keep = live[id.0 as usize];
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        self.removed += removed;
        removed > 0
    }
}
