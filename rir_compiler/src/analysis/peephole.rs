//! Local bytecode cleanup over the editor.
//!
//! Removes `nop_` padding and cancels push/pop pairs left behind by
//! lowering. Runs as a linear dispatch; edits are O(1) on the list.

use crate::analysis::editor::{CodeEditor, EditNode, NodeId};
use crate::analysis::framework::{Dispatcher, LinearDriver};
use crate::bytecode::instruction::BC;

#[derive(Default)]
struct Peephole {
    removed: usize,
}

impl Dispatcher for Peephole {
    fn dispatch(&mut self, editor: &mut CodeEditor, at: NodeId) {
        if matches!(editor.get(at), EditNode::Instr(BC::Nop)) {
            editor.remove(at);
            self.removed += 1;
            return;
        }
        // A pure load followed directly by pop produces nothing. A label
        // in between means another path can land there.
        if matches!(
            editor.get(at),
            EditNode::Instr(BC::Push(_)) | EditNode::Instr(BC::LdLoc(_))
        ) {
            if let Some(next) = editor.next(at) {
                if matches!(editor.get(next), EditNode::Instr(BC::Pop)) {
                    editor.remove(next);
                    editor.remove(at);
                    self.removed += 2;
                }
            }
        }
    }
}

/// Run the cleanup, returning the number of removed instructions.
pub fn cleanup(editor: &mut CodeEditor) -> usize {
    let mut p = Peephole::default();
    LinearDriver::run(editor, &mut p);
    p.removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::CodeBuilder;
    use rir_core::pool::{PoolIdx, SrcIdx};

    #[test]
    fn test_removes_push_pop_pairs() {
        let mut b = CodeBuilder::new();
        b.emit(BC::Push(PoolIdx(0)));
        b.emit(BC::Pop);
        b.emit(BC::Nop);
        b.emit(BC::Push(PoolIdx(1)));
        b.emit(BC::Ret);
        let code = b.finish(SrcIdx(0));
        let mut ed = CodeEditor::from_code(&code).unwrap();
        assert_eq!(cleanup(&mut ed), 3);
        let ops: Vec<_> = ed
            .iter()
            .filter_map(|id| match ed.get(id) {
                EditNode::Instr(bc) => Some(bc.opcode()),
                _ => None,
            })
            .collect();
        use crate::bytecode::instruction::Opcode as O;
        assert_eq!(ops, vec![O::Push, O::Ret]);
    }

    #[test]
    fn test_label_blocks_pair_removal() {
        // The pop at the join consumes a value pushed on both paths; no
        // adjacent pair may be cancelled across the label.
        let mut b = CodeBuilder::new();
        b.emit(BC::Push(PoolIdx(9)));
        let t = b.label();
        let j = b.label();
        b.br_true(t);
        b.emit(BC::Push(PoolIdx(0)));
        b.br(j);
        b.bind(t);
        b.emit(BC::Push(PoolIdx(1)));
        b.bind(j);
        b.emit(BC::Pop);
        b.emit(BC::Push(PoolIdx(2)));
        b.emit(BC::Ret);
        let code = b.finish(SrcIdx(0));
        let mut ed = CodeEditor::from_code(&code).unwrap();
        assert_eq!(cleanup(&mut ed), 0);
    }
}
