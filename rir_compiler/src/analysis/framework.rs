//! Dispatcher and driver abstractions.
//!
//! A `Dispatcher` reacts to the instruction under a cursor; a driver decides
//! which instructions the dispatcher sees and in what order. The linear
//! driver visits each instruction once in list order. The forward driver
//! runs a worklist-based abstract interpretation to a fixpoint, merging
//! states at labels.
//!
//! Analyses must be monotone over their state lattice or the fixpoint
//! guarantees nothing.

use crate::analysis::editor::{CodeEditor, EditNode, JumpKind, LabelId, NodeId};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// A lattice value for forward analysis.
pub trait AbstractState: Clone {
    /// Merge `other` into `self`. Returns true if `self` changed (the
    /// merge moved strictly up the lattice).
    fn merge_with(&mut self, other: &Self) -> bool;
}

/// Receiver of dispatched instructions.
///
/// A dispatcher that encounters something it cannot handle records failure
/// instead of raising; the driver reports it to the caller.
pub trait Dispatcher {
    fn dispatch(&mut self, editor: &mut CodeEditor, at: NodeId);

    fn failed(&self) -> bool {
        false
    }
}

/// Visits every instruction once, in program order.
///
/// The dispatcher may insert nodes anywhere and may remove the node under
/// the cursor; the driver continues at the removed node's successor.
pub struct LinearDriver;

impl LinearDriver {
    /// Returns false if the dispatcher reported failure.
    pub fn run(editor: &mut CodeEditor, dispatcher: &mut impl Dispatcher) -> bool {
        let mut cur = editor.first();
        while let Some(id) = cur {
            let next = editor.next(id);
            dispatcher.dispatch(editor, id);
            if dispatcher.failed() {
                return false;
            }
            // Follow the successor chosen before dispatch unless the
            // dispatcher removed it too; node ids stay valid either way.
            cur = next;
        }
        true
    }
}

/// Transfer function of a forward analysis.
pub trait ForwardAnalysis {
    type State: AbstractState;

    /// Apply the effect of one instruction to the rolling state.
    fn apply(&mut self, state: &mut Self::State, instr: &EditNode);
}

/// Worklist-based forward abstract interpretation.
///
/// Stores one state per label (mergepoint) plus one rolling state per
/// active worklist item. After the run, [`ForwardDriver::state_at`] can
/// rebuild the state at any instruction from the nearest stored mergepoint.
pub struct ForwardDriver<A: ForwardAnalysis> {
    mergepoints: FxHashMap<LabelId, A::State>,
}

impl<A: ForwardAnalysis> Default for ForwardDriver<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ForwardAnalysis> ForwardDriver<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mergepoints: FxHashMap::default(),
        }
    }

    /// The stored state at a label, after a run.
    #[must_use]
    pub fn mergepoint(&self, l: LabelId) -> Option<&A::State> {
        self.mergepoints.get(&l)
    }

    /// Run to fixpoint from the first instruction.
    pub fn run(&mut self, editor: &CodeEditor, analysis: &mut A, initial: A::State) {
        self.mergepoints.clear();
        let Some(entry) = editor.first() else { return };
        let mut queue: VecDeque<(NodeId, A::State)> = VecDeque::new();
        queue.push_back((entry, initial));

        while let Some((start, mut state)) = queue.pop_front() {
            let mut cur = Some(start);
            while let Some(id) = cur {
                let node = editor.get(id);
                if let EditNode::Label(l) = node {
                    // Fixpoint check at the mergepoint.
                    match self.mergepoints.get_mut(l) {
                        None => {
                            self.mergepoints.insert(*l, state.clone());
                        }
                        Some(stored) => {
                            if !stored.merge_with(&state) {
                                break; // lattice fixpoint, cut this path
                            }
                            state = stored.clone();
                        }
                    }
                }
                analysis.apply(&mut state, node);
                match node {
                    EditNode::Jump { kind, target } => {
                        let tnode = editor.label_node(*target);
                        if matches!(kind, JumpKind::Br) {
                            cur = Some(tnode);
                            continue;
                        }
                        queue.push_back((tnode, state.clone()));
                        cur = editor.next(id);
                    }
                    EditNode::Instr(bc) if bc.is_exit() => break,
                    _ => cur = editor.next(id),
                }
            }
        }
    }

    /// Rebuild the state at `at` by replaying forward from the nearest
    /// preceding mergepoint (or the entry). Only valid after [`run`].
    ///
    /// [`run`]: ForwardDriver::run
    pub fn state_at(
        &self,
        editor: &CodeEditor,
        analysis: &mut A,
        initial: &A::State,
        at: NodeId,
    ) -> A::State {
        // Find the replay origin.
        let mut origin = editor.first().expect("empty code");
        let mut state = initial.clone();
        let mut back = Some(at);
        while let Some(id) = back {
            if let EditNode::Label(l) = editor.get(id) {
                if let Some(stored) = self.mergepoints.get(l) {
                    origin = id;
                    state = stored.clone();
                    break;
                }
            }
            back = editor.prev(id);
        }
        // Replay forward.
        let mut cur = origin;
        loop {
            if cur == at {
                return state;
            }
            analysis.apply(&mut state, editor.get(cur));
            cur = editor.next(cur).expect("walked past the query point");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::CodeBuilder;
    use crate::bytecode::instruction::BC;
    use rir_core::pool::{PoolIdx, SrcIdx};

    /// Operand-stack depth as a tiny lattice: merge requires equality on
    /// joining paths, which the builder guarantees.
    #[derive(Clone, PartialEq, Debug)]
    struct Depth(u32);

    impl AbstractState for Depth {
        fn merge_with(&mut self, other: &Self) -> bool {
            if other.0 > self.0 {
                self.0 = other.0;
                return true;
            }
            false
        }
    }

    struct DepthAnalysis;

    impl ForwardAnalysis for DepthAnalysis {
        type State = Depth;

        fn apply(&mut self, state: &mut Depth, instr: &EditNode) {
            match instr {
                EditNode::Instr(bc) => {
                    state.0 = state.0 - bc.pops() as u32 + bc.pushes() as u32;
                }
                EditNode::Jump { kind, .. } => {
                    if matches!(kind, JumpKind::BrTrue | JumpKind::BrFalse) {
                        state.0 -= 1;
                    }
                }
                EditNode::Label(_) => {}
            }
        }
    }

    fn diamond() -> CodeEditor {
        // push c; brtrue T; push 1; br E; T: push 2; E: ret
        let mut b = CodeBuilder::new();
        b.emit(BC::Push(PoolIdx(0)));
        let t = b.label();
        let e = b.label();
        b.br_true(t);
        b.emit(BC::Push(PoolIdx(1)));
        b.br(e);
        b.bind(t);
        b.emit(BC::Push(PoolIdx(2)));
        b.bind(e);
        b.emit(BC::Ret);
        let code = b.finish(SrcIdx(0));
        CodeEditor::from_code(&code).unwrap()
    }

    #[test]
    fn test_fixpoint_merges_at_join() {
        let ed = diamond();
        let mut driver = ForwardDriver::new();
        driver.run(&ed, &mut DepthAnalysis, Depth(0));
        // Both labels reached; the join label carries depth 1.
        let join = ed
            .iter()
            .filter_map(|id| match ed.get(id) {
                EditNode::Label(l) => Some(*l),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(driver.mergepoint(join), Some(&Depth(1)));
    }

    #[test]
    fn test_state_reconstruction() {
        let ed = diamond();
        let mut driver = ForwardDriver::new();
        driver.run(&ed, &mut DepthAnalysis, Depth(0));
        // State just before ret is depth 1.
        let ret = ed
            .iter()
            .find(|id| matches!(ed.get(*id), EditNode::Instr(BC::Ret)))
            .unwrap();
        let s = driver.state_at(&ed, &mut DepthAnalysis, &Depth(0), ret);
        assert_eq!(s, Depth(1));
    }

    #[test]
    fn test_loop_terminates() {
        // head: push; pop; br head  (infinite loop, analysis must still stop)
        let mut b = CodeBuilder::new();
        let head = b.label();
        b.bind(head);
        b.emit(BC::Push(PoolIdx(0)));
        b.emit(BC::Pop);
        b.br(head);
        let code = b.finish(SrcIdx(0));
        let ed = CodeEditor::from_code(&code).unwrap();
        let mut driver = ForwardDriver::new();
        driver.run(&ed, &mut DepthAnalysis, Depth(0));
        let l = ed
            .iter()
            .find_map(|id| match ed.get(id) {
                EditNode::Label(l) => Some(*l),
                _ => None,
            })
            .unwrap();
        assert_eq!(driver.mergepoint(l), Some(&Depth(0)));
    }

    struct CountingDispatcher {
        seen: usize,
    }

    impl Dispatcher for CountingDispatcher {
        fn dispatch(&mut self, editor: &mut CodeEditor, at: NodeId) {
            if !matches!(editor.get(at), EditNode::Label(_)) {
                self.seen += 1;
            }
        }
    }

    #[test]
    fn test_linear_driver_visits_everything_once() {
        let mut ed = diamond();
        let mut d = CountingDispatcher { seen: 0 };
        assert!(LinearDriver::run(&mut ed, &mut d));
        assert_eq!(d.seen, 6, "4 instructions + 2 jumps");
    }
}
