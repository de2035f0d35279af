//! Forward abstract interpretation over PIR.
//!
//! The same state lattice contract as the bytecode framework
//! ([`AbstractState`]), driven at basic-block granularity: one stored state
//! per block entry (the mergepoints), a FIFO worklist, and monotone merges
//! until fixpoint. Queries rebuild the state at any instruction by
//! replaying forward from its block entry.

use crate::pir::{BBId, ClosureVersion, InstrId};
use rir_compiler::analysis::framework::AbstractState;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Transfer function over PIR instructions.
pub trait PirAnalysis {
    type State: AbstractState;

    fn apply(&mut self, state: &mut Self::State, version: &ClosureVersion, instr: InstrId);
}

/// Worklist driver storing one state per block entry.
pub struct PirForwardDriver<A: PirAnalysis> {
    entry_states: FxHashMap<BBId, A::State>,
}

impl<A: PirAnalysis> Default for PirForwardDriver<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PirAnalysis> PirForwardDriver<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entry_states: FxHashMap::default(),
        }
    }

    /// The fixpoint state at a block entry, after [`run`].
    ///
    /// [`run`]: PirForwardDriver::run
    #[must_use]
    pub fn entry_state(&self, bb: BBId) -> Option<&A::State> {
        self.entry_states.get(&bb)
    }

    /// Run to fixpoint from `entry`.
    pub fn run(
        &mut self,
        version: &ClosureVersion,
        entry: BBId,
        analysis: &mut A,
        initial: A::State,
    ) {
        self.entry_states.clear();
        self.entry_states.insert(entry, initial);
        let mut queue: VecDeque<BBId> = VecDeque::new();
        queue.push_back(entry);

        while let Some(bb) = queue.pop_front() {
            let mut state = self.entry_states[&bb].clone();
            for &id in &version.bb(bb).instrs {
                analysis.apply(&mut state, version, id);
            }
            for &succ in &version.bb(bb).succs {
                match self.entry_states.get_mut(&succ) {
                    None => {
                        self.entry_states.insert(succ, state.clone());
                        queue.push_back(succ);
                    }
                    Some(stored) => {
                        if stored.merge_with(&state) {
                            queue.push_back(succ);
                        }
                    }
                }
            }
        }
    }

    /// Rebuild the state just before `at` by replaying its block.
    #[must_use]
    pub fn state_before(
        &self,
        version: &ClosureVersion,
        analysis: &mut A,
        bb: BBId,
        at: InstrId,
    ) -> Option<A::State> {
        let mut state = self.entry_states.get(&bb)?.clone();
        for &id in &version.bb(bb).instrs {
            if id == at {
                return Some(state);
            }
            analysis.apply(&mut state, version, id);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pir::instruction::{Instr, InstrKind, Val};
    use rir_core::assumptions::OptimizationContext;
    use rir_core::pool::PoolIdx;

    /// Saturating instruction counter: a finite lattice 0..=CAP.
    #[derive(Clone, PartialEq, Debug)]
    struct Count(u32);

    const CAP: u32 = 8;

    impl AbstractState for Count {
        fn merge_with(&mut self, other: &Self) -> bool {
            let merged = other.0.max(self.0).min(CAP);
            if merged > self.0 {
                self.0 = merged;
                true
            } else {
                false
            }
        }
    }

    struct Counting;

    impl PirAnalysis for Counting {
        type State = Count;

        fn apply(&mut self, state: &mut Count, _v: &ClosureVersion, _i: InstrId) {
            state.0 = (state.0 + 1).min(CAP);
        }
    }

    #[test]
    fn test_fixpoint_on_loop() {
        // entry -> head; head -> body -> head; head -> exit
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let entry = v.entry;
        let head = v.new_bb();
        let body = v.new_bb();
        let exit = v.new_bb();
        v.bb_mut(entry).set_next(head);
        v.push_instr(head, Instr::new(InstrKind::LdConst(PoolIdx(0))));
        v.bb_mut(head).set_branch(body, exit);
        v.bb_mut(body).set_next(head);
        v.push_instr(exit, Instr::new(InstrKind::Return(Val::MissingArg)));

        let mut driver = PirForwardDriver::new();
        driver.run(&v, entry, &mut Counting, Count(0));
        // The loop saturates instead of spinning; the exit block settles at
        // the lattice top.
        assert_eq!(driver.entry_state(exit), Some(&Count(CAP)));
    }

    #[test]
    fn test_state_before_replay() {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let entry = v.entry;
        let a = v.push_instr(entry, Instr::new(InstrKind::LdConst(PoolIdx(0))));
        let b = v.push_instr(entry, Instr::new(InstrKind::Return(a)));
        let mut driver = PirForwardDriver::new();
        driver.run(&v, entry, &mut Counting, Count(0));
        let s = driver
            .state_before(&v, &mut Counting, entry, b.instr().unwrap())
            .unwrap();
        assert_eq!(s, Count(1));
        let _ = b;
    }
}
