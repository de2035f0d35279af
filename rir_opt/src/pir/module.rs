//! Module, closures, versions, promises: the PIR ownership tree.
//!
//! A `Module` owns every `PirClosure` of one compilation; each closure owns
//! its `ClosureVersion`s; a version owns its basic blocks, instructions,
//! and promise regions in flat arenas addressed by index. Teardown is one
//! bulk drop at the end of compilation.

use crate::pir::bb::{BBId, BB};
use crate::pir::instruction::{Instr, InstrId, Val};
use crate::pir::types::PirType;
use rir_core::assumptions::OptimizationContext;
use rir_core::code::Code;
use rir_core::function::Function;
use rir_core::value::RVal;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::rc::Rc;

/// Index of a closure within the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosId(pub u32);

/// Index of a promise region within one closure version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromId(pub u32);

/// A lazily computed argument: its own SSA region plus the baseline RIR
/// promise code it was translated from (needed again at lowering time).
#[derive(Debug)]
pub struct PirPromise {
    pub entry: BBId,
    pub rir_code: Rc<Code>,
}

/// One specialization of a closure, keyed by its optimization context.
#[derive(Debug)]
pub struct ClosureVersion {
    pub ctx: OptimizationContext,
    pub entry: BBId,
    instrs: Vec<Instr>,
    pub bbs: Vec<BB>,
    pub promises: Vec<PirPromise>,
}

impl ClosureVersion {
    #[must_use]
    pub fn new(ctx: OptimizationContext) -> ClosureVersion {
        let mut v = ClosureVersion {
            ctx,
            entry: BBId(0),
            instrs: Vec::new(),
            bbs: Vec::new(),
            promises: Vec::new(),
        };
        v.entry = v.new_bb();
        v
    }

    pub fn new_bb(&mut self) -> BBId {
        self.bbs.push(BB::new());
        BBId(self.bbs.len() as u32 - 1)
    }

    #[inline]
    #[must_use]
    pub fn bb(&self, id: BBId) -> &BB {
        &self.bbs[id.0 as usize]
    }

    #[inline]
    pub fn bb_mut(&mut self, id: BBId) -> &mut BB {
        &mut self.bbs[id.0 as usize]
    }

    #[inline]
    #[must_use]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.0 as usize]
    }

    #[inline]
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.0 as usize]
    }

    #[must_use]
    pub fn num_instrs(&self) -> usize {
        self.instrs.len()
    }

    /// Append an instruction to a block, returning its value.
    pub fn push_instr(&mut self, bb: BBId, instr: Instr) -> Val {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(instr);
        self.bbs[bb.0 as usize].instrs.push(id);
        Val::Instr(id)
    }

    /// Insert an instruction at a position within a block.
    pub fn insert_instr(&mut self, bb: BBId, at: usize, instr: Instr) -> Val {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(instr);
        self.bbs[bb.0 as usize].instrs.insert(at, id);
        Val::Instr(id)
    }

    /// The type of a value.
    #[must_use]
    pub fn type_of(&self, v: Val) -> PirType {
        match v {
            Val::Instr(id) => self.instr(id).ty,
            Val::ElidedEnv => PirType::env(),
            Val::MissingArg => PirType {
                base: crate::pir::types::RTypeSet::MISS,
                ..PirType::voyd()
            },
        }
    }

    /// Add a promise region; its entry block is created fresh.
    pub fn create_promise(&mut self, rir_code: Rc<Code>) -> (PromId, BBId) {
        let entry = self.new_bb();
        self.promises.push(PirPromise { entry, rir_code });
        (PromId(self.promises.len() as u32 - 1), entry)
    }

    #[must_use]
    pub fn promise(&self, id: PromId) -> &PirPromise {
        &self.promises[id.0 as usize]
    }

    /// Predecessor lists, computed from successor edges.
    #[must_use]
    pub fn predecessors(&self) -> Vec<SmallVec<[BBId; 2]>> {
        let mut preds: Vec<SmallVec<[BBId; 2]>> = vec![SmallVec::new(); self.bbs.len()];
        for (i, bb) in self.bbs.iter().enumerate() {
            for s in &bb.succs {
                preds[s.0 as usize].push(BBId(i as u32));
            }
        }
        preds
    }

    /// Reverse postorder over the blocks reachable from `entry`.
    #[must_use]
    pub fn rpo(&self, entry: BBId) -> Vec<BBId> {
        let mut order = Vec::new();
        let mut seen = vec![false; self.bbs.len()];
        // Iterative postorder.
        let mut stack: Vec<(BBId, usize)> = vec![(entry, 0)];
        seen[entry.0 as usize] = true;
        while let Some((bb, i)) = stack.pop() {
            let succs = &self.bb(bb).succs;
            if i < succs.len() {
                stack.push((bb, i + 1));
                let s = succs[i];
                if !seen[s.0 as usize] {
                    seen[s.0 as usize] = true;
                    stack.push((s, 0));
                }
            } else {
                order.push(bb);
            }
        }
        order.reverse();
        order
    }

    /// Immediate dominators for blocks reachable from `entry`
    /// (Cooper/Harvey/Kennedy iteration over reverse postorder).
    #[must_use]
    pub fn dominators(&self, entry: BBId) -> FxHashMap<BBId, BBId> {
        let rpo = self.rpo(entry);
        let rpo_index: FxHashMap<BBId, usize> =
            rpo.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let preds = self.predecessors();
        let mut idom: FxHashMap<BBId, BBId> = FxHashMap::default();
        idom.insert(entry, entry);

        let intersect = |idom: &FxHashMap<BBId, BBId>, mut a: BBId, mut b: BBId| {
            while a != b {
                while rpo_index[&a] > rpo_index[&b] {
                    a = idom[&a];
                }
                while rpo_index[&b] > rpo_index[&a] {
                    b = idom[&b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &bb in rpo.iter().skip(1) {
                let mut new_idom: Option<BBId> = None;
                for &p in &preds[bb.0 as usize] {
                    if !idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, cur, p),
                    });
                }
                if let Some(ni) = new_idom {
                    if idom.get(&bb) != Some(&ni) {
                        idom.insert(bb, ni);
                        changed = true;
                    }
                }
            }
        }
        idom
    }

    /// Does `a` dominate `b`? Both must be reachable from the entry the
    /// dominator map was computed for.
    #[must_use]
    pub fn dominates(idom: &FxHashMap<BBId, BBId>, a: BBId, b: BBId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            let Some(&parent) = idom.get(&cur) else {
                return false;
            };
            if parent == cur {
                return false;
            }
            cur = parent;
        }
    }

    /// All uses of each instruction, as (user, input position) pairs.
    #[must_use]
    pub fn uses(&self) -> FxHashMap<InstrId, Vec<InstrId>> {
        let mut uses: FxHashMap<InstrId, Vec<InstrId>> = FxHashMap::default();
        for (i, instr) in self.instrs.iter().enumerate() {
            for input in instr.inputs() {
                if let Val::Instr(def) = input {
                    uses.entry(def).or_default().push(InstrId(i as u32));
                }
            }
        }
        uses
    }

    /// Replace every use of `from` with `to`.
    pub fn replace_uses(&mut self, from: Val, to: Val) {
        for instr in &mut self.instrs {
            instr.map_inputs(|v| if v == from { to } else { v });
        }
    }

    /// The block that defines each instruction.
    #[must_use]
    pub fn def_blocks(&self) -> FxHashMap<InstrId, BBId> {
        let mut map = FxHashMap::default();
        for (i, bb) in self.bbs.iter().enumerate() {
            for id in &bb.instrs {
                map.insert(*id, BBId(i as u32));
            }
        }
        map
    }
}

/// The logical identity of one surface closure under compilation.
#[derive(Debug)]
pub struct PirClosure {
    pub name: String,
    /// The host closure value (used for `Identical` guards and recursion
    /// detection).
    pub closure: RVal,
    /// The baseline function whose RIR is being translated.
    pub baseline: Rc<Function>,
    pub versions: Vec<ClosureVersion>,
    /// Translation of this closure is on the stack right now; a lookup hit
    /// with no versions then means recursion, not failure.
    pub in_progress: bool,
}

impl PirClosure {
    /// The strongest version whose context is implied by `ctx`.
    #[must_use]
    pub fn find_compatible_version(&self, ctx: &OptimizationContext) -> Option<&ClosureVersion> {
        self.versions
            .iter()
            .filter(|v| v.ctx.subsumed_by(ctx))
            .max_by(|a, b| {
                if a.ctx.strictly_stronger_than(&b.ctx) {
                    std::cmp::Ordering::Greater
                } else if b.ctx.strictly_stronger_than(&a.ctx) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
    }
}

/// Root of one compilation: owns all closures and unifies static
/// environment references.
#[derive(Debug, Default)]
pub struct Module {
    pub closures: Vec<PirClosure>,
    /// Host closure address to PirClosure, for recursion detection.
    by_addr: FxHashMap<usize, ClosId>,
}

impl Module {
    #[must_use]
    pub fn new() -> Module {
        Module::default()
    }

    #[must_use]
    pub fn closure(&self, id: ClosId) -> &PirClosure {
        &self.closures[id.0 as usize]
    }

    pub fn closure_mut(&mut self, id: ClosId) -> &mut PirClosure {
        &mut self.closures[id.0 as usize]
    }

    /// The module-level entry for a host closure, if declared.
    #[must_use]
    pub fn lookup(&self, closure: &RVal) -> Option<ClosId> {
        let RVal::Closure(c) = closure else { return None };
        self.by_addr.get(&(Rc::as_ptr(c) as usize)).copied()
    }

    /// Declare a closure, returning its id. The caller fills in versions.
    pub fn declare(&mut self, name: &str, closure: RVal, baseline: Rc<Function>) -> ClosId {
        let id = ClosId(self.closures.len() as u32);
        if let RVal::Closure(c) = &closure {
            self.by_addr.insert(Rc::as_ptr(c) as usize, id);
        }
        self.closures.push(PirClosure {
            name: name.to_string(),
            closure,
            baseline,
            versions: Vec::new(),
            in_progress: false,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pir::instruction::InstrKind;

    #[test]
    fn test_rpo_diamond() {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let entry = v.entry;
        let t = v.new_bb();
        let f = v.new_bb();
        let join = v.new_bb();
        v.bb_mut(entry).set_branch(t, f);
        v.bb_mut(t).set_next(join);
        v.bb_mut(f).set_next(join);
        let order = v.rpo(entry);
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], entry);
        assert_eq!(*order.last().unwrap(), join);
    }

    #[test]
    fn test_dominators_diamond() {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let entry = v.entry;
        let t = v.new_bb();
        let f = v.new_bb();
        let join = v.new_bb();
        v.bb_mut(entry).set_branch(t, f);
        v.bb_mut(t).set_next(join);
        v.bb_mut(f).set_next(join);
        let idom = v.dominators(entry);
        assert_eq!(idom[&join], entry, "neither branch arm dominates the join");
        assert!(ClosureVersion::dominates(&idom, entry, join));
        assert!(!ClosureVersion::dominates(&idom, t, join));
    }

    #[test]
    fn test_uses_and_replace() {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let entry = v.entry;
        let a = v.push_instr(entry, Instr::new(InstrKind::LdArg(0)));
        let b = v.push_instr(entry, Instr::new(InstrKind::Force { val: a }));
        let uses = v.uses();
        assert_eq!(uses[&a.instr().unwrap()].len(), 1);
        let c = v.push_instr(entry, Instr::new(InstrKind::LdArg(1)));
        v.replace_uses(a, c);
        let Val::Instr(bid) = b else { panic!() };
        assert_eq!(v.instr(bid).inputs()[0], c);
    }

    #[test]
    fn test_find_compatible_version() {
        let ctx1 = OptimizationContext::exact_args(1);
        let base = OptimizationContext::base();
        let code = rir_core::code::Code::new(
            vec![0],
            rir_core::pool::SrcIdx(0),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            1,
            0,
        );
        let fun = Function::new(
            code,
            Vec::new(),
            rir_core::function::FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            base.clone(),
        );
        let pc = PirClosure {
            name: "f".into(),
            closure: RVal::Null,
            baseline: fun,
            versions: vec![ClosureVersion::new(base), ClosureVersion::new(ctx1.clone())],
            in_progress: false,
        };
        let found = pc.find_compatible_version(&ctx1).unwrap();
        assert_eq!(found.ctx, ctx1);
        let weak = pc
            .find_compatible_version(&OptimizationContext::base())
            .unwrap();
        assert!(weak.ctx.is_base());
    }
}
