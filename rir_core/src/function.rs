//! Functions and dispatch tables.
//!
//! A `Function` is one compiled version of a surface closure: its body code,
//! per-formal default-argument codes, signature metadata, invocation
//! counter, and the optimization context it was compiled under. Functions
//! are value-like; a `DispatchTable` holds several simultaneously, ordered
//! by strictness of their contexts. Slot 0 is always the baseline (no
//! assumptions).

use crate::assumptions::OptimizationContext;
use crate::code::Code;
use crate::intern::Symbol;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Signature metadata for argument matching and dispatch.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub formals: Vec<Symbol>,
    pub has_defaults: bool,
}

impl FunctionSignature {
    #[must_use]
    pub fn nargs(&self) -> usize {
        self.formals.len()
    }
}

/// One compiled version of a closure.
#[derive(Debug)]
pub struct Function {
    pub body: Rc<Code>,
    /// Default-argument codes, indexed by formal position.
    pub defaults: Vec<Option<Rc<Code>>>,
    pub signature: FunctionSignature,
    /// The context this version was specialized for; base for slot 0.
    pub context: OptimizationContext,
    invocation_count: Cell<u32>,
    /// Force optimization at the next dispatch, regardless of the counter.
    pub mark_opt: Cell<bool>,
    /// Set when this version has been invalidated by deoptimization.
    pub deopt: Cell<bool>,
    /// For specialized versions: the baseline root code that deopt frame
    /// references resolve against. None on the baseline itself.
    baseline_code: RefCell<Option<Rc<Code>>>,
}

impl Function {
    /// Build a function and wire the owner back links of its code tree.
    #[must_use]
    pub fn new(
        body: Rc<Code>,
        defaults: Vec<Option<Rc<Code>>>,
        signature: FunctionSignature,
        context: OptimizationContext,
    ) -> Rc<Function> {
        let fun = Rc::new(Function {
            body,
            defaults,
            signature,
            context,
            invocation_count: Cell::new(0),
            mark_opt: Cell::new(false),
            deopt: Cell::new(false),
            baseline_code: RefCell::new(None),
        });
        fun.body.set_owner(&fun);
        for d in fun.defaults.iter().flatten() {
            d.set_owner(&fun);
        }
        fun
    }

    /// Anchor this specialized version's deopt references to a baseline.
    pub fn set_baseline_code(&self, code: Rc<Code>) {
        *self.baseline_code.borrow_mut() = Some(code);
    }

    /// The baseline root code this version deoptimizes into, if any.
    #[must_use]
    pub fn baseline_code(&self) -> Option<Rc<Code>> {
        self.baseline_code.borrow().clone()
    }

    #[inline]
    pub fn register_invocation(&self) {
        self.invocation_count
            .set(self.invocation_count.get().saturating_add(1));
    }

    #[inline]
    #[must_use]
    pub fn invocation_count(&self) -> u32 {
        self.invocation_count.get()
    }
}

/// Number of invocations of a baseline function that triggers the
/// optimizer.
pub const OPTIMIZE_THRESHOLD: u32 = 2;

/// An ordered vector of function versions for one closure.
///
/// Invariants: slot 0 is always populated and carries the base context; for
/// any two populated slots `i < j`, the context at `j` is strictly stronger
/// than the context at `i`. Installing a version whose context is
/// incomparable with a resident one replaces it, so the table never holds
/// two unordered contexts.
#[derive(Debug)]
pub struct DispatchTable {
    capacity: usize,
    slots: RefCell<Vec<Rc<Function>>>,
}

impl DispatchTable {
    /// Default slot count: baseline plus one specialization.
    pub const DEFAULT_CAPACITY: usize = 2;

    #[must_use]
    pub fn new(baseline: Rc<Function>) -> Rc<DispatchTable> {
        Self::with_capacity(baseline, Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(baseline: Rc<Function>, capacity: usize) -> Rc<DispatchTable> {
        assert!(capacity >= 1);
        assert!(
            baseline.context.is_base(),
            "slot 0 must carry the base context"
        );
        Rc::new(DispatchTable {
            capacity,
            slots: RefCell::new(vec![baseline]),
        })
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn baseline(&self) -> Rc<Function> {
        Rc::clone(&self.slots.borrow()[0])
    }

    #[must_use]
    pub fn slot(&self, i: usize) -> Option<Rc<Function>> {
        self.slots.borrow().get(i).cloned()
    }

    /// Install a specialized version, maintaining the ordering invariant.
    ///
    /// Any resident specialization whose context equals or is incomparable
    /// with the new one is replaced. If the table is still full, the oldest
    /// specialization is evicted.
    pub fn insert(&self, fun: Rc<Function>) {
        assert!(
            fun.context
                .strictly_stronger_than(&self.baseline().context),
            "specializations must strictly refine the baseline"
        );
        let mut slots = self.slots.borrow_mut();
        slots.retain(|f| {
            f.context.is_base()
                || (f.context.comparable(&fun.context) && f.context != fun.context)
        });
        if slots.len() >= self.capacity {
            // Oldest specialization sits just above the baseline.
            slots.remove(1);
        }
        let pos = slots
            .iter()
            .position(|f| f.context.strictly_stronger_than(&fun.context))
            .unwrap_or(slots.len());
        slots.insert(pos, fun);
    }

    /// Select the strongest version viable under `ctx`. Baseline is always
    /// viable, so this cannot fail.
    #[must_use]
    pub fn dispatch(&self, ctx: &OptimizationContext) -> (usize, Rc<Function>) {
        let slots = self.slots.borrow();
        for (i, f) in slots.iter().enumerate().rev() {
            if f.context.subsumed_by(ctx) && !f.deopt.get() {
                return (i, Rc::clone(f));
            }
        }
        (0, Rc::clone(&slots[0]))
    }

    /// Invocation counts per slot, zero for empty slots.
    #[must_use]
    pub fn invocation_counts(&self) -> Vec<u32> {
        let slots = self.slots.borrow();
        (0..self.capacity)
            .map(|i| slots.get(i).map_or(0, |f| f.invocation_count()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assumptions::ArgAssume;
    use crate::pool::SrcIdx;

    fn dummy_fun(ctx: OptimizationContext) -> Rc<Function> {
        let code = Code::new(vec![0], SrcIdx(0), Vec::new(), Vec::new(), Vec::new(), 1, 0);
        Function::new(
            code,
            Vec::new(),
            FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            ctx,
        )
    }

    #[test]
    fn test_baseline_always_viable() {
        let dt = DispatchTable::new(dummy_fun(OptimizationContext::base()));
        let (slot, _) = dt.dispatch(&OptimizationContext::base());
        assert_eq!(slot, 0);
    }

    #[test]
    fn test_dispatch_prefers_strongest_viable() {
        let dt = DispatchTable::new(dummy_fun(OptimizationContext::base()));
        dt.insert(dummy_fun(OptimizationContext::exact_args(1)));

        let (slot, _) = dt.dispatch(&OptimizationContext::exact_args(1));
        assert_eq!(slot, 1);

        // A weaker call site falls back to the baseline.
        let (slot, _) = dt.dispatch(&OptimizationContext::base());
        assert_eq!(slot, 0);
    }

    #[test]
    fn test_insert_keeps_strict_ordering() {
        let dt = DispatchTable::with_capacity(dummy_fun(OptimizationContext::base()), 3);
        let weak = OptimizationContext::exact_args(1);
        let strong = OptimizationContext::exact_args(1).with_arg(0, ArgAssume::SCALAR_INT);
        dt.insert(dummy_fun(strong.clone()));
        dt.insert(dummy_fun(weak.clone()));
        assert_eq!(dt.len(), 3);
        assert_eq!(dt.slot(1).unwrap().context, weak);
        assert_eq!(dt.slot(2).unwrap().context, strong);
    }

    #[test]
    fn test_incomparable_install_replaces() {
        let dt = DispatchTable::with_capacity(dummy_fun(OptimizationContext::base()), 3);
        let a = OptimizationContext::base().with_arg(0, ArgAssume::SCALAR_INT);
        let b = OptimizationContext::base().with_arg(0, ArgAssume::SCALAR_REAL);
        dt.insert(dummy_fun(a));
        dt.insert(dummy_fun(b.clone()));
        assert_eq!(dt.len(), 2, "unordered contexts never coexist");
        assert_eq!(dt.slot(1).unwrap().context, b);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let dt = DispatchTable::new(dummy_fun(OptimizationContext::base()));
        let weak = OptimizationContext::exact_args(2);
        let strong = OptimizationContext::exact_args(2).with_arg(0, ArgAssume::NOT_OBJECT);
        dt.insert(dummy_fun(weak));
        dt.insert(dummy_fun(strong.clone()));
        assert_eq!(dt.len(), 2);
        assert_eq!(dt.slot(1).unwrap().context, strong);
    }

    #[test]
    fn test_invocation_counts_shape() {
        let dt = DispatchTable::new(dummy_fun(OptimizationContext::base()));
        dt.baseline().register_invocation();
        assert_eq!(dt.invocation_counts(), vec![1, 0]);
    }
}
