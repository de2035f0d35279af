//! Inline runtime feedback.
//!
//! The interpreter records observed callee identities and operand types into
//! slots owned by the executing code object; the optimizer reads them
//! between invocations. Recording is strictly monotone: target sets and
//! observation bitsets only grow while a version executes.
//!
//! The engine is single-threaded, so plain `Cell`/`RefCell` interior
//! mutability is sufficient (single-writer invariant).

use crate::value::RVal;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};

bitflags! {
    /// Observed-type bitset for one monitored operand position.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObservedType: u16 {
        const INT        = 1 << 0;
        const REAL       = 1 << 1;
        const LGL        = 1 << 2;
        const STR        = 1 << 3;
        const OTHER      = 1 << 4;
        /// A simple scalar was seen.
        const SCALAR     = 1 << 5;
        /// A non-scalar (vector or attributed) was seen.
        const NON_SCALAR = 1 << 6;
        /// A classed object was seen.
        const OBJECT     = 1 << 7;
        /// An NA element was seen in a scalar operand.
        const NA_SEEN    = 1 << 8;
        /// A value with attributes was seen.
        const ATTRIBS    = 1 << 9;
    }
}

impl ObservedType {
    /// Classify one runtime value.
    #[must_use]
    pub fn of(v: &RVal) -> ObservedType {
        let mut t = ObservedType::empty();
        match v {
            RVal::Int(x) => {
                t |= ObservedType::INT;
                if x.is_simple_scalar() {
                    t |= ObservedType::SCALAR;
                    if x.data[0] == crate::value::NA_INTEGER {
                        t |= ObservedType::NA_SEEN;
                    }
                } else {
                    t |= ObservedType::NON_SCALAR;
                }
            }
            RVal::Real(x) => {
                t |= ObservedType::REAL;
                if x.is_simple_scalar() {
                    t |= ObservedType::SCALAR;
                    if x.data[0].is_nan() {
                        t |= ObservedType::NA_SEEN;
                    }
                } else {
                    t |= ObservedType::NON_SCALAR;
                }
            }
            RVal::Lgl(x) => {
                t |= ObservedType::LGL;
                if x.is_simple_scalar() {
                    t |= ObservedType::SCALAR;
                    if x.data[0] == crate::value::NA_LOGICAL {
                        t |= ObservedType::NA_SEEN;
                    }
                } else {
                    t |= ObservedType::NON_SCALAR;
                }
            }
            RVal::Str(x) => {
                t |= ObservedType::STR;
                if x.is_simple_scalar() {
                    t |= ObservedType::SCALAR;
                } else {
                    t |= ObservedType::NON_SCALAR;
                }
            }
            _ => t |= ObservedType::OTHER,
        }
        if v.is_object() {
            t |= ObservedType::OBJECT;
        }
        if v.has_attribs() {
            t |= ObservedType::ATTRIBS;
        }
        t
    }
}

/// Type observations for one operand position.
#[derive(Debug, Default)]
pub struct TypeFeedback {
    flags: Cell<ObservedType>,
    count: Cell<u32>,
}

impl TypeFeedback {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flags: Cell::new(ObservedType::empty()),
            count: Cell::new(0),
        }
    }

    /// Fold one observation into the bitset. Bits only accumulate.
    pub fn record(&self, v: &RVal) {
        self.flags.set(self.flags.get() | ObservedType::of(v));
        self.count.set(self.count.get().saturating_add(1));
    }

    #[inline]
    #[must_use]
    pub fn observed(&self) -> ObservedType {
        self.flags.get()
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.get()
    }

    /// Any observation recorded at all.
    #[inline]
    #[must_use]
    pub fn seen_any(&self) -> bool {
        self.count.get() > 0
    }

    /// A classed object was observed at this position.
    #[inline]
    #[must_use]
    pub fn observed_object(&self) -> bool {
        self.flags.get().contains(ObservedType::OBJECT)
    }
}

/// Maximum number of distinct callees retained per call site.
pub const MAX_CALL_TARGETS: usize = 3;

/// Observed callee identities at one call site.
#[derive(Debug, Default)]
pub struct CallFeedback {
    targets: RefCell<SmallVec<[RVal; MAX_CALL_TARGETS]>>,
    overflow: Cell<bool>,
}

impl CallFeedback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one callee. The target set only grows; past capacity the
    /// overflow flag is raised instead.
    pub fn record(&self, callee: &RVal) {
        let mut targets = self.targets.borrow_mut();
        if targets.iter().any(|t| t.identical(callee)) {
            return;
        }
        if targets.len() >= MAX_CALL_TARGETS {
            self.overflow.set(true);
            return;
        }
        targets.push(callee.clone());
    }

    #[must_use]
    pub fn targets(&self) -> SmallVec<[RVal; MAX_CALL_TARGETS]> {
        self.targets.borrow().clone()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.borrow().len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.borrow().is_empty()
    }

    #[inline]
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflow.get()
    }

    /// The unique observed callee, if the site is monomorphic.
    #[must_use]
    pub fn monomorphic_target(&self) -> Option<RVal> {
        let targets = self.targets.borrow();
        if targets.len() == 1 && !self.overflow.get() {
            Some(targets[0].clone())
        } else {
            None
        }
    }
}

/// One feedback slot embedded in the instruction stream.
#[derive(Debug)]
pub enum FeedbackSlot {
    Call(CallFeedback),
    /// Operand observations for a binary operator: [lhs, rhs].
    Binop([TypeFeedback; 2]),
}

impl FeedbackSlot {
    #[must_use]
    pub fn call(&self) -> &CallFeedback {
        match self {
            FeedbackSlot::Call(f) => f,
            FeedbackSlot::Binop(_) => panic!("feedback slot holds binop observations"),
        }
    }

    #[must_use]
    pub fn binop(&self) -> &[TypeFeedback; 2] {
        match self {
            FeedbackSlot::Binop(f) => f,
            FeedbackSlot::Call(_) => panic!("feedback slot holds call targets"),
        }
    }
}
