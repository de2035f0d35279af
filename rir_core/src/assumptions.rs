//! Call-site assumptions and the optimization-context lattice.
//!
//! A specialized function version is compiled under a set of predicates the
//! caller must guarantee. Contexts form a partial order: `a <= b` iff `b`'s
//! predicates imply `a`'s, so a call site whose inferred context is at least
//! as strong as a version's stored context may dispatch to that version.

use bitflags::bitflags;
use smallvec::SmallVec;
use std::fmt;

bitflags! {
    /// Call-shape predicates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Assumptions: u8 {
        /// Arguments are passed in declared order (no named matching).
        const CORRECT_ORDER       = 1 << 0;
        /// No explicitly missing argument in the call.
        const NO_EXPLICIT_MISSING = 1 << 1;
        /// No argument can observe the caller reflectively.
        const NO_REFLECTION       = 1 << 2;
        /// All arguments are already evaluated (no lazy promises).
        const EAGER_ARGS          = 1 << 3;
    }
}

bitflags! {
    /// Per-argument-position observed-type predicates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArgAssume: u8 {
        const SCALAR_INT  = 1 << 0;
        const SCALAR_REAL = 1 << 1;
        const SCALAR_LGL  = 1 << 2;
        const NOT_OBJECT  = 1 << 3;
        const EAGER       = 1 << 4;
    }
}

/// The context a function version was specialized for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationContext {
    pub flags: Assumptions,
    /// At least this many arguments are supplied.
    pub min_args: u8,
    /// At most this many arguments are supplied.
    pub max_args: u8,
    /// Per-position predicates; positions past the end carry none.
    pub arg_types: SmallVec<[ArgAssume; 4]>,
}

impl Default for OptimizationContext {
    fn default() -> Self {
        Self::base()
    }
}

impl OptimizationContext {
    /// The baseline context: no predicates at all.
    #[must_use]
    pub fn base() -> Self {
        Self {
            flags: Assumptions::empty(),
            min_args: 0,
            max_args: u8::MAX,
            arg_types: SmallVec::new(),
        }
    }

    /// A context promising exactly `n` in-order, non-missing arguments.
    #[must_use]
    pub fn exact_args(n: u8) -> Self {
        Self {
            flags: Assumptions::CORRECT_ORDER | Assumptions::NO_EXPLICIT_MISSING,
            min_args: n,
            max_args: n,
            arg_types: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Assumptions) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn with_arg(mut self, pos: usize, assume: ArgAssume) -> Self {
        if self.arg_types.len() <= pos {
            self.arg_types.resize(pos + 1, ArgAssume::empty());
        }
        self.arg_types[pos] |= assume;
        self
    }

    /// The predicates at argument position `pos`.
    #[must_use]
    pub fn arg(&self, pos: usize) -> ArgAssume {
        self.arg_types
            .get(pos)
            .copied()
            .unwrap_or_else(ArgAssume::empty)
    }

    #[must_use]
    pub fn is_base(&self) -> bool {
        *self == Self::base()
    }

    /// `self <= other`: everything `self` promises is implied by `other`.
    #[must_use]
    pub fn subsumed_by(&self, other: &OptimizationContext) -> bool {
        if !other.flags.contains(self.flags) {
            return false;
        }
        if other.min_args < self.min_args || other.max_args > self.max_args {
            return false;
        }
        let n = self.arg_types.len().max(other.arg_types.len());
        (0..n).all(|i| other.arg(i).contains(self.arg(i)))
    }

    /// `self` is strictly stronger than `other` (`other < self`).
    #[must_use]
    pub fn strictly_stronger_than(&self, other: &OptimizationContext) -> bool {
        other.subsumed_by(self) && self != other
    }

    /// Ordered at all, in either direction.
    #[must_use]
    pub fn comparable(&self, other: &OptimizationContext) -> bool {
        self.subsumed_by(other) || other.subsumed_by(self)
    }
}

impl fmt::Display for OptimizationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{{{:?}", self.flags)?;
        if self.min_args > 0 || self.max_args < u8::MAX {
            write!(f, ", args {}..={}", self.min_args, self.max_args)?;
        }
        for (i, a) in self.arg_types.iter().enumerate() {
            if !a.is_empty() {
                write!(f, ", a{i}={a:?}")?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_is_bottom() {
        let base = OptimizationContext::base();
        let strong = OptimizationContext::exact_args(2);
        assert!(base.subsumed_by(&strong));
        assert!(!strong.subsumed_by(&base));
        assert!(strong.strictly_stronger_than(&base));
    }

    #[test]
    fn test_reflexive() {
        let ctx = OptimizationContext::exact_args(1);
        assert!(ctx.subsumed_by(&ctx));
        assert!(!ctx.strictly_stronger_than(&ctx));
    }

    #[test]
    fn test_arg_type_refines() {
        let weak = OptimizationContext::exact_args(1);
        let strong = OptimizationContext::exact_args(1).with_arg(0, ArgAssume::SCALAR_INT);
        assert!(weak.subsumed_by(&strong));
        assert!(!strong.subsumed_by(&weak));
    }

    #[test]
    fn test_incomparable() {
        let a = OptimizationContext::base().with_arg(0, ArgAssume::SCALAR_INT);
        let b = OptimizationContext::base().with_arg(0, ArgAssume::SCALAR_REAL);
        assert!(!a.comparable(&b));
    }

    #[test]
    fn test_arg_count_bounds() {
        let at_most_2 = OptimizationContext {
            max_args: 2,
            ..OptimizationContext::base()
        };
        let exactly_2 = OptimizationContext::exact_args(2);
        assert!(at_most_2.subsumed_by(&exactly_2));
        assert!(!exactly_2.subsumed_by(&at_most_2));
    }
}
