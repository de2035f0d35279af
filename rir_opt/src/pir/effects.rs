//! Instruction effect sets.
//!
//! Effect sets are conservative upper bounds: an instruction lacking a flag
//! is guaranteed not to cause that effect, and every optimizer rewrite must
//! keep the result's effects a subset of the input's.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Effects: u16 {
        /// Changes the visibility flag.
        const VISIBILITY       = 1 << 0;
        /// May emit a warning.
        const WARN             = 1 << 1;
        /// May raise an error.
        const ERROR            = 1 << 2;
        /// May force a promise.
        const FORCE            = 1 << 3;
        /// May observe the caller reflectively.
        const REFLECTION       = 1 << 4;
        /// May capture an argument beyond the call.
        const LEAK_ARG         = 1 << 5;
        /// Pushes or pops host execution contexts.
        const CHANGES_CONTEXTS = 1 << 6;
        /// Reads from an environment.
        const READS_ENV        = 1 << 7;
        /// Writes to an environment.
        const WRITES_ENV       = 1 << 8;
        /// May make an environment reachable after the instruction.
        const LEAKS_ENV        = 1 << 9;
        /// May trigger deoptimization.
        const TRIGGER_DEOPT    = 1 << 10;
        /// May execute arbitrary code (calls, forces of impure promises).
        const EXECUTE_CODE     = 1 << 11;
    }
}

impl Effects {
    /// No observable interaction at all.
    #[inline]
    #[must_use]
    pub fn none() -> Effects {
        Effects::empty()
    }

    /// The conservative top: anything may happen.
    #[inline]
    #[must_use]
    pub fn any() -> Effects {
        Effects::all()
    }

    /// Effects of a call into unknown code.
    #[must_use]
    pub fn call() -> Effects {
        Effects::any()
    }

    #[inline]
    #[must_use]
    pub fn is_pure(self) -> bool {
        self.is_empty()
    }
}
