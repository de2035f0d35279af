//! The PIR type lattice.
//!
//! A type is the product of a host-type bitset and refinement flags. Guarantee
//! flags (scalar, not-object, not-missing, not-NA) only survive a join when
//! both sides carry them; possibility flags (maybe-promise-wrapped, lazy)
//! survive when either side carries them. The bottom element `voyd` types
//! instructions that produce no value and must never be consumed.

use bitflags::bitflags;
use rir_core::feedback::ObservedType;
use rir_core::value::RVal;
use std::fmt;

bitflags! {
    /// Host type possibilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RTypeSet: u16 {
        const NIL     = 1 << 0;
        const LGL     = 1 << 1;
        const INT     = 1 << 2;
        const REAL    = 1 << 3;
        const STR     = 1 << 4;
        const RAW     = 1 << 5;
        const CLO     = 1 << 6;
        const BUILTIN = 1 << 7;
        const SYM     = 1 << 8;
        const LANG    = 1 << 9;
        const ENV     = 1 << 10;
        const MISS    = 1 << 11;
        const OTHER   = 1 << 12;
    }
}

bitflags! {
    /// Guarantees about the value (positive flags refine).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeGuarantees: u8 {
        /// Length-1 vector without attributes.
        const SCALAR      = 1 << 0;
        /// Never a classed object.
        const NOT_OBJECT  = 1 << 1;
        /// Never the missing sentinel.
        const NOT_MISSING = 1 << 2;
        /// Never NA.
        const NOT_NA      = 1 << 3;
    }
}

bitflags! {
    /// Possibilities about the value's evaluation state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u8 {
        /// May still be wrapped in a promise.
        const MAYBE_PROMISE = 1 << 0;
        /// May be an unevaluated (lazy) computation.
        const LAZY          = 1 << 1;
    }
}

/// A lattice element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PirType {
    pub base: RTypeSet,
    pub guarantees: TypeGuarantees,
    pub flags: TypeFlags,
}

impl PirType {
    /// No value at all; the type of non-value-producing instructions.
    #[must_use]
    pub fn voyd() -> PirType {
        PirType::default()
    }

    /// Any forced value.
    #[must_use]
    pub fn val() -> PirType {
        PirType {
            base: RTypeSet::all(),
            guarantees: TypeGuarantees::empty(),
            flags: TypeFlags::empty(),
        }
    }

    /// Any value, possibly still promise-wrapped and lazy.
    #[must_use]
    pub fn any() -> PirType {
        PirType {
            base: RTypeSet::all(),
            guarantees: TypeGuarantees::empty(),
            flags: TypeFlags::MAYBE_PROMISE | TypeFlags::LAZY,
        }
    }

    #[must_use]
    pub fn simple_scalar(base: RTypeSet) -> PirType {
        PirType {
            base,
            guarantees: TypeGuarantees::SCALAR
                | TypeGuarantees::NOT_OBJECT
                | TypeGuarantees::NOT_MISSING,
            flags: TypeFlags::empty(),
        }
    }

    #[must_use]
    pub fn scalar_int() -> PirType {
        Self::simple_scalar(RTypeSet::INT)
    }

    #[must_use]
    pub fn scalar_real() -> PirType {
        Self::simple_scalar(RTypeSet::REAL)
    }

    #[must_use]
    pub fn scalar_lgl() -> PirType {
        Self::simple_scalar(RTypeSet::LGL)
    }

    #[must_use]
    pub fn env() -> PirType {
        PirType {
            base: RTypeSet::ENV,
            guarantees: TypeGuarantees::NOT_OBJECT | TypeGuarantees::NOT_MISSING,
            flags: TypeFlags::empty(),
        }
    }

    #[must_use]
    pub fn closure() -> PirType {
        PirType {
            base: RTypeSet::CLO | RTypeSet::BUILTIN,
            guarantees: TypeGuarantees::NOT_OBJECT | TypeGuarantees::NOT_MISSING,
            flags: TypeFlags::empty(),
        }
    }

    /// The static type of a constant.
    #[must_use]
    pub fn of_const(v: &RVal) -> PirType {
        let base = match v {
            RVal::Null => RTypeSet::NIL,
            RVal::Missing => RTypeSet::MISS,
            RVal::Lgl(_) => RTypeSet::LGL,
            RVal::Int(_) => RTypeSet::INT,
            RVal::Real(_) => RTypeSet::REAL,
            RVal::Str(_) => RTypeSet::STR,
            RVal::Raw(_) => RTypeSet::RAW,
            RVal::Sym(_) => RTypeSet::SYM,
            RVal::Lang(_) => RTypeSet::LANG,
            RVal::Closure(_) => RTypeSet::CLO,
            RVal::Builtin(_) => RTypeSet::BUILTIN,
            RVal::Env(_) => RTypeSet::ENV,
            RVal::Promise(_) => RTypeSet::OTHER,
        };
        let mut guarantees = TypeGuarantees::empty();
        if !matches!(v, RVal::Missing) {
            guarantees |= TypeGuarantees::NOT_MISSING;
        }
        if !v.is_object() {
            guarantees |= TypeGuarantees::NOT_OBJECT;
        }
        match v {
            RVal::Int(x) if x.is_simple_scalar() => {
                guarantees |= TypeGuarantees::SCALAR;
                if x.data[0] != rir_core::value::NA_INTEGER {
                    guarantees |= TypeGuarantees::NOT_NA;
                }
            }
            RVal::Real(x) if x.is_simple_scalar() => {
                guarantees |= TypeGuarantees::SCALAR;
                if !x.data[0].is_nan() {
                    guarantees |= TypeGuarantees::NOT_NA;
                }
            }
            RVal::Lgl(x) if x.is_simple_scalar() => {
                guarantees |= TypeGuarantees::SCALAR;
                if x.data[0] != rir_core::value::NA_LOGICAL {
                    guarantees |= TypeGuarantees::NOT_NA;
                }
            }
            _ => {}
        }
        PirType {
            base,
            guarantees,
            flags: TypeFlags::empty(),
        }
    }

    /// Narrow [`PirType::val`] by an observed-type bitset from feedback.
    #[must_use]
    pub fn of_feedback(seen: ObservedType) -> PirType {
        let mut base = RTypeSet::empty();
        if seen.contains(ObservedType::INT) {
            base |= RTypeSet::INT;
        }
        if seen.contains(ObservedType::REAL) {
            base |= RTypeSet::REAL;
        }
        if seen.contains(ObservedType::LGL) {
            base |= RTypeSet::LGL;
        }
        if seen.contains(ObservedType::STR) {
            base |= RTypeSet::STR;
        }
        if seen.contains(ObservedType::OTHER) || base.is_empty() {
            base = RTypeSet::all();
        }
        let mut guarantees = TypeGuarantees::NOT_MISSING;
        if !seen.contains(ObservedType::OBJECT) {
            guarantees |= TypeGuarantees::NOT_OBJECT;
        }
        if !seen.contains(ObservedType::NON_SCALAR) && seen.contains(ObservedType::SCALAR) {
            guarantees |= TypeGuarantees::SCALAR;
        }
        if !seen.contains(ObservedType::NA_SEEN) {
            guarantees |= TypeGuarantees::NOT_NA;
        }
        PirType {
            base,
            guarantees,
            flags: TypeFlags::empty(),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_voyd(self) -> bool {
        self.base.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn maybe_promise(self) -> bool {
        self.flags.contains(TypeFlags::MAYBE_PROMISE)
    }

    #[inline]
    #[must_use]
    pub fn maybe_object(self) -> bool {
        !self.guarantees.contains(TypeGuarantees::NOT_OBJECT)
    }

    #[inline]
    #[must_use]
    pub fn is_scalar(self) -> bool {
        self.guarantees.contains(TypeGuarantees::SCALAR)
    }

    /// The type after forcing: promise wrapping and laziness are gone.
    #[must_use]
    pub fn forced(mut self) -> PirType {
        self.flags = TypeFlags::empty();
        self
    }

    /// Subtype check: `self` is at least as precise as `other`.
    #[must_use]
    pub fn is_subtype_of(self, other: PirType) -> bool {
        other.base.contains(self.base)
            && self.guarantees.contains(other.guarantees)
            && other.flags.contains(self.flags)
    }

    /// Least upper bound.
    #[must_use]
    pub fn join(self, other: PirType) -> PirType {
        if self.is_voyd() {
            return other;
        }
        if other.is_voyd() {
            return self;
        }
        PirType {
            base: self.base | other.base,
            guarantees: self.guarantees & other.guarantees,
            flags: self.flags | other.flags,
        }
    }

    /// Greatest lower bound.
    #[must_use]
    pub fn meet(self, other: PirType) -> PirType {
        PirType {
            base: self.base & other.base,
            guarantees: self.guarantees | other.guarantees,
            flags: self.flags & other.flags,
        }
    }
}

impl fmt::Display for PirType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_voyd() {
            return write!(f, "voyd");
        }
        if self.base == RTypeSet::all() {
            write!(f, "val")?;
        } else {
            write!(f, "{:?}", self.base)?;
        }
        if self.is_scalar() {
            write!(f, "$")?;
        }
        if self.maybe_promise() {
            write!(f, "~")?;
        }
        Ok(())
    }
}
