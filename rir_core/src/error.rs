//! Shared error taxonomy and the non-local-exit channel.
//!
//! The core never invents new user-visible errors: everything either comes
//! from the host shim (and is propagated transparently) or is recovered by
//! falling back to a less specialized execution path. Non-local exits
//! (errors, `break`, `next`) travel as the `Err` arm of interpreter results
//! so that every scoped acquisition releases on all paths.

use crate::intern::Symbol;
use crate::value::RVal;
use thiserror::Error;

/// Errors raised through the host's error mechanism.
#[derive(Debug, Clone, Error)]
pub enum RirError {
    #[error("object '{0}' not found")]
    UnboundVariable(Symbol),

    #[error("could not find function \"{0}\"")]
    UnboundFunction(Symbol),

    #[error("attempt to apply non-function")]
    NotAFunction,

    #[error("argument \"{0}\" is missing, with no default")]
    MissingArgument(Symbol),

    #[error("argument is of length zero or not interpretable as logical")]
    BadCondition,

    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),

    #[error("promise already under evaluation")]
    PromiseCycle,

    #[error("invalid deoptimization metadata")]
    BadDeoptMetadata,

    #[error("cannot compile: {0}")]
    CannotCompile(String),

    #[error("{0}")]
    Host(String),
}

/// A non-local exit in flight.
///
/// `break` and `next` unwind to the nearest loop context; errors unwind all
/// the way to the host entry point. Scoped contexts observe the unwind via
/// ordinary `?` propagation and release in reverse order.
#[derive(Debug, Clone)]
pub enum Unwind {
    Error(RirError),
    LoopBreak,
    LoopNext,
}

impl From<RirError> for Unwind {
    fn from(e: RirError) -> Self {
        Unwind::Error(e)
    }
}

impl Unwind {
    /// The error payload, if this is an error unwind.
    #[must_use]
    pub fn into_error(self) -> Option<RirError> {
        match self {
            Unwind::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// A collected warning, in host emission order.
#[derive(Debug, Clone)]
pub struct Warning {
    pub message: String,
    /// The call syntax the warning is attributed to, when known.
    pub call: Option<RVal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::sym;

    #[test]
    fn test_error_messages() {
        let e = RirError::UnboundVariable(sym("x"));
        assert_eq!(e.to_string(), "object 'x' not found");
        let e = RirError::Host("boom".to_string());
        assert_eq!(e.to_string(), "boom");
    }

    #[test]
    fn test_unwind_from_error() {
        let u: Unwind = RirError::NotAFunction.into();
        assert!(matches!(u, Unwind::Error(RirError::NotAFunction)));
    }
}
