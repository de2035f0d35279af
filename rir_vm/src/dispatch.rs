//! Runtime version selection.
//!
//! For each call the interpreter infers the assumptions the call site can
//! guarantee, then scans the dispatch table strongest-first for a viable
//! version. The baseline is always viable; hitting it twice triggers the
//! optimizer through the bridge hook.

use crate::call::{CallArgs, CallContext};
use rir_core::assumptions::{ArgAssume, Assumptions, OptimizationContext};
use rir_core::value::RVal;

/// Assumptions the caller can guarantee for this particular call.
#[must_use]
pub fn infer_assumptions(call: &CallContext) -> OptimizationContext {
    let n = call.nargs() as u8;
    let mut ctx = OptimizationContext {
        // This engine has no reflective builtins that can observe the
        // caller's frame.
        flags: Assumptions::NO_REFLECTION,
        min_args: n,
        max_args: n,
        arg_types: smallvec::SmallVec::new(),
    };
    if call.names.is_none() {
        ctx.flags |= Assumptions::CORRECT_ORDER;
    }
    match &call.args {
        CallArgs::Implicit { codes, .. } => {
            if codes
                .iter()
                .all(|&c| c != rir_compiler::bytecode::MISSING_ARG_IDX)
            {
                ctx.flags |= Assumptions::NO_EXPLICIT_MISSING;
            }
        }
        CallArgs::Stack(values) => {
            ctx.flags |= Assumptions::NO_EXPLICIT_MISSING;
            if values.iter().all(|v| !matches!(v, RVal::Promise(_))) {
                ctx.flags |= Assumptions::EAGER_ARGS;
            }
            for (i, v) in values.iter().enumerate() {
                let mut a = ArgAssume::empty();
                if !matches!(v, RVal::Promise(_)) {
                    a |= ArgAssume::EAGER;
                }
                if !v.is_object() {
                    a |= ArgAssume::NOT_OBJECT;
                }
                if v.as_int_scalar().is_some() {
                    a |= ArgAssume::SCALAR_INT;
                }
                if v.as_real_scalar().is_some() {
                    a |= ArgAssume::SCALAR_REAL;
                }
                if v.as_lgl_scalar().is_some() {
                    a |= ArgAssume::SCALAR_LGL;
                }
                ctx = ctx.with_arg(i, a);
                if matches!(v, RVal::Missing) {
                    ctx.flags -= Assumptions::NO_EXPLICIT_MISSING;
                }
            }
        }
    }
    ctx
}
