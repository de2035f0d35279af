//! PIR: a typed, SSA-form optimizing IR with explicit environment and
//! promise semantics, plus the bidirectional translations that connect it
//! to RIR bytecode.
//!
//! Compilation flow: [`translate::rir2pir`] symbolically executes baseline
//! RIR into PIR, the passes in [`opt`] rewrite it under the invariants
//! checked by [`verify`], and [`translate::pir2rir`] linearizes the result
//! into a specialized code object with deoptimization metadata.

pub mod analysis;
pub mod opt;
pub mod pir;
pub mod translate;
pub mod verify;

use rir_core::debug::{self, DebugFlags};
use rir_core::error::RirError;
use rir_core::function::Function;
use rir_core::pool::{ConstPool, SrcPool};
use rir_core::value::RVal;
use std::rc::Rc;

/// Optimize a front-compiled closure: translate to PIR, run the pass
/// pipeline, lower back, and install the specialized version into the
/// closure's dispatch table.
///
/// Compile aborts (unsupported bytecode, loop contexts, infinite loops)
/// are reported as `Err`; the caller keeps running the baseline.
pub fn pir_compile(
    closure: &RVal,
    name: Option<&str>,
    flags: DebugFlags,
    cp: &mut ConstPool,
    sp: &mut SrcPool,
) -> Result<Rc<Function>, RirError> {
    let RVal::Closure(cls) = closure else {
        return Err(RirError::CannotCompile("not a closure".into()));
    };
    let Some(dt) = cls.dispatch_table() else {
        return Err(RirError::CannotCompile("closure is not rir compiled".into()));
    };

    let name = name.unwrap_or("<anonymous>");
    tracing::debug!(target: "pir", closure = name, "compiling");

    let mut module = pir::module::Module::new();
    let clos_id = translate::rir2pir::compile_closure(&mut module, closure, name, cp, sp)?;

    opt::optimize_module(&mut module, cp, flags);

    let fun = translate::pir2rir::lower_closure(&module, clos_id, cp, sp)?;

    if flags.contains(DebugFlags::DRY_RUN) || debug::flags().contains(DebugFlags::DRY_RUN) {
        tracing::debug!(target: "pir", closure = name, "dry run, not installing");
        return Ok(fun);
    }
    dt.insert(Rc::clone(&fun));
    tracing::debug!(target: "pir", closure = name, ctx = %fun.context, "installed version");
    Ok(fun)
}
