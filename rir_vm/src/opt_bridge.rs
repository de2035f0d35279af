//! Bridge from the interpreter's hot-call trigger to the optimizer.
//!
//! The interpreter only knows an opaque hook; this module supplies it. The
//! optimizer runs synchronously on the interpreter's context between the
//! dispatch decision and the call, so a freshly installed version is
//! picked up by the re-dispatch that follows.

use crate::Interp;
use rir_core::debug::{self, DebugFlags};
use rir_core::intern::Symbol;
use rir_core::value::RVal;

/// Install the optimizer hook on a context.
pub fn install(interp: &mut Interp) {
    interp.optimizer = Some(optimize_closure);
}

fn optimize_closure(interp: &mut Interp, closure: &RVal, name: Option<&Symbol>) {
    let flags = debug::flags();
    let name_owned = name.map(|s| s.as_str().to_string());
    let Interp { cp, sp, .. } = interp;
    match rir_opt::pir_compile(closure, name_owned.as_deref(), flags, cp, sp) {
        Ok(fun) => {
            tracing::debug!(
                target: "pir",
                closure = name_owned.as_deref().unwrap_or("<anonymous>"),
                ctx = %fun.context,
                "optimized"
            );
        }
        Err(e) => {
            // Compile aborts fall back to the baseline silently.
            if flags.contains(DebugFlags::SHOW_WARNINGS) {
                eprintln!(
                    "Compilation of {} failed: {e}",
                    name_owned.as_deref().unwrap_or("<anonymous>")
                );
            }
            tracing::debug!(target: "pir", error = %e, "compilation aborted");
        }
    }
}
