//! The optimizer pass pipeline.
//!
//! Passes are small and composable; each reports whether it changed
//! anything, and the pipeline reruns until quiescent (bounded). The
//! verifier runs after every pass in debug builds; a broken version is
//! dropped so the caller falls back to the baseline.

pub mod constant_fold;
pub mod dce;
pub mod safe_builtins;
pub mod scope_escape;
pub mod type_refine;

use crate::pir::{ClosureVersion, Module};
use rir_core::debug::DebugFlags;
use rir_core::pool::ConstPool;

/// One rewrite over a closure version.
pub trait Pass {
    fn name(&self) -> &'static str;

    /// Returns true if the version changed.
    fn run(&mut self, version: &mut ClosureVersion, cp: &mut ConstPool) -> bool;
}

/// The default pipeline, in application order.
fn pipeline() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(type_refine::TypeRefine),
        Box::new(constant_fold::ConstantFold),
        Box::new(safe_builtins::SafeBuiltinLift),
        Box::new(scope_escape::ScopeEscape),
        Box::new(dce::Dce::new()),
    ]
}

/// Rounds of the pipeline before giving up on reaching a fixpoint.
const MAX_ROUNDS: usize = 4;

/// Optimize every version of every closure in the module. Versions that
/// fail verification after a pass are discarded.
pub fn optimize_module(module: &mut Module, cp: &mut ConstPool, flags: DebugFlags) {
    let trace = flags.contains(DebugFlags::TRACE_PASSES)
        || rir_core::debug::flags().contains(DebugFlags::TRACE_PASSES);
    for clos_idx in 0..module.closures.len() {
        let name = module.closures[clos_idx].name.clone();
        let versions = &mut module.closures[clos_idx].versions;
        versions.retain_mut(|version| {
            let mut passes = pipeline();
            for round in 0..MAX_ROUNDS {
                let mut changed = false;
                for pass in &mut passes {
                    let effects_before = cfg!(debug_assertions).then(|| {
                        (0..version.num_instrs() as u32)
                            .map(|i| (i, version.instr(crate::pir::InstrId(i)).effects))
                            .collect::<rustc_hash::FxHashMap<_, _>>()
                    });
                    let c = pass.run(version, cp);
                    changed |= c;
                    if let Some(before) = effects_before {
                        debug_assert!(
                            crate::verify::effects_shrank(&before, version),
                            "{} grew an effect set",
                            pass.name()
                        );
                    }
                    if trace && c {
                        tracing::trace!(
                            target: "pir::opt",
                            closure = %name,
                            pass = pass.name(),
                            round,
                            "pass changed version"
                        );
                    }
                    if cfg!(debug_assertions) {
                        if let Err(e) = crate::verify::verify(version) {
                            tracing::warn!(
                                target: "pir::opt",
                                closure = %name,
                                pass = pass.name(),
                                error = %e,
                                "verification failed, dropping version"
                            );
                            return false;
                        }
                    }
                }
                if !changed {
                    break;
                }
            }
            // A final full check even in release builds: a broken version
            // must never reach the lowerer.
            match crate::verify::verify(version) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        target: "pir::opt",
                        closure = %name,
                        error = %e,
                        "verification failed, dropping version"
                    );
                    false
                }
            }
        });
    }
}
