//! Scope escape analysis and environment elision.
//!
//! A materialized environment that never escapes (no call receives it, no
//! promise or closure captures it, no deoptimization point needs it, no
//! superassignment walks through it) is only observable through its own
//! `LdVar`/`StVar` traffic. When every read can be resolved to the value a
//! dominating write stored, the loads collapse to those values, the stores
//! disappear, and the environment itself becomes dead.

use crate::analysis::{PirAnalysis, PirForwardDriver};
use crate::opt::Pass;
use crate::pir::instruction::{InstrKind, Val};
use crate::pir::{BBId, ClosureVersion, InstrId};
use rir_compiler::analysis::framework::AbstractState;
use rir_core::intern::Symbol;
use rir_core::pool::ConstPool;
use rustc_hash::FxHashMap;

/// One binding in the abstract frame.
#[derive(Debug, Clone, PartialEq)]
enum Bind {
    Known(Val),
    Top,
}

/// Abstract contents of the candidate environment's frame.
#[derive(Debug, Clone, Default)]
struct EnvState {
    bindings: FxHashMap<Symbol, Bind>,
}

impl AbstractState for EnvState {
    fn merge_with(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (name, theirs) in &other.bindings {
            match self.bindings.get(name) {
                None => {
                    // Bound on one path only: reads would fall through to
                    // the parent on the other, so the cell is unresolvable.
                    self.bindings.insert(name.clone(), Bind::Top);
                    changed = true;
                }
                Some(Bind::Top) => {}
                Some(Bind::Known(v)) => {
                    if !matches!(theirs, Bind::Known(w) if w == v) {
                        self.bindings.insert(name.clone(), Bind::Top);
                        changed = true;
                    }
                }
            }
        }
        let missing: Vec<Symbol> = self
            .bindings
            .keys()
            .filter(|n| !other.bindings.contains_key(*n))
            .cloned()
            .collect();
        for name in missing {
            if self.bindings.get(&name) != Some(&Bind::Top) {
                self.bindings.insert(name, Bind::Top);
                changed = true;
            }
        }
        changed
    }
}

struct FrameAnalysis {
    env: InstrId,
}

impl PirAnalysis for FrameAnalysis {
    type State = EnvState;

    fn apply(&mut self, state: &mut EnvState, version: &ClosureVersion, id: InstrId) {
        match &version.instr(id).kind {
            InstrKind::MkEnv { names, values, .. } if id == self.env => {
                for (name, value) in names.iter().zip(values) {
                    state.bindings.insert(name.clone(), Bind::Known(*value));
                }
            }
            InstrKind::StVar { name, val, env } if *env == Val::Instr(self.env) => {
                state.bindings.insert(name.clone(), Bind::Known(*val));
            }
            _ => {}
        }
    }
}

pub struct ScopeEscape;

impl Pass for ScopeEscape {
    fn name(&self) -> &'static str {
        "scope escape"
    }

    fn run(&mut self, version: &mut ClosureVersion, _cp: &mut ConstPool) -> bool {
        let candidates: Vec<InstrId> = (0..version.num_instrs() as u32)
            .map(InstrId)
            .filter(|id| matches!(version.instr(*id).kind, InstrKind::MkEnv { .. }))
            .filter(|id| placed(version, *id))
            .collect();

        let mut changed = false;
        for env in candidates {
            if escapes(version, env) {
                continue;
            }
            changed |= elide(version, env);
        }
        changed
    }
}

/// Instructions can be detached from blocks by earlier rewrites.
fn placed(version: &ClosureVersion, id: InstrId) -> bool {
    version.def_blocks().contains_key(&id)
}

/// Any use outside plain same-environment variable traffic is an escape.
fn escapes(version: &ClosureVersion, env: InstrId) -> bool {
    let env_val = Val::Instr(env);
    for idx in 0..version.num_instrs() as u32 {
        let user = InstrId(idx);
        let instr = version.instr(user);
        if !instr.inputs().contains(&env_val) {
            continue;
        }
        match &instr.kind {
            InstrKind::LdVar { env: e, .. } | InstrKind::StVar { env: e, .. }
                if *e == env_val => {}
            _ => return true,
        }
        // The stored value being the environment itself is also an escape.
        if let InstrKind::StVar { val, .. } = &instr.kind {
            if *val == env_val {
                return true;
            }
        }
    }
    false
}

/// Resolve every load from `env`; rewrite and strip on full success.
fn elide(version: &mut ClosureVersion, env: InstrId) -> bool {
    let def_blocks = version.def_blocks();
    let mut analysis = FrameAnalysis { env };
    let mut driver = PirForwardDriver::new();
    driver.run(version, version.entry, &mut analysis, EnvState::default());

    // Resolve loads.
    let mut replacements: Vec<(InstrId, Val)> = Vec::new();
    for idx in 0..version.num_instrs() as u32 {
        let id = InstrId(idx);
        let InstrKind::LdVar { name, env: e } = &version.instr(id).kind else {
            continue;
        };
        if *e != Val::Instr(env) {
            continue;
        }
        let Some(&bb) = def_blocks.get(&id) else { continue };
        let resolved = driver
            .state_before(version, &mut analysis, bb, id)
            .and_then(|s| match s.bindings.get(name) {
                Some(Bind::Known(v)) => Some(*v),
                _ => None,
            });
        match resolved {
            Some(v) => replacements.push((id, v)),
            None => return false, // one unresolved read keeps the frame
        }
    }

    // Commit: loads become their stored values, stores disappear.
    let mut dead: Vec<InstrId> = Vec::new();
    for (load, value) in replacements {
        version.replace_uses(Val::Instr(load), value);
        dead.push(load);
    }
    for idx in 0..version.num_instrs() as u32 {
        let id = InstrId(idx);
        if matches!(&version.instr(id).kind,
            InstrKind::StVar { env: e, .. } if *e == Val::Instr(env))
        {
            dead.push(id);
        }
    }
    for bb_idx in 0..version.bbs.len() {
        let bb = BBId(bb_idx as u32);
        version.bb_mut(bb).instrs.retain(|i| !dead.contains(i));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opt::dce::Dce;
    use crate::pir::instruction::Instr;
    use rir_core::assumptions::OptimizationContext;
    use rir_core::intern::sym;
    use rir_core::pool::PoolIdx;
    use smallvec::smallvec;

    /// entry: parent; a0 = ldarg; e = mkenv(x = a0); v = ldvar x; f =
    /// force v; return f
    fn identity_version() -> ClosureVersion {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let bb = v.entry;
        let parent = v.push_instr(bb, Instr::new(InstrKind::LdFunEnv));
        let a0 = v.push_instr(bb, Instr::new(InstrKind::LdArg(0)));
        let env = v.push_instr(
            bb,
            Instr::new(InstrKind::MkEnv {
                parent,
                names: vec![sym("x")],
                values: smallvec![a0],
            }),
        );
        let ld = v.push_instr(
            bb,
            Instr::new(InstrKind::LdVar {
                name: sym("x"),
                env,
            }),
        );
        let f = v.push_instr(bb, Instr::new(InstrKind::Force { val: ld }));
        v.push_instr(bb, Instr::new(InstrKind::Return(f)));
        v
    }

    #[test]
    fn test_non_escaping_env_elided() {
        let mut v = identity_version();
        let mut cp = ConstPool::new();
        assert!(ScopeEscape.run(&mut v, &mut cp));
        // After DCE the environment is gone entirely.
        Dce::new().run(&mut v, &mut cp);
        let kinds: Vec<_> = v
            .bb(v.entry)
            .instrs
            .iter()
            .map(|i| format!("{:?}", v.instr(*i).kind))
            .collect();
        assert!(
            !kinds.iter().any(|k| k.starts_with("MkEnv")),
            "environment should be gone: {kinds:?}"
        );
        assert!(
            !kinds.iter().any(|k| k.starts_with("LdVar")),
            "loads resolved: {kinds:?}"
        );
    }

    #[test]
    fn test_captured_env_kept() {
        let mut v = identity_version();
        // Add a dynamic call receiving the environment: an escape.
        let env_id = (0..v.num_instrs() as u32)
            .map(InstrId)
            .find(|i| matches!(v.instr(*i).kind, InstrKind::MkEnv { .. }))
            .unwrap();
        let bb = v.entry;
        let callee = (0..v.num_instrs() as u32)
            .map(InstrId)
            .find(|i| matches!(v.instr(*i).kind, InstrKind::LdArg(_)))
            .unwrap();
        let call = Instr::new(InstrKind::Call {
            callee: Val::Instr(callee),
            args: smallvec![],
            env: Val::Instr(env_id),
            ast: PoolIdx(0),
        });
        let pos = v.bb(bb).instrs.len() - 1;
        v.insert_instr(bb, pos, call);

        let mut cp = ConstPool::new();
        assert!(!ScopeEscape.run(&mut v, &mut cp), "escaping env stays");
    }

    #[test]
    fn test_store_then_load_resolves() {
        // e = mkenv(); stvar a <- c1; ld = ldvar a; return ld
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let bb = v.entry;
        let parent = v.push_instr(bb, Instr::new(InstrKind::LdFunEnv));
        let env = v.push_instr(
            bb,
            Instr::new(InstrKind::MkEnv {
                parent,
                names: vec![],
                values: smallvec![],
            }),
        );
        let c = v.push_instr(bb, Instr::new(InstrKind::LdConst(PoolIdx(0))));
        v.push_instr(
            bb,
            Instr::new(InstrKind::StVar {
                name: sym("a"),
                val: c,
                env,
            }),
        );
        let ld = v.push_instr(
            bb,
            Instr::new(InstrKind::LdVar {
                name: sym("a"),
                env,
            }),
        );
        v.push_instr(bb, Instr::new(InstrKind::Return(ld)));

        let mut cp = ConstPool::new();
        assert!(ScopeEscape.run(&mut v, &mut cp));
        let last = *v.bb(bb).instrs.last().unwrap();
        assert!(
            matches!(v.instr(last).kind, InstrKind::Return(x) if x == c),
            "load collapsed to the stored constant"
        );
    }
}
