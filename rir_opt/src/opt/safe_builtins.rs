//! Safe-builtin lifting.
//!
//! A whitelisted builtin whose arguments are proven non-object cannot
//! dispatch into user code, so its environment dependence disappears:
//! `CallBuiltin` becomes `CallSafeBuiltin` and the effect set collapses
//! from "anything" to warn-or-error.

use crate::opt::Pass;
use crate::pir::instruction::InstrKind;
use crate::pir::ClosureVersion;
use rir_core::pool::ConstPool;

pub struct SafeBuiltinLift;

impl Pass for SafeBuiltinLift {
    fn name(&self) -> &'static str {
        "safe builtin lift"
    }

    fn run(&mut self, version: &mut ClosureVersion, _cp: &mut ConstPool) -> bool {
        let mut changed = false;
        for idx in 0..version.num_instrs() as u32 {
            let id = crate::pir::InstrId(idx);
            let lift = match &version.instr(id).kind {
                InstrKind::CallBuiltin {
                    builtin, args, ast, ..
                } if builtin.is_safe() => {
                    let all_non_object =
                        args.iter().all(|a| !version.type_of(*a).maybe_object());
                    all_non_object.then(|| (*builtin, args.clone(), *ast))
                }
                _ => None,
            };
            let Some((builtin, args, ast)) = lift else { continue };
            let instr = version.instr_mut(id);
            instr.kind = InstrKind::CallSafeBuiltin { builtin, args, ast };
            instr.effects = crate::pir::Effects::WARN | crate::pir::Effects::ERROR;
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pir::instruction::{Instr, Val};
    use crate::pir::types::PirType;
    use rir_core::assumptions::OptimizationContext;
    use rir_core::pool::PoolIdx;
    use rir_core::value::BuiltinId;
    use smallvec::smallvec;

    fn call_version(builtin: BuiltinId, arg_ty: PirType) -> (ClosureVersion, crate::pir::InstrId) {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let e = v.entry;
        let env = v.push_instr(e, Instr::new(InstrKind::LdFunEnv));
        let mut arg = Instr::new(InstrKind::LdConst(PoolIdx(0)));
        arg.ty = arg_ty;
        let arg = v.push_instr(e, arg);
        let call = v.push_instr(
            e,
            Instr::new(InstrKind::CallBuiltin {
                builtin,
                args: smallvec![arg],
                env,
                ast: PoolIdx(0),
            }),
        );
        v.push_instr(e, Instr::new(InstrKind::Return(call)));
        (v, call.instr().unwrap())
    }

    #[test]
    fn test_safe_builtin_lifted_when_non_object() {
        let (mut v, call) = call_version(BuiltinId::Length, PirType::scalar_int());
        let mut cp = ConstPool::new();
        assert!(SafeBuiltinLift.run(&mut v, &mut cp));
        assert!(matches!(
            v.instr(call).kind,
            InstrKind::CallSafeBuiltin { .. }
        ));
        assert!(!v
            .instr(call)
            .effects
            .contains(crate::pir::Effects::READS_ENV));
    }

    #[test]
    fn test_unproven_argument_blocks_lift() {
        let (mut v, call) = call_version(BuiltinId::Length, PirType::val());
        let mut cp = ConstPool::new();
        assert!(!SafeBuiltinLift.run(&mut v, &mut cp));
        assert!(matches!(v.instr(call).kind, InstrKind::CallBuiltin { .. }));
    }

    #[test]
    fn test_unsafe_builtin_never_lifted() {
        let (mut v, call) = call_version(BuiltinId::Stop, PirType::scalar_int());
        let mut cp = ConstPool::new();
        assert!(!SafeBuiltinLift.run(&mut v, &mut cp));
        assert!(matches!(v.instr(call).kind, InstrKind::CallBuiltin { .. }));
    }
}
