//! Type refinement.
//!
//! Recomputes result types forward from operand types and recorded
//! feedback, then exploits the sharper types: a `Force` of a value that can
//! no longer be a promise is the identity and disappears, as does a
//! `CastType` to a type the producer already guarantees.

use crate::opt::Pass;
use crate::pir::instruction::{BinopKind, InstrKind};
use crate::pir::types::{PirType, RTypeSet};
use crate::pir::{ClosureVersion, InstrId, Val};
use rir_core::pool::ConstPool;

pub struct TypeRefine;

impl Pass for TypeRefine {
    fn name(&self) -> &'static str {
        "type refine"
    }

    fn run(&mut self, version: &mut ClosureVersion, _cp: &mut ConstPool) -> bool {
        let mut changed = false;

        // Forward type propagation over all regions, to a local fixpoint.
        let mut regions = vec![version.entry];
        regions.extend(version.promises.iter().map(|p| p.entry));
        for _ in 0..4 {
            let mut any = false;
            for &entry in &regions {
                for bb in version.rpo(entry) {
                    for idx in 0..version.bb(bb).instrs.len() {
                        let id = version.bb(bb).instrs[idx];
                        if let Some(ty) = refine_one(version, id) {
                            if ty != version.instr(id).ty {
                                version.instr_mut(id).ty = ty;
                                any = true;
                            }
                        }
                    }
                }
            }
            changed |= any;
            if !any {
                break;
            }
        }

        // Identity elimination made possible by the sharper types.
        for bb_idx in 0..version.bbs.len() {
            let bb = crate::pir::BBId(bb_idx as u32);
            let mut i = 0;
            while i < version.bb(bb).instrs.len() {
                let id = version.bb(bb).instrs[i];
                let replace = match &version.instr(id).kind {
                    InstrKind::Force { val } => {
                        (!version.type_of(*val).maybe_promise()).then_some(*val)
                    }
                    InstrKind::CastType { val, to } => version
                        .type_of(*val)
                        .is_subtype_of(*to)
                        .then_some(*val),
                    _ => None,
                };
                if let Some(v) = replace {
                    version.replace_uses(Val::Instr(id), v);
                    version.bb_mut(bb).instrs.remove(i);
                    changed = true;
                    continue;
                }
                i += 1;
            }
        }
        changed
    }
}

/// The refined result type for one instruction, if its kind supports it.
fn refine_one(version: &ClosureVersion, id: InstrId) -> Option<PirType> {
    let instr = version.instr(id);
    match &instr.kind {
        InstrKind::Phi { inputs } => {
            let ty = inputs
                .iter()
                .fold(PirType::voyd(), |t, (_, v)| t.join(version.type_of(*v)));
            Some(ty)
        }
        InstrKind::Force { val } => Some(version.type_of(*val).forced()),
        InstrKind::Binop { op, lhs, rhs, env: Val::ElidedEnv, .. } => {
            if op.is_comparison() {
                return Some(PirType::scalar_lgl());
            }
            let l = version.type_of(*lhs);
            let r = version.type_of(*rhs);
            let scalars = l.is_scalar() && r.is_scalar();
            let numeric = RTypeSet::INT | RTypeSet::REAL | RTypeSet::LGL;
            if scalars && numeric.contains(l.base | r.base) {
                // Division always produces a real; otherwise int stays int.
                let ints = RTypeSet::INT.contains(l.base) && RTypeSet::INT.contains(r.base);
                if matches!(op, BinopKind::Div | BinopKind::Pow) || !ints {
                    Some(PirType::scalar_real())
                } else {
                    Some(PirType::scalar_int())
                }
            } else if let Some(seen) = instr.feedback {
                Some(PirType::of_feedback(seen))
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pir::instruction::Instr;
    use rir_core::assumptions::OptimizationContext;
    use rir_core::pool::{PoolIdx, SrcIdx};

    #[test]
    fn test_force_of_nonpromise_removed() {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let e = v.entry;
        let mut c = Instr::new(InstrKind::LdConst(PoolIdx(0)));
        c.ty = PirType::scalar_int();
        let c = v.push_instr(e, c);
        let f = v.push_instr(e, Instr::new(InstrKind::Force { val: c }));
        v.push_instr(e, Instr::new(InstrKind::Return(f)));

        let mut cp = ConstPool::new();
        assert!(TypeRefine.run(&mut v, &mut cp));
        let kinds: Vec<_> = v.bb(e).instrs.iter().map(|i| &v.instr(*i).kind).collect();
        assert_eq!(kinds.len(), 2, "force disappeared");
        assert!(matches!(kinds[1], InstrKind::Return(x) if *x == c));
    }

    #[test]
    fn test_int_binop_result_narrows() {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let e = v.entry;
        let mut a = Instr::new(InstrKind::LdConst(PoolIdx(0)));
        a.ty = PirType::scalar_int();
        let a = v.push_instr(e, a);
        let mut b = Instr::new(InstrKind::LdConst(PoolIdx(1)));
        b.ty = PirType::scalar_int();
        let b = v.push_instr(e, b);
        let add = v.push_instr(
            e,
            Instr::new(InstrKind::Binop {
                op: BinopKind::Add,
                lhs: a,
                rhs: b,
                env: Val::ElidedEnv,
                src: SrcIdx(0),
            }),
        );
        v.push_instr(e, Instr::new(InstrKind::Return(add)));

        let mut cp = ConstPool::new();
        TypeRefine.run(&mut v, &mut cp);
        assert_eq!(v.type_of(add), PirType::scalar_int());
    }

    #[test]
    fn test_div_is_real() {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let e = v.entry;
        let mut a = Instr::new(InstrKind::LdConst(PoolIdx(0)));
        a.ty = PirType::scalar_int();
        let a = v.push_instr(e, a);
        let div = v.push_instr(
            e,
            Instr::new(InstrKind::Binop {
                op: BinopKind::Div,
                lhs: a,
                rhs: a,
                env: Val::ElidedEnv,
                src: SrcIdx(0),
            }),
        );
        v.push_instr(e, Instr::new(InstrKind::Return(div)));
        let mut cp = ConstPool::new();
        TypeRefine.run(&mut v, &mut cp);
        assert_eq!(v.type_of(div), PirType::scalar_real());
    }
}
