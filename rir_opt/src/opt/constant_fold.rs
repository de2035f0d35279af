//! Constant propagation on the flat lattice {bottom, constant, top}.
//!
//! Flow-insensitive over SSA values, iterated to a fixpoint so constants
//! flow through phis. Folding is deliberately conservative: an operation is
//! only folded when the runtime fast path could neither warn nor error on
//! the same operands (integer overflow stays in the code so the one-shot
//! warning survives).

use crate::opt::Pass;
use crate::pir::instruction::{BinopKind, InstrKind};
use crate::pir::types::PirType;
use crate::pir::{ClosureVersion, InstrId, Val};
use rir_core::pool::ConstPool;
use rir_core::value::{RVal, NA_INTEGER, NA_LOGICAL};
use rustc_hash::FxHashMap;

/// The flat lattice.
#[derive(Debug, Clone)]
enum Flat {
    Const(RVal),
    Top,
}

pub struct ConstantFold;

impl Pass for ConstantFold {
    fn name(&self) -> &'static str {
        "constant fold"
    }

    fn run(&mut self, version: &mut ClosureVersion, cp: &mut ConstPool) -> bool {
        // Fixpoint: unknown values are implicit bottom, so revisiting can
        // only move values bottom -> const -> top.
        let mut lattice: FxHashMap<InstrId, Flat> = FxHashMap::default();
        let mut changed = true;
        while changed {
            changed = false;
            for idx in 0..version.num_instrs() as u32 {
                let id = InstrId(idx);
                let new = evaluate(version, cp, &lattice, id);
                if let Some(new) = new {
                    let update = match lattice.get(&id) {
                        None => true,
                        Some(Flat::Top) => false,
                        Some(Flat::Const(c)) => !matches!(&new, Flat::Const(n) if c.identical(n)),
                    };
                    if update {
                        // Once top, always top.
                        let v = if matches!(lattice.get(&id), Some(Flat::Const(_))) {
                            Flat::Top
                        } else {
                            new
                        };
                        lattice.insert(id, v);
                        changed = true;
                    }
                }
            }
        }

        // Rewrite foldable instructions into constants.
        let mut rewrote = false;
        for bb_idx in 0..version.bbs.len() {
            let bb = crate::pir::BBId(bb_idx as u32);
            for idx in 0..version.bb(bb).instrs.len() {
                let id = version.bb(bb).instrs[idx];
                if matches!(
                    version.instr(id).kind,
                    InstrKind::LdConst(_) | InstrKind::Phi { .. }
                ) {
                    continue;
                }
                let Some(Flat::Const(value)) = lattice.get(&id) else {
                    continue;
                };
                let pool_idx = cp.insert(value.clone());
                let instr = version.instr_mut(id);
                instr.ty = PirType::of_const(value);
                instr.effects = crate::pir::Effects::none();
                instr.kind = InstrKind::LdConst(pool_idx);
                rewrote = true;
            }
        }
        rewrote
    }
}

/// Abstract evaluation of one instruction. `None` means "not tracked".
fn evaluate(
    version: &ClosureVersion,
    cp: &ConstPool,
    lattice: &FxHashMap<InstrId, Flat>,
    id: InstrId,
) -> Option<Flat> {
    let lookup = |v: Val| -> Option<Flat> {
        match v {
            Val::Instr(i) => lattice.get(&i).cloned(),
            _ => Some(Flat::Top),
        }
    };
    match &version.instr(id).kind {
        InstrKind::LdConst(idx) => Some(Flat::Const(cp.get(*idx).clone())),
        InstrKind::Phi { inputs } => {
            let mut acc: Option<Flat> = None;
            for (_, v) in inputs {
                match lookup(*v) {
                    None => {} // bottom input: ignore until it resolves
                    Some(Flat::Top) => return Some(Flat::Top),
                    Some(Flat::Const(c)) => match &acc {
                        None => acc = Some(Flat::Const(c)),
                        Some(Flat::Const(seen)) if seen.identical(&c) => {}
                        _ => return Some(Flat::Top),
                    },
                }
            }
            acc
        }
        InstrKind::CastType { val, .. } | InstrKind::Force { val } => lookup(*val),
        InstrKind::Binop {
            op,
            lhs,
            rhs,
            env: Val::ElidedEnv,
            ..
        } => {
            let (l, r) = (lookup(*lhs)?, lookup(*rhs)?);
            match (l, r) {
                (Flat::Const(a), Flat::Const(b)) => {
                    Some(fold_binop(*op, &a, &b).map_or(Flat::Top, Flat::Const))
                }
                _ => Some(Flat::Top),
            }
        }
        _ => {
            // Anything else is opaque.
            Some(Flat::Top)
        }
    }
}

/// Fold a scalar binop where no warning or error could fire.
fn fold_binop(op: BinopKind, a: &RVal, b: &RVal) -> Option<RVal> {
    if let (Some(x), Some(y)) = (a.as_int_scalar(), b.as_int_scalar()) {
        return fold_int(op, x, y);
    }
    if let (Some(x), Some(y)) = (a.as_real_scalar(), b.as_real_scalar()) {
        return fold_real(op, x, y);
    }
    None
}

fn fold_int(op: BinopKind, x: i32, y: i32) -> Option<RVal> {
    let na = x == NA_INTEGER || y == NA_INTEGER;
    match op {
        BinopKind::Add | BinopKind::Sub | BinopKind::Mul => {
            if na {
                return Some(RVal::int_na());
            }
            let z = match op {
                BinopKind::Add => x.checked_add(y),
                BinopKind::Sub => x.checked_sub(y),
                _ => x.checked_mul(y),
            };
            match z {
                // Overflow warns at runtime; leave it to the interpreter.
                None => None,
                Some(z) if z == NA_INTEGER => None,
                Some(z) => Some(RVal::int(z)),
            }
        }
        BinopKind::Eq | BinopKind::Ne | BinopKind::Lt | BinopKind::Le | BinopKind::Gt
        | BinopKind::Ge => {
            if na {
                return Some(RVal::lgl_na());
            }
            let b = match op {
                BinopKind::Eq => x == y,
                BinopKind::Ne => x != y,
                BinopKind::Lt => x < y,
                BinopKind::Le => x <= y,
                BinopKind::Gt => x > y,
                _ => x >= y,
            };
            Some(RVal::lgl(b))
        }
        _ => None,
    }
}

fn fold_real(op: BinopKind, x: f64, y: f64) -> Option<RVal> {
    let na = x.is_nan() || y.is_nan();
    match op {
        BinopKind::Add => Some(RVal::real(x + y)),
        BinopKind::Sub => Some(RVal::real(x - y)),
        BinopKind::Mul => Some(RVal::real(x * y)),
        BinopKind::Div => Some(RVal::real(x / y)),
        BinopKind::Eq | BinopKind::Ne | BinopKind::Lt | BinopKind::Le | BinopKind::Gt
        | BinopKind::Ge => {
            if na {
                return Some(RVal::Lgl(std::rc::Rc::new(rir_core::value::RVec::scalar(
                    NA_LOGICAL,
                ))));
            }
            let b = match op {
                BinopKind::Eq => x == y,
                BinopKind::Ne => x != y,
                BinopKind::Lt => x < y,
                BinopKind::Le => x <= y,
                BinopKind::Gt => x > y,
                _ => x >= y,
            };
            Some(RVal::lgl(b))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pir::instruction::Instr;
    use rir_core::assumptions::OptimizationContext;
    use rir_core::pool::SrcIdx;

    fn version_with_add(x: RVal, y: RVal, cp: &mut ConstPool) -> (ClosureVersion, Val) {
        let mut v = ClosureVersion::new(OptimizationContext::base());
        let e = v.entry;
        let xi = cp.insert(x);
        let yi = cp.insert(y);
        let a = v.push_instr(e, Instr::new(InstrKind::LdConst(xi)));
        let b = v.push_instr(e, Instr::new(InstrKind::LdConst(yi)));
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
        (v, add)
    }

    #[test]
    fn test_folds_constant_add() {
        let mut cp = ConstPool::new();
        let (mut v, add) = version_with_add(RVal::int(1), RVal::int(2), &mut cp);
        assert!(ConstantFold.run(&mut v, &mut cp));
        let Val::Instr(id) = add else { panic!() };
        let InstrKind::LdConst(idx) = version_kind(&v, id) else {
            panic!("add did not fold")
        };
        assert_eq!(cp.get(idx).as_int_scalar(), Some(3));
        assert!(v.instr(id).effects.is_pure());
    }

    #[test]
    fn test_overflow_not_folded() {
        let mut cp = ConstPool::new();
        let (mut v, add) = version_with_add(RVal::int(i32::MAX), RVal::int(1), &mut cp);
        ConstantFold.run(&mut v, &mut cp);
        let Val::Instr(id) = add else { panic!() };
        assert!(
            matches!(version_kind(&v, id), InstrKind::Binop { .. }),
            "overflow must stay in the code so its warning fires"
        );
    }

    #[test]
    fn test_na_propagates() {
        let mut cp = ConstPool::new();
        let (mut v, add) = version_with_add(RVal::int_na(), RVal::int(1), &mut cp);
        assert!(ConstantFold.run(&mut v, &mut cp));
        let Val::Instr(id) = add else { panic!() };
        let InstrKind::LdConst(idx) = version_kind(&v, id) else { panic!() };
        assert_eq!(cp.get(idx).as_int_scalar(), Some(NA_INTEGER));
    }

    fn version_kind(v: &ClosureVersion, id: InstrId) -> InstrKind {
        v.instr(id).kind.clone()
    }
}
