//! The PIR verifier.
//!
//! Checks the structural invariants every pass must preserve: exactly one
//! terminator per block and only at the end, phis first and with one input
//! per predecessor, every input dominated by its definition, and no
//! `voyd`-typed value consumed. The optimizer runs it after every pass in
//! debug builds; a failure aborts the optimization and keeps the baseline.

use crate::pir::{BBId, ClosureVersion, InstrKind, Val};
use rustc_hash::FxHashMap;

/// A broken invariant, with enough context to locate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub bb: BBId,
    pub message: String,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BB{}: {}", self.bb.0, self.message)
    }
}

/// Verify one region (the body or a promise) rooted at `entry`.
pub fn verify_region(version: &ClosureVersion, entry: BBId) -> Result<(), VerifyError> {
    let rpo = version.rpo(entry);
    let preds = version.predecessors();
    let idom = version.dominators(entry);
    let def_bb = version.def_blocks();

    let err = |bb: BBId, message: String| Err(VerifyError { bb, message });

    for &bb in &rpo {
        let block = version.bb(bb);

        // Terminator discipline.
        match block.instrs.last() {
            None => return err(bb, "empty block".into()),
            Some(&last) => {
                if !version.instr(last).is_terminator() {
                    return err(bb, "block does not end in a terminator".into());
                }
            }
        }
        let mut seen_non_phi = false;
        for (i, &id) in block.instrs.iter().enumerate() {
            let instr = version.instr(id);
            if instr.is_terminator() && i + 1 != block.instrs.len() {
                return err(bb, format!("terminator %{} not at block end", id.0));
            }
            if instr.is_phi() {
                if seen_non_phi {
                    return err(bb, format!("phi %{} after non-phi", id.0));
                }
            } else {
                seen_non_phi = true;
            }
        }

        // Successor arity must match the terminator.
        let last = *block.instrs.last().unwrap();
        let want_succs = match version.instr(last).kind {
            InstrKind::Branch(_) => 2,
            InstrKind::Jump => 1,
            InstrKind::Return(_) | InstrKind::Deopt { .. } => 0,
            _ => unreachable!(),
        };
        if block.succs.len() != want_succs {
            return err(
                bb,
                format!(
                    "terminator wants {} successors, block has {}",
                    want_succs,
                    block.succs.len()
                ),
            );
        }

        // Per-instruction input checks.
        for (pos, &id) in block.instrs.iter().enumerate() {
            let instr = version.instr(id);

            if let InstrKind::Phi { inputs } = &instr.kind {
                // One input per predecessor, in matching order.
                let ps = &preds[bb.0 as usize];
                if inputs.len() != ps.len() {
                    return err(
                        bb,
                        format!(
                            "phi %{} has {} inputs for {} predecessors",
                            id.0,
                            inputs.len(),
                            ps.len()
                        ),
                    );
                }
                for (in_bb, v) in inputs {
                    if !ps.contains(in_bb) {
                        return err(
                            bb,
                            format!("phi %{} input from non-predecessor BB{}", id.0, in_bb.0),
                        );
                    }
                    // The input must be available at the end of its edge.
                    if let Val::Instr(def) = v {
                        let Some(&db) = def_bb.get(def) else {
                            return err(bb, format!("phi %{} input %{} unplaced", id.0, def.0));
                        };
                        if !ClosureVersion::dominates(&idom, db, *in_bb) {
                            return err(
                                bb,
                                format!(
                                    "phi %{} input %{} does not dominate edge from BB{}",
                                    id.0, def.0, in_bb.0
                                ),
                            );
                        }
                    }
                }
                continue;
            }

            for input in instr.inputs() {
                let Val::Instr(def) = input else { continue };
                // voyd values must never be consumed.
                if version.instr(def).ty.is_voyd() {
                    return err(bb, format!("%{} consumes voyd value %{}", id.0, def.0));
                }
                let Some(&db) = def_bb.get(&def) else {
                    return err(bb, format!("%{} uses unplaced value %{}", id.0, def.0));
                };
                // Dominance: same block and earlier, or a dominating block.
                let ok = if db == bb {
                    block.instrs[..pos].contains(&def)
                } else {
                    ClosureVersion::dominates(&idom, db, bb)
                };
                // Uses in another region (promise vs body) are checked by
                // their own entry; skip defs outside this region.
                if !ok && rpo.contains(&db) {
                    return err(
                        bb,
                        format!("%{} uses %{} which does not dominate it", id.0, def.0),
                    );
                }
            }
        }
    }
    Ok(())
}

/// Verify the whole version: body and every promise region.
pub fn verify(version: &ClosureVersion) -> Result<(), VerifyError> {
    verify_region(version, version.entry)?;
    for prom in &version.promises {
        verify_region(version, prom.entry)?;
    }
    Ok(())
}

/// Check that a rewrite only shrank effect sets (effect conservation).
#[must_use]
pub fn effects_shrank(
    before: &FxHashMap<u32, crate::pir::Effects>,
    version: &ClosureVersion,
) -> bool {
    (0..version.num_instrs() as u32).all(|i| {
        before
            .get(&i)
            .is_none_or(|b| b.contains(version.instr(crate::pir::InstrId(i)).effects))
    })
}
