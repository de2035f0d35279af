//! RIR to PIR: per-instruction symbolic execution.
//!
//! The translator walks baseline bytecode with an abstract operand stack of
//! SSA values. Mergepoints (jump targets with more than one incoming path)
//! are computed a priori; reaching one materializes a phi per stack slot,
//! and later paths merge into those phis. Runtime feedback steers
//! speculation: binops whose operands were never observed as objects get an
//! `IsObject` guard and an environment-elided fast form, and monomorphic
//! call sites get an `Identical` guard plus a static call, both backed by a
//! deoptimization checkpoint into the baseline.
//!
//! Any unsupported construct aborts the translation; the caller keeps the
//! baseline and no user-visible error surfaces.

use crate::pir::instruction::{BinopKind, Instr, InstrKind, UnopKind, Val};
use crate::pir::module::{ClosId, ClosureVersion, Module};
use crate::pir::types::PirType;
use crate::pir::{BBId, Effects};
use rir_compiler::bytecode::instruction::{BC, DOTS_ARG_IDX, MISSING_ARG_IDX};
use rir_core::assumptions::{Assumptions, OptimizationContext};
use rir_core::code::Code;
use rir_core::error::RirError;
use rir_core::feedback::{FeedbackSlot, ObservedType};
use rir_core::pool::{ConstPool, PoolIdx, SrcPool};
use rir_core::value::RVal;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::rc::Rc;

/// Compile a front-compiled closure into the module, returning its id.
/// Idempotent per host closure; recursion terminates on the second visit.
pub fn compile_closure(
    module: &mut Module,
    closure: &RVal,
    name: &str,
    cp: &mut ConstPool,
    sp: &mut SrcPool,
) -> Result<ClosId, RirError> {
    if let Some(id) = module.lookup(closure) {
        if module.closure(id).versions.is_empty() && !module.closure(id).in_progress {
            return Err(RirError::CannotCompile(format!(
                "{name}: previous attempt failed"
            )));
        }
        return Ok(id);
    }
    let RVal::Closure(cls) = closure else {
        return Err(RirError::CannotCompile("not a closure".into()));
    };
    let Some(dt) = cls.dispatch_table() else {
        return Err(RirError::CannotCompile(format!(
            "{name} is not rir compiled"
        )));
    };
    let baseline = dt.baseline();
    let id = module.declare(name, closure.clone(), Rc::clone(&baseline));
    module.closure_mut(id).in_progress = true;

    let nargs = baseline.signature.nargs() as u8;
    let ctx = OptimizationContext::exact_args(nargs).with_flags(Assumptions::NO_REFLECTION);
    let mut version = ClosureVersion::new(ctx);

    // Entry: materialize the local frame from the actual arguments.
    let entry = version.entry;
    let parent = version.push_instr(entry, Instr::new(InstrKind::LdFunEnv));
    let mut arg_vals = SmallVec::new();
    for i in 0..baseline.signature.nargs() {
        arg_vals.push(version.push_instr(entry, Instr::new(InstrKind::LdArg(i as u32))));
    }
    let env = version.push_instr(
        entry,
        Instr::new(InstrKind::MkEnv {
            parent,
            names: baseline.signature.formals.clone(),
            values: arg_vals,
        }),
    );

    let result = {
        let mut builder = Builder {
            version: &mut version,
            cur: entry,
            env,
        };
        let mut translator = Rir2Pir {
            module: &mut *module,
            cp: &mut *cp,
            sp: &mut *sp,
        };
        translator.try_translate(&baseline.body, &mut builder)
    };
    let result = result.and_then(|res| finalize(&mut version, res));
    module.closure_mut(id).in_progress = false;
    match result {
        Ok(()) => {
            module.closure_mut(id).versions.push(version);
            Ok(id)
        }
        Err(e) => {
            tracing::debug!(target: "pir", closure = name, error = %e, "translation aborted");
            Err(e)
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

struct Builder<'v> {
    version: &'v mut ClosureVersion,
    cur: BBId,
    env: Val,
}

impl Builder<'_> {
    fn push(&mut self, instr: Instr) -> Val {
        self.version.push_instr(self.cur, instr)
    }

    fn create_bb(&mut self) -> BBId {
        self.version.new_bb()
    }

    fn enter(&mut self, bb: BBId) {
        self.cur = bb;
    }

    /// Terminate the current block with a jump to `target`.
    fn seal_jump(&mut self, target: BBId) {
        self.push(Instr::new(InstrKind::Jump));
        self.version.bb_mut(self.cur).set_next(target);
    }

    /// Terminate `from` (not necessarily current) with a jump to `target`.
    fn seal_jump_from(&mut self, from: BBId, target: BBId) {
        self.version.push_instr(from, Instr::new(InstrKind::Jump));
        self.version.bb_mut(from).set_next(target);
    }

    /// Guard: continue only if `cond == expected`, otherwise deoptimize
    /// into the baseline at `pc` with the given live stack.
    fn conditional_deopt(&mut self, cond: Val, expected: bool, pc: u32, stack: &RirStack) {
        let deopt_bb = self.create_bb();
        let cont = self.create_bb();
        self.push(Instr::new(InstrKind::Branch(cond)));
        if expected {
            self.version.bb_mut(self.cur).set_branch(cont, deopt_bb);
        } else {
            self.version.bb_mut(self.cur).set_branch(deopt_bb, cont);
        }
        let env = self.env;
        self.version.push_instr(
            deopt_bb,
            Instr::new(InstrKind::Deopt {
                pc,
                env,
                stack: stack.values.iter().copied().collect(),
            }),
        );
        self.enter(cont);
    }
}

// =============================================================================
// Abstract operand stack
// =============================================================================

#[derive(Clone, Default)]
struct RirStack {
    values: Vec<Val>,
}

impl RirStack {
    fn push(&mut self, v: Val) {
        self.values.push(v);
    }

    fn pop(&mut self) -> Val {
        self.values.pop().expect("abstract stack underflow")
    }

    /// The i-th value from the top (0 is the top).
    fn at(&self, i: usize) -> Val {
        self.values[self.values.len() - 1 - i]
    }

    fn set(&mut self, i: usize, v: Val) {
        let n = self.values.len();
        self.values[n - 1 - i] = v;
    }

    fn top(&self) -> Val {
        self.at(0)
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn clear(&mut self) {
        self.values.clear();
    }
}

// =============================================================================
// Mergepoint discovery
// =============================================================================

/// Jump targets reached by more than one path need phis.
fn find_mergepoints(code: &Code) -> Result<FxHashSet<u32>, RirError> {
    let mut incoming: FxHashMap<u32, u32> = FxHashMap::default();
    // Incoming jump edges. Function entry counts as an edge, so a loop
    // headed at pc 0 still merges.
    incoming.insert(0, 1);
    let mut pc = 0;
    while pc < code.bc.len() {
        let (bc, next) = BC::decode(&code.bc, pc)?;
        if let Some(t) = bc.jmp_target(next) {
            *incoming.entry(t as u32).or_insert(0) += 1;
        }
        pc = next;
    }
    // Fallthrough into a jump target.
    let mut pc = 0;
    while pc < code.bc.len() {
        let (bc, next) = BC::decode(&code.bc, pc)?;
        if !bc.is_uncond_jmp() && !bc.is_exit() {
            if let Some(n) = incoming.get_mut(&(next as u32)) {
                *n += 1;
            }
        }
        pc = next;
    }
    Ok(incoming
        .into_iter()
        .filter_map(|(pc, n)| (n > 1).then_some(pc))
        .collect())
}

// =============================================================================
// Translator
// =============================================================================

/// An established mergepoint: its entry block and the phi per stack slot.
struct MergeState {
    entry_bb: BBId,
    stack: RirStack,
}

struct WorkItem {
    entry_bb: BBId,
    entry_pc: u32,
    stack: RirStack,
}

struct Rir2Pir<'a> {
    module: &'a mut Module,
    cp: &'a mut ConstPool,
    sp: &'a mut SrcPool,
}

type ReturnSite = (BBId, Val);

impl Rir2Pir<'_> {
    fn abort(why: impl Into<String>) -> RirError {
        RirError::CannotCompile(why.into())
    }

    /// Translate one code object into the builder's region, returning the
    /// result value. Aborts leave the version in an undefined state; the
    /// caller discards it.
    fn try_translate(&mut self, code: &Rc<Code>, insert: &mut Builder) -> Result<Val, RirError> {
        let mergepoint_pcs = find_mergepoints(code)?;
        let mut mergepoints: FxHashMap<u32, MergeState> = FxHashMap::default();
        let mut worklist: Vec<WorkItem> = Vec::new();
        let mut results: Vec<ReturnSite> = Vec::new();

        let mut call_feedback: FxHashMap<Val, Vec<RVal>> = FxHashMap::default();
        let mut type_feedback: FxHashMap<Val, ObservedType> = FxHashMap::default();

        let end = code.bc.len() as u32;
        let mut stack = RirStack::default();
        let mut finger: u32 = 0;

        loop {
            if finger == end {
                let Some(item) = worklist.pop() else { break };
                insert.enter(item.entry_bb);
                stack = item.stack;
                finger = item.entry_pc;
            }

            if mergepoint_pcs.contains(&finger) {
                if let Some(other) = mergepoints.get(&finger) {
                    // Merge this path into the established phis.
                    merge_in(insert, other, &stack);
                    stack.clear();
                    let Some(item) = worklist.pop() else { break };
                    insert.enter(item.entry_bb);
                    stack = item.stack;
                    finger = item.entry_pc;
                    continue;
                }
                create_mergepoint(insert, &mut stack);
                mergepoints.insert(
                    finger,
                    MergeState {
                        entry_bb: insert.cur,
                        stack: stack.clone(),
                    },
                );
            }

            let pos = finger;
            let (bc, next) = BC::decode(&code.bc, pos as usize)?;
            let next = next as u32;
            finger = next;

            // Control flow is handled by the driver, not compile_bc.
            if bc.is_jmp() {
                let target = bc.jmp_target(next as usize).unwrap() as u32;
                match bc {
                    BC::Br(_) => {
                        finger = target;
                        continue;
                    }
                    BC::BrTrue(_) | BC::BrFalse(_) => {
                        let cond = stack.pop();
                        insert.push(Instr::new(InstrKind::Branch(cond)));
                    }
                    BC::BeginLoop(_) => {
                        return Err(Self::abort("unsupported beginloop bytecode"));
                    }
                    _ => unreachable!(),
                }

                let branch_src = insert.cur;
                // Give each edge to a mergepoint its own block, so phi
                // inputs can name the incoming edge.
                let mut edge_split = |insert: &mut Builder, trg: u32| {
                    let bb = insert.create_bb();
                    if mergepoint_pcs.contains(&trg) {
                        let pad = insert.create_bb();
                        insert.seal_jump_from(bb, pad);
                        (bb, pad)
                    } else {
                        (bb, bb)
                    }
                };
                let (branch_bb, branch_cont) = edge_split(insert, target);
                let (fall_bb, fall_cont) = edge_split(insert, next);

                match bc {
                    // succ0 taken when the condition is true.
                    BC::BrTrue(_) => insert
                        .version
                        .bb_mut(branch_src)
                        .set_branch(branch_bb, fall_bb),
                    BC::BrFalse(_) => insert
                        .version
                        .bb_mut(branch_src)
                        .set_branch(fall_bb, branch_bb),
                    _ => unreachable!(),
                }

                worklist.push(WorkItem {
                    entry_bb: branch_cont,
                    entry_pc: target,
                    stack: stack.clone(),
                });
                insert.enter(fall_cont);
                continue;
            }

            if bc.is_exit() {
                match bc {
                    BC::Ret => {
                        let tos = stack.pop();
                        if !stack.is_empty() {
                            return Err(Self::abort("operand stack not empty at return"));
                        }
                        results.push((insert.cur, tos));
                        finger = end;
                        continue;
                    }
                    BC::Deopt(_) => {
                        return Err(Self::abort("recompiling specialized code"));
                    }
                    _ => unreachable!(),
                }
            }

            // Function-literal pattern: a compiled prototype closure constant
            // immediately rebound by close_.
            if let BC::Push(idx) = &bc {
                if matches!(self.cp.get(*idx), RVal::Closure(_)) {
                    if let Ok((BC::Close, after_close)) = BC::decode(&code.bc, next as usize) {
                        let env = insert.env;
                        stack.push(insert.push(Instr::new(InstrKind::MkCls {
                            proto: *idx,
                            env,
                        })));
                        finger = after_close as u32;
                        continue;
                    }
                }
            }

            let before = stack.len();
            self.compile_bc(
                &bc,
                pos,
                code,
                &mut stack,
                insert,
                &mut call_feedback,
                &mut type_feedback,
            )?;
            debug_assert_eq!(
                stack.len(),
                before - bc.pops() + bc.pushes(),
                "stack mismatch interpreting {bc:?}"
            );
        }

        if results.is_empty() {
            return Err(Self::abort("function has no return path"));
        }

        // Join all return sites.
        if results.len() == 1 {
            let (bb, val) = results.pop().unwrap();
            insert.enter(bb);
            Ok(val)
        } else {
            let merge = insert.create_bb();
            let mut inputs: SmallVec<[(BBId, Val); 2]> = SmallVec::new();
            for (bb, val) in &results {
                insert.seal_jump_from(*bb, merge);
                inputs.push((*bb, *val));
            }
            insert.enter(merge);
            let ty = results
                .iter()
                .fold(PirType::voyd(), |t, (_, v)| t.join(insert.version.type_of(*v)));
            let mut phi = Instr::new(InstrKind::Phi { inputs });
            phi.ty = ty;
            Ok(insert.push(phi))
        }
    }

    /// Translate one non-control instruction.
    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn compile_bc(
        &mut self,
        bc: &BC,
        pos: u32,
        code: &Rc<Code>,
        stack: &mut RirStack,
        insert: &mut Builder,
        call_feedback: &mut FxHashMap<Val, Vec<RVal>>,
        type_feedback: &mut FxHashMap<Val, ObservedType>,
    ) -> Result<(), RirError> {
        let env = insert.env;
        let src = code.src_at(pos);

        match bc {
            BC::Nop | BC::Invisible | BC::Visible => {}

            BC::Push(idx) => {
                let mut i = Instr::new(InstrKind::LdConst(*idx));
                i.ty = PirType::of_const(self.cp.get(*idx));
                stack.push(insert.push(i));
            }
            BC::Pop => {
                stack.pop();
            }
            BC::Dup => stack.push(stack.top()),
            BC::Dup2 => {
                stack.push(stack.at(1));
                stack.push(stack.at(1));
            }
            BC::Swap => {
                let x = stack.pop();
                let y = stack.pop();
                stack.push(x);
                stack.push(y);
            }
            BC::Pull(i) => stack.push(stack.at(*i as usize)),
            BC::Pick(n) => {
                let x = stack.at(*n as usize);
                for i in (1..=*n as usize).rev() {
                    let below = stack.at(i - 1);
                    stack.set(i, below);
                }
                stack.set(0, x);
            }
            BC::Put(n) => {
                let x = stack.top();
                for i in 0..*n as usize {
                    let above = stack.at(i + 1);
                    stack.set(i, above);
                }
                stack.set(*n as usize, x);
            }

            BC::LdVar(idx) => {
                let name = self.cp.get_sym(*idx).clone();
                let v = insert.push(Instr::new(InstrKind::LdVar { name, env }));
                let mut f = Instr::new(InstrKind::Force { val: v });
                f.ty = insert.version.type_of(v).forced();
                stack.push(insert.push(f));
            }
            BC::LdVarSuper(idx) => {
                let name = self.cp.get_sym(*idx).clone();
                stack.push(insert.push(Instr::new(InstrKind::LdVarSuper { name, env })));
            }
            BC::StVar(idx) => {
                let name = self.cp.get_sym(*idx).clone();
                let val = stack.pop();
                insert.push(Instr::new(InstrKind::StVar { name, val, env }));
            }
            BC::StVarSuper(idx) => {
                let name = self.cp.get_sym(*idx).clone();
                let val = stack.pop();
                insert.push(Instr::new(InstrKind::StVarSuper { name, val, env }));
            }
            BC::LdFun(idx) => {
                let name = self.cp.get_sym(*idx).clone();
                stack.push(insert.push(Instr::new(InstrKind::LdFun { name, env })));
            }

            BC::RecordBinop(slot) => {
                let FeedbackSlot::Binop(fb) = &code.feedback[*slot as usize] else {
                    return Err(Self::abort("feedback slot shape mismatch"));
                };
                if fb[0].seen_any() {
                    type_feedback.insert(stack.at(1), fb[0].observed());
                }
                if fb[1].seen_any() {
                    type_feedback.insert(stack.at(0), fb[1].observed());
                }
            }
            BC::RecordCall(slot) => {
                let FeedbackSlot::Call(fb) = &code.feedback[*slot as usize] else {
                    return Err(Self::abort("feedback slot shape mismatch"));
                };
                call_feedback.insert(stack.top(), fb.targets().into_vec());
            }

            BC::CallImplicit { ast, args } | BC::NamedCallImplicit { ast, args, .. } => {
                self.implicit_call(bc, pos, *ast, args, code, stack, insert, call_feedback)?;
            }

            BC::Call { nargs, ast } | BC::NamedCall { nargs, ast, .. } => {
                let mut argv: SmallVec<[Val; 4]> = SmallVec::new();
                for _ in 0..*nargs {
                    argv.push(stack.pop());
                }
                argv.reverse();
                let callee = stack.pop();
                let kind = match bc {
                    BC::NamedCall { names, .. } => InstrKind::NamedCall {
                        callee,
                        args: argv,
                        names: *names,
                        env,
                        ast: *ast,
                    },
                    _ => InstrKind::Call {
                        callee,
                        args: argv,
                        env,
                        ast: *ast,
                    },
                };
                stack.push(insert.push(Instr::new(kind)));
            }

            BC::StaticCall { nargs, ast, target } => {
                let mut argv: SmallVec<[Val; 4]> = SmallVec::new();
                for _ in 0..*nargs {
                    argv.push(stack.pop());
                }
                argv.reverse();
                match self.cp.get(*target).clone() {
                    RVal::Builtin(b) => {
                        // Conservatively environment-dependent here; the
                        // safe-builtin lifting pass sheds the environment
                        // once argument types prove non-object.
                        stack.push(insert.push(Instr::new(InstrKind::CallBuiltin {
                            builtin: b,
                            args: argv,
                            env,
                            ast: *ast,
                        })));
                    }
                    target_val @ RVal::Closure(_) => {
                        compile_closure(self.module, &target_val, "", self.cp, self.sp)
                            .map_err(|_| Self::abort("static call target failed to compile"))?;
                        stack.push(insert.push(Instr::new(InstrKind::StaticCall {
                            callee: *target,
                            args: argv,
                            env,
                            ast: *ast,
                        })));
                    }
                    _ => return Err(Self::abort("static call to a non-function")),
                }
            }

            binop @ (BC::Add | BC::Sub | BC::Mul | BC::Div | BC::IDiv | BC::Mod | BC::Pow
            | BC::Eq | BC::Ne | BC::Lt | BC::Le | BC::Gt | BC::Ge) => {
                let op = binop_kind(binop);
                let rhs = stack.at(0);
                let lhs = stack.at(1);
                let lfb = type_feedback.get(&lhs).copied();
                let rfb = type_feedback.get(&rhs).copied();
                let speculate = matches!((lfb, rfb), (Some(l), Some(r))
                    if !l.contains(ObservedType::OBJECT) && !r.contains(ObservedType::OBJECT));
                if speculate {
                    // Guard both operands, then run without an environment.
                    let l_obj = insert.push(Instr::new(InstrKind::IsObject(lhs)));
                    insert.conditional_deopt(l_obj, false, pos, stack);
                    let r_obj = insert.push(Instr::new(InstrKind::IsObject(rhs)));
                    insert.conditional_deopt(r_obj, false, pos, stack);
                    stack.pop();
                    stack.pop();
                    let mut i = Instr::new(InstrKind::Binop {
                        op,
                        lhs,
                        rhs,
                        env: Val::ElidedEnv,
                        src,
                    });
                    i.feedback = Some(lfb.unwrap() | rfb.unwrap());
                    stack.push(insert.push(i));
                } else {
                    stack.pop();
                    stack.pop();
                    stack.push(insert.push(Instr::new(InstrKind::Binop {
                        op,
                        lhs,
                        rhs,
                        env,
                        src,
                    })));
                }
            }

            BC::LglAnd | BC::LglOr => {
                let rhs = stack.pop();
                let lhs = stack.pop();
                let op = if matches!(bc, BC::LglAnd) {
                    BinopKind::LglAnd
                } else {
                    BinopKind::LglOr
                };
                stack.push(insert.push(Instr::new(InstrKind::Binop {
                    op,
                    lhs,
                    rhs,
                    env: Val::ElidedEnv,
                    src,
                })));
            }

            BC::Not | BC::UPlus | BC::UMinus => {
                let val = stack.pop();
                let op = match bc {
                    BC::Not => UnopKind::Not,
                    BC::UPlus => UnopKind::Plus,
                    _ => UnopKind::Minus,
                };
                stack.push(insert.push(Instr::new(InstrKind::Unop { op, val, env, src })));
            }

            BC::Identical => {
                let rhs = stack.pop();
                let lhs = stack.pop();
                stack.push(insert.push(Instr::new(InstrKind::Identical(lhs, rhs))));
            }
            BC::Is(tag) => {
                let val = stack.pop();
                stack.push(insert.push(Instr::new(InstrKind::Is {
                    type_tag: *tag,
                    val,
                })));
            }

            // Unsupported surface constructs: abort, fall back to baseline.
            BC::LdDdVar(_) => return Err(Self::abort("unsupported ..n variable")),
            BC::Missing(_) => return Err(Self::abort("unsupported missing check")),
            BC::EndContext => return Err(Self::abort("unsupported context bytecode")),
            BC::Close => return Err(Self::abort("unrecognized closure construction")),

            // Opcodes only the lowerer emits: refusing them guards against
            // recompiling already-specialized code.
            BC::LdVarNoForce(_)
            | BC::LdArg(_)
            | BC::LdLoc(_)
            | BC::StLoc(_)
            | BC::MovLoc(..)
            | BC::CheckMissing
            | BC::Force
            | BC::MkPromise(_)
            | BC::MkEnv { .. }
            | BC::GetEnv
            | BC::SetEnv
            | BC::ParentEnv
            | BC::IsObj => {
                return Err(Self::abort("specialized bytecode in translation input"))
            }

            BC::Br(_) | BC::BrTrue(_) | BC::BrFalse(_) | BC::BeginLoop(_) | BC::Ret
            | BC::Deopt(_) => unreachable!("handled by the driver"),
        }
        Ok(())
    }

    /// An implicit call: arguments are promise codes in the immediates.
    #[allow(clippy::too_many_arguments)]
    fn implicit_call(
        &mut self,
        bc: &BC,
        pos: u32,
        ast: PoolIdx,
        arg_idxs: &SmallVec<[u32; 4]>,
        code: &Rc<Code>,
        stack: &mut RirStack,
        insert: &mut Builder,
        call_feedback: &FxHashMap<Val, Vec<RVal>>,
    ) -> Result<(), RirError> {
        let env = insert.env;
        let mut args: SmallVec<[Val; 4]> = SmallVec::new();
        for &argi in arg_idxs {
            if argi == DOTS_ARG_IDX {
                return Err(Self::abort("cannot compile call with ... arguments"));
            }
            if argi == MISSING_ARG_IDX {
                return Err(Self::abort(
                    "cannot compile call with explicitly missing arguments",
                ));
            }
            let prom_code = code.child(argi);
            let (prom, prom_entry) = insert.version.create_promise(Rc::clone(&prom_code));
            {
                let mut prom_builder = Builder {
                    version: &mut *insert.version,
                    cur: prom_entry,
                    env,
                };
                let mut sub = Rir2Pir {
                    module: &mut *self.module,
                    cp: &mut *self.cp,
                    sp: &mut *self.sp,
                };
                let res = sub.try_translate(&prom_code, &mut prom_builder)?;
                let cur = prom_builder.cur;
                prom_builder
                    .version
                    .push_instr(cur, Instr::new(InstrKind::Return(res)));
            }
            // Pure promises can also be evaluated eagerly at the call.
            let mut eager = Val::MissingArg;
            if promise_is_pure(insert.version, prom) {
                if let Ok(v) = self.try_inline_promise(&prom_code, insert) {
                    eager = v;
                }
            }
            args.push(insert.push(Instr::new(InstrKind::MkArg { prom, eager, env })));
        }

        let callee = stack.top();
        let named = matches!(bc, BC::NamedCallImplicit { .. });

        // Speculative monomorphic inlining of the static call target.
        let mut monomorphic: Option<RVal> = None;
        if !named {
            if let Some(targets) = call_feedback.get(&callee) {
                if targets.len() == 1 {
                    monomorphic = Some(targets[0].clone());
                }
            }
        }

        if let Some(target) = monomorphic {
            let compiled = matches!(&target, RVal::Closure(c) if c.dispatch_table().is_some())
                && compile_closure(self.module, &target, "", self.cp, self.sp).is_ok();
            if compiled {
                let expected_idx = self.cp.insert(target);
                let mut expected = Instr::new(InstrKind::LdConst(expected_idx));
                expected.ty = PirType::closure();
                let expected = insert.push(expected);
                let t = insert.push(Instr::new(InstrKind::Identical(callee, expected)));
                insert.conditional_deopt(t, true, pos, stack);
                stack.pop();
                stack.push(insert.push(Instr::new(InstrKind::StaticCall {
                    callee: expected_idx,
                    args,
                    env,
                    ast,
                })));
                return Ok(());
            }
        }

        let callee = stack.pop();
        let kind = match bc {
            BC::NamedCallImplicit { names, .. } => InstrKind::NamedCall {
                callee,
                args,
                names: *names,
                env,
                ast,
            },
            _ => InstrKind::Call {
                callee,
                args,
                env,
                ast,
            },
        };
        stack.push(insert.push(Instr::new(kind)));
        Ok(())
    }

    /// Re-translate a pure promise body inline at the call site.
    fn try_inline_promise(
        &mut self,
        prom_code: &Rc<Code>,
        insert: &mut Builder,
    ) -> Result<Val, RirError> {
        let mut sub = Rir2Pir {
            module: &mut *self.module,
            cp: &mut *self.cp,
            sp: &mut *self.sp,
        };
        sub.try_translate(prom_code, insert)
    }
}

/// No effects beyond forcing: safe to evaluate at promise-creation time.
fn promise_is_pure(version: &ClosureVersion, prom: crate::pir::PromId) -> bool {
    let entry = version.promise(prom).entry;
    let allowed = Effects::VISIBILITY;
    version
        .rpo(entry)
        .iter()
        .all(|bb| {
            version
                .bb(*bb)
                .instrs
                .iter()
                .all(|i| allowed.contains(version.instr(*i).effects))
        })
}

fn binop_kind(bc: &BC) -> BinopKind {
    match bc {
        BC::Add => BinopKind::Add,
        BC::Sub => BinopKind::Sub,
        BC::Mul => BinopKind::Mul,
        BC::Div => BinopKind::Div,
        BC::IDiv => BinopKind::IDiv,
        BC::Mod => BinopKind::Mod,
        BC::Pow => BinopKind::Pow,
        BC::Eq => BinopKind::Eq,
        BC::Ne => BinopKind::Ne,
        BC::Lt => BinopKind::Lt,
        BC::Le => BinopKind::Le,
        BC::Gt => BinopKind::Gt,
        BC::Ge => BinopKind::Ge,
        _ => unreachable!(),
    }
}

// =============================================================================
// Mergepoint plumbing
// =============================================================================

/// Start a fresh block and turn every stack slot into a phi.
fn create_mergepoint(insert: &mut Builder, stack: &mut RirStack) {
    let old_bb = insert.cur;
    let next = insert.create_bb();
    insert.seal_jump(next);
    insert.enter(next);
    for i in 0..stack.len() {
        let v = stack.values[i];
        let mut phi = Instr::new(InstrKind::Phi {
            inputs: smallvec::smallvec![(old_bb, v)],
        });
        phi.ty = insert.version.type_of(v);
        let p = insert.push(phi);
        stack.values[i] = p;
    }
}

/// Merge an incoming path into an established mergepoint.
fn merge_in(insert: &mut Builder, target: &MergeState, incoming: &RirStack) {
    assert_eq!(
        target.stack.len(),
        incoming.values.len(),
        "stack depth mismatch at mergepoint"
    );
    let from_bb = insert.cur;
    for (i, phi_val) in target.stack.values.iter().enumerate() {
        let Val::Instr(phi_id) = phi_val else {
            panic!("mergepoint slot is not a phi")
        };
        // One input per incoming edge, self-references included, so phi
        // arity always matches the predecessor list.
        let incoming_val = incoming.values[i];
        let ty = insert.version.type_of(incoming_val);
        let instr = insert.version.instr_mut(*phi_id);
        if let InstrKind::Phi { inputs } = &mut instr.kind {
            inputs.push((from_bb, incoming_val));
        }
        instr.ty = instr.ty.join(ty);
    }
    insert.seal_jump(target.entry_bb);
}

// =============================================================================
// Finalization
// =============================================================================

/// Phi cleanup, type updates, cast insertion, return insertion.
fn finalize(version: &mut ClosureVersion, mut ret: Val) -> Result<(), RirError> {
    // Remove singleton phis and phis whose inputs all agree.
    let mut changed = true;
    while changed {
        changed = false;
        for bb_idx in 0..version.bbs.len() {
            let bb = BBId(bb_idx as u32);
            let instr_ids = version.bb(bb).instrs.clone();
            for id in instr_ids {
                let InstrKind::Phi { inputs } = &version.instr(id).kind else {
                    continue;
                };
                let mut all_same: Option<Val> = None;
                let mut uniform = true;
                for (_, v) in inputs {
                    if *v == Val::Instr(id) {
                        continue;
                    }
                    match all_same {
                        None => all_same = Some(*v),
                        Some(seen) if seen == *v => {}
                        Some(_) => {
                            uniform = false;
                            break;
                        }
                    }
                }
                if uniform {
                    if let Some(replacement) = all_same {
                        if ret == Val::Instr(id) {
                            ret = replacement;
                        }
                        version.replace_uses(Val::Instr(id), replacement);
                        version
                            .bb_mut(bb)
                            .instrs
                            .retain(|i| *i != id);
                        changed = true;
                    }
                } else {
                    // Refresh the phi's type from its inputs.
                    let ty = version
                        .instr(id)
                        .inputs()
                        .iter()
                        .fold(PirType::voyd(), |t, v| t.join(version.type_of(*v)));
                    if ty != version.instr(id).ty {
                        version.instr_mut(id).ty = ty;
                        changed = true;
                    }
                }
            }
        }
    }

    // The driver leaves the builder on the exit block; add the return.
    let exit = find_exitless_bb(version).ok_or_else(|| {
        RirError::CannotCompile("no exit block after translation".into())
    })?;
    version.push_instr(exit, Instr::new(InstrKind::Return(ret)));

    insert_casts(version);
    Ok(())
}

/// The unique block lacking a terminator (where the return belongs).
fn find_exitless_bb(version: &ClosureVersion) -> Option<BBId> {
    let reachable = version.rpo(version.entry);
    reachable.into_iter().find(|bb| {
        version
            .bb(*bb)
            .instrs
            .last()
            .is_none_or(|id| !version.instr(*id).is_terminator())
    })
}

/// Insert `CastType` where a consumer requires a forced value but the
/// producer may still be promise-wrapped.
fn insert_casts(version: &mut ClosureVersion) {
    for bb_idx in 0..version.bbs.len() {
        let bb = BBId(bb_idx as u32);
        let mut pos = 0;
        while pos < version.bb(bb).instrs.len() {
            let id = version.bb(bb).instrs[pos];
            let needs_forced: Vec<Val> = match &version.instr(id).kind {
                InstrKind::Binop { env: Val::ElidedEnv, lhs, rhs, .. } => vec![*lhs, *rhs],
                InstrKind::CallSafeBuiltin { args, .. } => args.iter().copied().collect(),
                _ => Vec::new(),
            };
            for v in needs_forced {
                if version.type_of(v).maybe_promise() {
                    let to = version.type_of(v).forced();
                    let cast = version.insert_instr(
                        bb,
                        pos,
                        Instr::new(InstrKind::CastType { val: v, to }),
                    );
                    pos += 1;
                    let instr = version.instr_mut(id);
                    instr.map_inputs(|x| if x == v { cast } else { x });
                }
            }
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::verify;
    use rir_compiler::compile::Compiler;
    use rir_core::ast;
    use rir_core::value::{ClosureBody, Env, Formal, RClosure};
    use std::cell::RefCell;

    fn make_closure(
        formals: Vec<Formal>,
        body: RVal,
        cp: &mut ConstPool,
        sp: &mut SrcPool,
    ) -> RVal {
        let cls = RVal::Closure(Rc::new(RClosure {
            formals,
            body: RefCell::new(ClosureBody::Ast(body)),
            env: Env::new(None),
        }));
        Compiler::new(cp, sp).compile_closure(&cls).unwrap();
        cls
    }

    fn formal(name: &str) -> Formal {
        Formal {
            name: rir_core::intern::sym(name),
            default: None,
        }
    }

    #[test]
    fn test_translate_identity() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let cls = make_closure(vec![formal("x")], ast::s("x"), &mut cp, &mut sp);
        let mut m = Module::new();
        let id = compile_closure(&mut m, &cls, "id", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        assert!(verify(v).is_ok());
        // Expect LdFunEnv, LdArg, MkEnv, LdVar, Force, Return somewhere.
        let kinds: Vec<_> = v
            .rpo(v.entry)
            .iter()
            .flat_map(|bb| v.bb(*bb).instrs.clone())
            .map(|i| format!("{:?}", v.instr(i).kind))
            .collect();
        assert!(kinds.iter().any(|k| k.starts_with("MkEnv")));
        assert!(kinds.iter().any(|k| k.starts_with("LdVar")));
        assert!(kinds.iter().any(|k| k.starts_with("Force")));
        assert!(kinds.iter().any(|k| k.starts_with("Return")));
    }

    #[test]
    fn test_translate_branch_makes_phi() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let body = ast::if_(ast::s("c"), RVal::int(1), Some(RVal::int(2)));
        let cls = make_closure(vec![formal("c")], body, &mut cp, &mut sp);
        let mut m = Module::new();
        let id = compile_closure(&mut m, &cls, "br", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        assert!(verify(v).is_ok(), "{:?}", verify(v));
        let has_phi = v
            .rpo(v.entry)
            .iter()
            .flat_map(|bb| v.bb(*bb).instrs.clone())
            .any(|i| v.instr(i).is_phi());
        assert!(has_phi, "two return paths need a phi");
    }

    #[test]
    fn test_binop_without_feedback_keeps_env() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let body = ast::binop("+", ast::s("a"), ast::s("b"));
        let cls = make_closure(vec![formal("a"), formal("b")], body, &mut cp, &mut sp);
        let mut m = Module::new();
        let id = compile_closure(&mut m, &cls, "add", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        let env_kept = v
            .rpo(v.entry)
            .iter()
            .flat_map(|bb| v.bb(*bb).instrs.clone())
            .any(|i| {
                matches!(&v.instr(i).kind, InstrKind::Binop { env, .. } if !matches!(env, Val::ElidedEnv))
            });
        assert!(env_kept, "cold site must stay generic");
    }

    #[test]
    fn test_binop_with_feedback_speculates() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let body = ast::binop("+", ast::s("a"), ast::s("b"));
        let cls = make_closure(vec![formal("a"), formal("b")], body, &mut cp, &mut sp);
        // Simulate the interpreter having recorded scalar ints.
        let RVal::Closure(c) = &cls else { panic!() };
        let baseline = c.dispatch_table().unwrap().baseline();
        let FeedbackSlot::Binop(fb) = &baseline.body.feedback[0] else {
            panic!()
        };
        fb[0].record(&RVal::int(1));
        fb[1].record(&RVal::int(2));

        let mut m = Module::new();
        let id = compile_closure(&mut m, &cls, "add", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        assert!(verify(v).is_ok(), "{:?}", verify(v));
        let all: Vec<_> = v
            .rpo(v.entry)
            .iter()
            .flat_map(|bb| v.bb(*bb).instrs.clone())
            .collect();
        let elided = all.iter().any(|i| {
            matches!(&v.instr(*i).kind, InstrKind::Binop { env: Val::ElidedEnv, .. })
        });
        let guarded = all
            .iter()
            .any(|i| matches!(&v.instr(*i).kind, InstrKind::IsObject(_)));
        let deopts = all
            .iter()
            .any(|i| matches!(&v.instr(*i).kind, InstrKind::Deopt { .. }));
        assert!(elided, "feedback allows env elision");
        assert!(guarded, "speculation needs an IsObject guard");
        assert!(deopts, "guards need a deopt target");
    }

    #[test]
    fn test_monomorphic_call_speculates() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let callee = make_closure(
            vec![formal("x")],
            ast::binop("+", ast::s("x"), RVal::int(1)),
            &mut cp,
            &mut sp,
        );
        let caller = make_closure(
            vec![formal("y")],
            ast::call("f", vec![ast::s("y")]),
            &mut cp,
            &mut sp,
        );
        // Simulate call feedback observing the callee.
        let RVal::Closure(c) = &caller else { panic!() };
        let baseline = c.dispatch_table().unwrap().baseline();
        let FeedbackSlot::Call(fb) = &baseline.body.feedback[0] else {
            panic!()
        };
        fb.record(&callee);

        let mut m = Module::new();
        let id = compile_closure(&mut m, &caller, "g", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        assert!(verify(v).is_ok(), "{:?}", verify(v));
        let all: Vec<_> = v
            .rpo(v.entry)
            .iter()
            .flat_map(|bb| v.bb(*bb).instrs.clone())
            .collect();
        assert!(all
            .iter()
            .any(|i| matches!(&v.instr(*i).kind, InstrKind::Identical(..))));
        assert!(all
            .iter()
            .any(|i| matches!(&v.instr(*i).kind, InstrKind::StaticCall { .. })));
        assert!(all
            .iter()
            .any(|i| matches!(&v.instr(*i).kind, InstrKind::Deopt { .. })));
        // The callee was compiled into the module too.
        assert_eq!(m.closures.len(), 2);
    }

    #[test]
    fn test_polymorphic_call_stays_generic() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let caller = make_closure(
            vec![formal("y")],
            ast::call("f", vec![ast::s("y")]),
            &mut cp,
            &mut sp,
        );
        let mut m = Module::new();
        let id = compile_closure(&mut m, &caller, "g", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        let has_static = v
            .rpo(v.entry)
            .iter()
            .flat_map(|bb| v.bb(*bb).instrs.clone())
            .any(|i| matches!(&v.instr(i).kind, InstrKind::StaticCall { .. }));
        assert!(!has_static, "no feedback, no speculation");
    }

    #[test]
    fn test_promise_region_created() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let caller = make_closure(
            vec![formal("y")],
            ast::call("f", vec![ast::binop("+", ast::s("y"), RVal::int(1))]),
            &mut cp,
            &mut sp,
        );
        let mut m = Module::new();
        let id = compile_closure(&mut m, &caller, "g", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        assert_eq!(v.promises.len(), 1);
        assert!(verify(v).is_ok(), "{:?}", verify(v));
    }

    #[test]
    fn test_pure_promise_inlined_eagerly() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let caller = make_closure(
            vec![],
            ast::call("f", vec![RVal::int(10)]),
            &mut cp,
            &mut sp,
        );
        let mut m = Module::new();
        let id = compile_closure(&mut m, &caller, "g", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        let eager_set = v
            .rpo(v.entry)
            .iter()
            .flat_map(|bb| v.bb(*bb).instrs.clone())
            .any(|i| {
                matches!(&v.instr(i).kind, InstrKind::MkArg { eager, .. } if !matches!(eager, Val::MissingArg))
            });
        assert!(eager_set, "a constant argument promise is pure");
    }

    #[test]
    fn test_loop_context_aborts() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        // A loop whose body calls gets a context, which PIR refuses.
        let body = ast::while_(ast::s("c"), ast::call("f", vec![]));
        let cls = make_closure(vec![formal("c")], body, &mut cp, &mut sp);
        let mut m = Module::new();
        let err = compile_closure(&mut m, &cls, "w", &mut cp, &mut sp).unwrap_err();
        assert!(matches!(err, RirError::CannotCompile(_)));
    }

    #[test]
    fn test_plain_loop_translates_with_phis() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        // while (i < 10) i <- i + 1  has no calls, so no context.
        let body = ast::block(vec![
            ast::while_(
                ast::binop("<", ast::s("i"), RVal::int(10)),
                ast::assign("i", ast::binop("+", ast::s("i"), RVal::int(1))),
            ),
            ast::s("i"),
        ]);
        let cls = make_closure(vec![formal("i")], body, &mut cp, &mut sp);
        let mut m = Module::new();
        let id = compile_closure(&mut m, &cls, "loop", &mut cp, &mut sp).unwrap();
        let v = &m.closure(id).versions[0];
        assert!(verify(v).is_ok(), "{:?}", verify(v));
    }
}
