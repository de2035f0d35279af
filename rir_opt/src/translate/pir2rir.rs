//! PIR to RIR: linearization, slot allocation, deopt emission.
//!
//! Each region (the body and every promise) is linearized independently in
//! reverse postorder. Every value-producing instruction gets a local slot;
//! uses reload from slots, so the operand stack stays shallow. Phi inputs
//! are stored into the phi's slot at the end of each predecessor.
//!
//! The output is richer bytecode than the input: environment opcodes
//! (`make_env_`, `set_env_`, `parent_env_`, `get_env_`), unforced loads,
//! explicit `force_`, speculation checks, and `deopt_` with serialized
//! frame-reconstruction metadata in the constant pool.

use crate::pir::instruction::{BinopKind, InstrKind, UnopKind};
use crate::pir::module::{ClosId, ClosureVersion, Module};
use crate::pir::{BBId, InstrId, Val};
use rir_compiler::bytecode::builder::{CodeBuilder, Label};
use rir_compiler::bytecode::instruction::BC;
use rir_core::code::Code;
use rir_core::deopt::{DeoptMetadata, FrameInfo, ROOT_CODE_REF};
use rir_core::error::RirError;
use rir_core::function::Function;
use rir_core::pool::{ConstPool, SrcPool};
use rir_core::value::{RVal, RVec};
use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;

/// Lower the strongest version of a compiled closure into a specialized
/// function.
pub fn lower_closure(
    module: &Module,
    id: ClosId,
    cp: &mut ConstPool,
    sp: &mut SrcPool,
) -> Result<Rc<Function>, RirError> {
    let closure = module.closure(id);
    let version = closure
        .versions
        .last()
        .ok_or_else(|| RirError::CannotCompile("no version to lower".into()))?;
    let baseline = &closure.baseline;

    // Promise regions first: the body references them as children.
    let mut children: Vec<Rc<Code>> = Vec::new();
    let mut promise_children: FxHashMap<u32, u32> = FxHashMap::default();
    for (i, prom) in version.promises.iter().enumerate() {
        let code_ref = promise_code_ref(baseline, &prom.rir_code)?;
        let lowerer = Lowerer::new(version, cp, sp, prom.entry, code_ref, prom.rir_code.src);
        let code = lowerer.lower_region()?;
        promise_children.insert(i as u32, children.len() as u32);
        children.push(code);
    }

    let mut lowerer = Lowerer::new(
        version,
        cp,
        sp,
        version.entry,
        ROOT_CODE_REF,
        baseline.body.src,
    );
    lowerer.promise_children = promise_children;
    lowerer.extra_children = children;
    let code = lowerer.lower_region()?;

    let fun = Function::new(
        code,
        baseline.defaults.clone(),
        baseline.signature.clone(),
        version.ctx.clone(),
    );
    fun.set_baseline_code(Rc::clone(&baseline.body));
    Ok(fun)
}

/// The deopt code reference of a promise: its index in the baseline root's
/// child table.
fn promise_code_ref(baseline: &Rc<Function>, rir_code: &Rc<Code>) -> Result<u32, RirError> {
    baseline
        .body
        .children
        .iter()
        .position(|c| Rc::ptr_eq(c, rir_code))
        .map(|i| i as u32 + 1)
        .ok_or_else(|| RirError::CannotCompile("promise code not owned by baseline".into()))
}

struct Lowerer<'a> {
    version: &'a ClosureVersion,
    cp: &'a mut ConstPool,
    #[allow(dead_code)]
    sp: &'a mut SrcPool,
    entry: BBId,
    /// Deopt frame reference for this region's baseline code.
    code_ref: u32,
    /// Source reference of the whole region.
    src: rir_core::pool::SrcIdx,
    b: CodeBuilder,
    slots: FxHashMap<InstrId, u32>,
    labels: FxHashMap<BBId, Label>,
    region: FxHashSet<InstrId>,
    /// PIR promise index -> child code index in the emitted code object.
    promise_children: FxHashMap<u32, u32>,
    extra_children: Vec<Rc<Code>>,
    /// The environment value currently installed as the interpreter env.
    installed_env: Option<Val>,
}

impl<'a> Lowerer<'a> {
    fn new(
        version: &'a ClosureVersion,
        cp: &'a mut ConstPool,
        sp: &'a mut SrcPool,
        entry: BBId,
        code_ref: u32,
        src: rir_core::pool::SrcIdx,
    ) -> Self {
        Lowerer {
            version,
            cp,
            sp,
            entry,
            code_ref,
            src,
            b: CodeBuilder::new(),
            slots: FxHashMap::default(),
            labels: FxHashMap::default(),
            region: FxHashSet::default(),
            promise_children: FxHashMap::default(),
            extra_children: Vec::new(),
            installed_env: None,
        }
    }

    fn lower_region(mut self) -> Result<Rc<Code>, RirError> {
        let order = self.version.rpo(self.entry);

        // Slot allocation: one local per value-producing instruction.
        let mut next_slot = 0;
        for &bb in &order {
            for &id in &self.version.bb(bb).instrs {
                self.region.insert(id);
                if !self.version.instr(id).ty.is_voyd() {
                    self.slots.insert(id, next_slot);
                    next_slot += 1;
                }
            }
        }
        for &bb in &order {
            let l = self.b.label();
            self.labels.insert(bb, l);
        }

        for (pos, &bb) in order.iter().enumerate() {
            let label = self.labels[&bb];
            self.b.bind(label);
            self.installed_env = None;
            let fallthrough = order.get(pos + 1).copied();
            self.lower_bb(bb, fallthrough)?;
        }

        self.b.set_locals(next_slot);
        let children = std::mem::take(&mut self.extra_children);
        for c in children {
            self.b.add_child(c);
        }
        // Specialized code objects carry no feedback of their own; the
        // baseline keeps recording.
        Ok(self.b.finish(self.src))
    }

    fn slot(&self, id: InstrId) -> Result<u32, RirError> {
        self.slots
            .get(&id)
            .copied()
            .ok_or_else(|| RirError::CannotCompile("use of unallocated value".into()))
    }

    /// Push a value onto the operand stack.
    fn load(&mut self, v: Val) -> Result<(), RirError> {
        match v {
            Val::Instr(id) => {
                if self.region.contains(&id) {
                    self.b.emit(BC::LdLoc(self.slot(id)?));
                } else if self.version.instr(id).ty == crate::pir::PirType::env() {
                    // A promise body sees its defining environment as the
                    // current environment.
                    self.b.emit(BC::GetEnv);
                } else {
                    return Err(RirError::CannotCompile(
                        "cross-region value reference".into(),
                    ));
                }
            }
            Val::MissingArg => {
                let idx = self.cp.insert(RVal::Missing);
                self.b.emit(BC::Push(idx));
            }
            Val::ElidedEnv => {
                return Err(RirError::CannotCompile(
                    "the elided environment has no runtime value".into(),
                ))
            }
        }
        Ok(())
    }

    /// Store the just-computed top of stack into the instruction's slot.
    fn store(&mut self, id: InstrId) -> Result<(), RirError> {
        self.b.emit(BC::StLoc(self.slot(id)?));
        Ok(())
    }

    /// Make `env` the interpreter's current environment.
    fn install_env(&mut self, env: Val) -> Result<(), RirError> {
        if matches!(env, Val::ElidedEnv) || self.installed_env == Some(env) {
            return Ok(());
        }
        self.load(env)?;
        self.b.emit(BC::SetEnv);
        self.installed_env = Some(env);
        Ok(())
    }

    fn sym_idx(&mut self, name: &rir_core::intern::Symbol) -> rir_core::pool::PoolIdx {
        self.cp.insert_sym(name.clone())
    }

    #[allow(clippy::too_many_lines)]
    fn lower_bb(&mut self, bb: BBId, fallthrough: Option<BBId>) -> Result<(), RirError> {
        let instrs = self.version.bb(bb).instrs.clone();
        for &id in &instrs {
            let instr = self.version.instr(id).clone();
            match &instr.kind {
                InstrKind::Phi { .. } => {} // written by predecessors

                InstrKind::LdConst(idx) => {
                    self.b.emit(BC::Push(*idx));
                    self.store(id)?;
                }
                InstrKind::LdFunEnv => {
                    self.b.emit(BC::ParentEnv);
                    self.store(id)?;
                }
                InstrKind::LdArg(i) => {
                    self.b.emit(BC::LdArg(*i));
                    self.store(id)?;
                }
                InstrKind::LdVar { name, env } => {
                    self.install_env(*env)?;
                    let idx = self.sym_idx(name);
                    self.b.emit(BC::LdVarNoForce(idx));
                    self.store(id)?;
                }
                InstrKind::LdVarSuper { name, env } => {
                    self.install_env(*env)?;
                    let idx = self.sym_idx(name);
                    self.b.emit(BC::LdVarSuper(idx));
                    self.store(id)?;
                }
                InstrKind::LdFun { name, env } => {
                    self.install_env(*env)?;
                    let idx = self.sym_idx(name);
                    self.b.emit(BC::LdFun(idx));
                    self.store(id)?;
                }
                InstrKind::StVar { name, val, env } => {
                    self.install_env(*env)?;
                    self.load(*val)?;
                    let idx = self.sym_idx(name);
                    self.b.emit(BC::StVar(idx));
                }
                InstrKind::StVarSuper { name, val, env } => {
                    self.install_env(*env)?;
                    self.load(*val)?;
                    let idx = self.sym_idx(name);
                    self.b.emit(BC::StVarSuper(idx));
                }
                InstrKind::Missing { name, env } => {
                    self.install_env(*env)?;
                    let idx = self.sym_idx(name);
                    self.b.emit(BC::Missing(idx));
                    self.store(id)?;
                }
                InstrKind::Force { val } => {
                    self.load(*val)?;
                    self.b.emit(BC::Force);
                    self.store(id)?;
                }
                InstrKind::CastType { val, to } => {
                    self.load(*val)?;
                    if !to.maybe_promise() && self.version.type_of(*val).maybe_promise() {
                        self.b.emit(BC::Force);
                    }
                    self.store(id)?;
                }
                InstrKind::CheckMissing(val) => {
                    self.load(*val)?;
                    self.b.emit(BC::CheckMissing);
                    self.b.emit(BC::Pop);
                }
                InstrKind::MkArg { prom, env, .. } => {
                    self.install_env(*env)?;
                    let child = self.promise_children.get(&prom.0).copied().ok_or_else(|| {
                        RirError::CannotCompile("promise lowered out of order".into())
                    })?;
                    self.b.emit(BC::MkPromise(child));
                    self.store(id)?;
                }
                InstrKind::MkCls { proto, env } => {
                    self.install_env(*env)?;
                    self.b.emit(BC::Push(*proto));
                    self.b.emit(BC::Close);
                    self.store(id)?;
                }
                InstrKind::MkEnv {
                    parent,
                    names,
                    values,
                } => {
                    for v in values {
                        self.load(*v)?;
                    }
                    self.load(*parent)?;
                    let name_strs: Vec<Rc<str>> =
                        names.iter().map(|n| n.as_str().into()).collect();
                    let names_idx = self
                        .cp
                        .insert(RVal::Str(Rc::new(RVec::from_vec(name_strs))));
                    self.b.emit(BC::MkEnv {
                        names: names_idx,
                        nargs: values.len() as u32,
                    });
                    self.store(id)?;
                }
                InstrKind::Binop {
                    op,
                    lhs,
                    rhs,
                    env,
                    src,
                } => {
                    self.install_env(*env)?;
                    self.load(*lhs)?;
                    self.load(*rhs)?;
                    self.b.emit_src(binop_bc(*op), *src);
                    self.store(id)?;
                }
                InstrKind::Unop { op, val, env, src } => {
                    self.install_env(*env)?;
                    self.load(*val)?;
                    let bc = match op {
                        UnopKind::Not => BC::Not,
                        UnopKind::Plus => BC::UPlus,
                        UnopKind::Minus => BC::UMinus,
                    };
                    self.b.emit_src(bc, *src);
                    self.store(id)?;
                }
                InstrKind::IsObject(v) => {
                    self.load(*v)?;
                    self.b.emit(BC::IsObj);
                    self.store(id)?;
                }
                InstrKind::Identical(a, b) => {
                    self.load(*a)?;
                    self.load(*b)?;
                    self.b.emit(BC::Identical);
                    self.store(id)?;
                }
                InstrKind::Is { type_tag, val } => {
                    self.load(*val)?;
                    self.b.emit(BC::Is(*type_tag));
                    self.store(id)?;
                }
                InstrKind::Call {
                    callee,
                    args,
                    env,
                    ast,
                } => {
                    self.install_env(*env)?;
                    self.load(*callee)?;
                    for a in args {
                        self.load(*a)?;
                    }
                    self.b.emit(BC::Call {
                        nargs: args.len() as u32,
                        ast: *ast,
                    });
                    self.store(id)?;
                }
                InstrKind::NamedCall {
                    callee,
                    args,
                    names,
                    env,
                    ast,
                } => {
                    self.install_env(*env)?;
                    self.load(*callee)?;
                    for a in args {
                        self.load(*a)?;
                    }
                    self.b.emit(BC::NamedCall {
                        nargs: args.len() as u32,
                        ast: *ast,
                        names: *names,
                    });
                    self.store(id)?;
                }
                InstrKind::StaticCall {
                    callee, args, env, ast,
                } => {
                    self.install_env(*env)?;
                    for a in args {
                        self.load(*a)?;
                    }
                    self.b.emit(BC::StaticCall {
                        nargs: args.len() as u32,
                        ast: *ast,
                        target: *callee,
                    });
                    self.store(id)?;
                }
                InstrKind::CallBuiltin {
                    builtin,
                    args,
                    env,
                    ast,
                } => {
                    self.install_env(*env)?;
                    for a in args {
                        self.load(*a)?;
                    }
                    let target = self.cp.insert(RVal::Builtin(*builtin));
                    self.b.emit(BC::StaticCall {
                        nargs: args.len() as u32,
                        ast: *ast,
                        target,
                    });
                    self.store(id)?;
                }
                InstrKind::CallSafeBuiltin { builtin, args, ast } => {
                    for a in args {
                        self.load(*a)?;
                    }
                    let target = self.cp.insert(RVal::Builtin(*builtin));
                    self.b.emit(BC::StaticCall {
                        nargs: args.len() as u32,
                        ast: *ast,
                        target,
                    });
                    self.store(id)?;
                }

                InstrKind::Jump => {
                    let succ = self.version.bb(bb).succs[0];
                    self.emit_phi_moves(bb, succ)?;
                    if fallthrough != Some(succ) {
                        let l = self.labels[&succ];
                        self.b.br(l);
                    }
                }
                InstrKind::Branch(cond) => {
                    let succs = &self.version.bb(bb).succs;
                    let (on_true, on_false) = (succs[0], succs[1]);
                    debug_assert!(
                        !self.has_phis(on_true) && !self.has_phis(on_false),
                        "critical edge into a phi block"
                    );
                    self.load(*cond)?;
                    let lt = self.labels[&on_true];
                    self.b.br_true(lt);
                    if fallthrough != Some(on_false) {
                        let lf = self.labels[&on_false];
                        self.b.br(lf);
                    }
                }
                InstrKind::Return(v) => {
                    self.load(*v)?;
                    self.b.emit(BC::Ret);
                }
                InstrKind::Deopt { pc, env, stack } => {
                    for v in stack {
                        self.load(*v)?;
                    }
                    self.load(*env)?;
                    let meta = DeoptMetadata::new(vec![FrameInfo {
                        code_ref: self.code_ref,
                        pc: *pc,
                        stack_size: stack.len() as u32,
                    }]);
                    let idx = self
                        .cp
                        .insert(RVal::Raw(Rc::new(meta.serialize())));
                    self.b.emit(BC::Deopt(idx));
                }
            }
        }
        Ok(())
    }

    fn has_phis(&self, bb: BBId) -> bool {
        self.version
            .bb(bb)
            .instrs
            .first()
            .is_some_and(|id| self.version.instr(*id).is_phi())
    }

    /// Store this predecessor's phi inputs into the phi slots.
    fn emit_phi_moves(&mut self, from: BBId, to: BBId) -> Result<(), RirError> {
        let instrs = self.version.bb(to).instrs.clone();
        for id in instrs {
            let InstrKind::Phi { inputs } = &self.version.instr(id).kind else {
                break; // phis lead the block
            };
            let Some((_, v)) = inputs.iter().find(|(pred, _)| *pred == from) else {
                continue;
            };
            let v = *v;
            let dst = self.slot(id)?;
            // Local-to-local transfers skip the operand stack.
            if let Val::Instr(src) = v {
                if self.region.contains(&src) {
                    let src = self.slot(src)?;
                    if src != dst {
                        self.b.emit(BC::MovLoc(src, dst));
                    }
                    continue;
                }
            }
            self.load(v)?;
            self.b.emit(BC::StLoc(dst));
        }
        Ok(())
    }
}

fn binop_bc(op: BinopKind) -> BC {
    match op {
        BinopKind::Add => BC::Add,
        BinopKind::Sub => BC::Sub,
        BinopKind::Mul => BC::Mul,
        BinopKind::Div => BC::Div,
        BinopKind::IDiv => BC::IDiv,
        BinopKind::Mod => BC::Mod,
        BinopKind::Pow => BC::Pow,
        BinopKind::Eq => BC::Eq,
        BinopKind::Ne => BC::Ne,
        BinopKind::Lt => BC::Lt,
        BinopKind::Le => BC::Le,
        BinopKind::Gt => BC::Gt,
        BinopKind::Ge => BC::Ge,
        BinopKind::LglAnd => BC::LglAnd,
        BinopKind::LglOr => BC::LglOr,
    }
}
