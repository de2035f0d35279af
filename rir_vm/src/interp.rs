//! The threaded bytecode interpreter.
//!
//! A dense decode-and-match loop over the variable-length instruction
//! stream. Each invocation owns a locals array and a small direct-mapped
//! binding cache; the operand stack is shared through the context and
//! pre-grown to the code object's declared maximum.
//!
//! Deoptimization re-enters this loop in place: the `deopt_` handler swaps
//! the current code and program counter for the baseline's, consumes the
//! environment from the operand stack, and queues the remaining frames for
//! synthesis when the current one returns.

use crate::call::{do_call, CallArgs, CallContext, CallFrame};
use crate::deopt::SynthFrame;
use crate::{builtins, Interp};
use rir_compiler::bytecode::instruction::BC;
use rir_core::code::Code;
use rir_core::deopt::DeoptMetadata;
use rir_core::error::{RirError, Unwind};
use rir_core::pool::PoolIdx;
use rir_core::value::{
    integer_minus, integer_plus, integer_times, BindingCell, BuiltinId, Env, Promise, PromiseBody,
    RClosure, RVal, NA_LOGICAL,
};
use std::collections::VecDeque;
use std::rc::Rc;

// =============================================================================
// Binding cache
// =============================================================================

const BINDING_CACHE_SIZE: usize = 5;

/// Direct-mapped cache from constant-pool name index to the binding cell
/// last observed in the current environment. Flushed whenever the current
/// environment changes.
#[derive(Default)]
struct BindingCache {
    slots: [Option<(u32, BindingCell)>; BINDING_CACHE_SIZE],
}

impl BindingCache {
    fn flush(&mut self) {
        self.slots = Default::default();
    }

    /// The binding cell for `idx` in `env`'s own frame, if any.
    fn cell(&mut self, interp: &Interp, env: &Env, idx: PoolIdx) -> Option<BindingCell> {
        let slot = idx.0 as usize % BINDING_CACHE_SIZE;
        if let Some((cached_idx, cell)) = &self.slots[slot] {
            if *cached_idx == idx.0 {
                return Some(Rc::clone(cell));
            }
        }
        let name = interp.cp.get_sym(idx);
        let cell = env.local_cell(name)?;
        self.slots[slot] = Some((idx.0, Rc::clone(&cell)));
        Some(cell)
    }
}

// =============================================================================
// Promise forcing
// =============================================================================

/// Force a value to a non-promise, evaluating lazily as needed.
pub fn force_value(interp: &mut Interp, v: RVal) -> Result<RVal, Unwind> {
    match v {
        RVal::Promise(p) => force_promise(interp, &p),
        other => Ok(other),
    }
}

/// Evaluate a promise, memoizing the result.
pub fn force_promise(interp: &mut Interp, prom: &Rc<Promise>) -> Result<RVal, Unwind> {
    if let Some(v) = prom.value() {
        return Ok(v);
    }
    if !prom.begin_force() {
        return Err(Unwind::Error(RirError::PromiseCycle));
    }
    let env = prom.env.borrow().clone();
    let result = match (&prom.body, env) {
        (PromiseBody::Code(code), Some(env)) => {
            let mut env = Some(env);
            eval(interp, code, &mut env, None, 0)
        }
        (PromiseBody::Ast(ast), Some(env)) => {
            let compiled = rir_compiler::compile::Compiler::new(&mut interp.cp, &mut interp.sp)
                .compile_expression(&ast.clone())
                .map_err(Unwind::Error)?;
            let mut env = Some(env);
            eval(interp, &compiled.body, &mut env, None, 0)
        }
        (_, None) => Err(Unwind::Error(RirError::PromiseCycle)),
    };
    match result {
        Ok(v) => {
            // Promises can nest; the memoized value is always forced.
            let v = force_value(interp, v)?;
            prom.fulfill(v.clone());
            Ok(v)
        }
        Err(e) => {
            prom.abort_force();
            Err(e)
        }
    }
}

// =============================================================================
// Loop contexts
// =============================================================================

/// A scoped loop context: where `break` and `next` land, and how deep the
/// operand stack was when the context was entered.
struct LoopCtx {
    head_pc: usize,
    exit_pc: usize,
    depth: usize,
}

/// Route a non-local exit to the innermost loop context, or propagate.
fn catch_unwind(
    loops: &mut Vec<LoopCtx>,
    ostack: &mut crate::ostack::OStack,
    unwind: Unwind,
) -> Result<usize, Unwind> {
    match unwind {
        Unwind::LoopBreak => {
            let ctx = loops.pop().ok_or(Unwind::LoopBreak)?;
            ostack.truncate(ctx.depth);
            Ok(ctx.exit_pc)
        }
        Unwind::LoopNext => {
            let ctx = loops.last().ok_or(Unwind::LoopNext)?;
            ostack.truncate(ctx.depth);
            Ok(ctx.head_pc)
        }
        e => Err(e),
    }
}

// =============================================================================
// The interpreter
// =============================================================================

/// Execute `code` in `env`. `env` may start as `None` when the code
/// object materializes its own environment (specialized code); deopt
/// installs a replacement in place.
#[allow(clippy::too_many_lines)]
pub fn eval(
    interp: &mut Interp,
    code: &Rc<Code>,
    env: &mut Option<Env>,
    frame: Option<&CallFrame>,
    initial_pc: u32,
) -> Result<RVal, Unwind> {
    let mut code = Rc::clone(code);
    let mut pc = initial_pc as usize;
    let mut locals: Vec<RVal> = vec![RVal::Null; code.locals_count as usize];
    let mut bcache = BindingCache::default();
    let mut loops: Vec<LoopCtx> = Vec::new();
    let mut synthesize: VecDeque<SynthFrame> = VecDeque::new();

    interp.ostack.ensure_size(code.max_stack as usize);
    interp.visible = true;

    macro_rules! cur_env {
        () => {
            env.as_ref()
                .ok_or_else(|| Unwind::Error(RirError::Host("no environment".into())))?
        };
    }

    loop {
        let (bc, next) = BC::decode(&code.bc, pc).map_err(Unwind::Error)?;
        let this_pc = pc as u32;
        pc = next;

        match bc {
            BC::Nop => {}
            BC::Invisible => interp.visible = false,
            BC::Visible => interp.visible = true,

            // -- stack shuffling ---------------------------------------------
            BC::Push(idx) => interp.ostack.push(interp.cp.get(idx).clone()),
            BC::Pop => {
                interp.ostack.pop();
            }
            BC::Dup => interp.ostack.push(interp.ostack.top().clone()),
            BC::Dup2 => {
                interp.ostack.push(interp.ostack.at(1).clone());
                interp.ostack.push(interp.ostack.at(1).clone());
            }
            BC::Swap => {
                let a = interp.ostack.pop();
                let b = interp.ostack.pop();
                interp.ostack.push(a);
                interp.ostack.push(b);
            }
            BC::Pull(i) => interp.ostack.push(interp.ostack.at(i as usize).clone()),
            BC::Pick(n) => {
                let n = n as usize;
                let x = interp.ostack.at(n).clone();
                for i in (1..=n).rev() {
                    let below = interp.ostack.at(i - 1).clone();
                    interp.ostack.set(i, below);
                }
                interp.ostack.set(0, x);
            }
            BC::Put(n) => {
                let n = n as usize;
                let x = interp.ostack.top().clone();
                for i in 0..n {
                    let above = interp.ostack.at(i + 1).clone();
                    interp.ostack.set(i, above);
                }
                interp.ostack.set(n, x);
            }

            // -- locals -------------------------------------------------------
            BC::LdLoc(i) => interp.ostack.push(locals[i as usize].clone()),
            BC::StLoc(i) => locals[i as usize] = interp.ostack.pop(),
            BC::MovLoc(from, to) => locals[to as usize] = locals[from as usize].clone(),

            // -- variables ----------------------------------------------------
            BC::LdVar(idx) => {
                let v = get_var(interp, &mut bcache, cur_env!(), idx)?;
                let v = match v {
                    RVal::Promise(p) => force_promise(interp, &p)?,
                    RVal::Missing => {
                        let name = interp.cp.get_sym(idx).clone();
                        return Err(Unwind::Error(RirError::MissingArgument(name)));
                    }
                    v => v,
                };
                interp.ostack.push(v);
            }
            BC::LdVarNoForce(idx) => {
                let v = get_var(interp, &mut bcache, cur_env!(), idx)?;
                interp.ostack.push(v);
            }
            BC::LdVarSuper(idx) => {
                let name = interp.cp.get_sym(idx).clone();
                let parent = cur_env!()
                    .parent()
                    .ok_or_else(|| Unwind::Error(RirError::UnboundVariable(name.clone())))?;
                let v = parent
                    .get(&name)
                    .ok_or(Unwind::Error(RirError::UnboundVariable(name)))?;
                interp.ostack.push(v);
            }
            BC::StVar(idx) => {
                let v = interp.ostack.pop();
                set_var(interp, &mut bcache, cur_env!(), idx, v);
            }
            BC::StVarSuper(idx) => {
                let v = interp.ostack.pop();
                let name = interp.cp.get_sym(idx).clone();
                cur_env!().set_super(name, v);
            }
            BC::LdArg(i) => {
                let frame = frame.ok_or_else(|| {
                    Unwind::Error(RirError::Host("ldarg outside a call".into()))
                })?;
                interp.ostack.push(frame.args[i as usize].clone());
            }
            BC::LdFun(idx) => {
                let v = find_fun(interp, cur_env!(), idx)?;
                interp.ostack.push(v);
            }
            BC::LdDdVar(_) => {
                return Err(Unwind::Error(RirError::Host(
                    "'...' used in an incorrect context".into(),
                )))
            }
            BC::Missing(idx) => {
                let name = interp.cp.get_sym(idx).clone();
                let missing = match cur_env!().local_cell(&name) {
                    Some(cell) => {
                        let b = cell.borrow();
                        b.missing || matches!(b.value, RVal::Missing)
                    }
                    None => true,
                };
                interp.ostack.push(RVal::lgl(missing));
            }
            BC::CheckMissing => {
                if matches!(interp.ostack.top(), RVal::Missing) {
                    return Err(Unwind::Error(RirError::Host(
                        "argument is missing, with no default".into(),
                    )));
                }
            }

            // -- control ------------------------------------------------------
            BC::Br(_) => pc = bc.jmp_target(next).unwrap(),
            BC::BrTrue(_) | BC::BrFalse(_) => {
                let v = interp.ostack.pop();
                let cond = v
                    .as_condition()
                    .ok_or(Unwind::Error(RirError::BadCondition))?;
                let jump = matches!(bc, BC::BrTrue(_)) == cond;
                if jump {
                    pc = bc.jmp_target(next).unwrap();
                }
            }
            BC::BeginLoop(_) => {
                loops.push(LoopCtx {
                    head_pc: next,
                    exit_pc: bc.jmp_target(next).unwrap(),
                    depth: interp.ostack.len(),
                });
            }
            BC::EndContext => {
                loops.pop();
            }
            BC::Ret => {
                // Drain one synthesized frame, if a deopt queued any.
                match synthesize.pop_front() {
                    None => return Ok(interp.ostack.pop()),
                    Some(f) => {
                        let res = interp.ostack.pop();
                        let e = match interp.ostack.pop() {
                            RVal::Env(e) => e,
                            _ => return Err(Unwind::Error(RirError::BadDeoptMetadata)),
                        };
                        *env = Some(e);
                        interp.ostack.push(res);
                        if let Some(fun) = f.code.function() {
                            fun.register_invocation();
                        }
                        code = f.code;
                        pc = f.pc as usize;
                        locals = vec![RVal::Null; code.locals_count as usize];
                        bcache.flush();
                        interp.ostack.ensure_size(code.max_stack as usize);
                    }
                }
            }
            BC::Deopt(idx) => {
                let RVal::Raw(blob) = interp.cp.get(idx) else {
                    return Err(Unwind::Error(RirError::BadDeoptMetadata));
                };
                let meta = DeoptMetadata::deserialize(blob).map_err(Unwind::Error)?;
                let anchor = code
                    .function()
                    .and_then(|f| f.baseline_code())
                    .unwrap_or_else(|| Rc::clone(&code));
                for f in &meta.frames[1..] {
                    let fcode =
                        DeoptMetadata::resolve_code(&anchor, f.code_ref).map_err(Unwind::Error)?;
                    synthesize.push_back(SynthFrame {
                        code: fcode,
                        pc: f.pc,
                    });
                }
                let f0 = &meta.frames[0];
                let target =
                    DeoptMetadata::resolve_code(&anchor, f0.code_ref).map_err(Unwind::Error)?;
                if let Some(fun) = target.function() {
                    fun.register_invocation();
                }
                let e = match interp.ostack.pop() {
                    RVal::Env(e) => e,
                    _ => return Err(Unwind::Error(RirError::BadDeoptMetadata)),
                };
                *env = Some(e);
                code = target;
                pc = f0.pc as usize;
                locals = vec![RVal::Null; code.locals_count as usize];
                bcache.flush();
                interp.ostack.ensure_size(code.max_stack as usize);
            }

            // -- environments -------------------------------------------------
            BC::MkEnv { names, nargs } => {
                let parent = match interp.ostack.pop() {
                    RVal::Env(e) => e,
                    other => {
                        return Err(Unwind::Error(RirError::Host(format!(
                            "invalid environment parent: {}",
                            other.type_name()
                        ))))
                    }
                };
                let values = interp.ostack.popn(nargs as usize);
                let new_env = Env::new(Some(parent));
                let RVal::Str(name_vec) = interp.cp.get(names).clone() else {
                    return Err(Unwind::Error(RirError::Host(
                        "malformed environment name table".into(),
                    )));
                };
                for (name, value) in name_vec.data.iter().zip(values) {
                    new_env.define(rir_core::intern::sym(name), value);
                }
                interp.ostack.push(RVal::Env(new_env));
            }
            BC::GetEnv => {
                let e = cur_env!().clone();
                interp.ostack.push(RVal::Env(e));
            }
            BC::SetEnv => {
                let e = match interp.ostack.pop() {
                    RVal::Env(e) => e,
                    other => {
                        return Err(Unwind::Error(RirError::Host(format!(
                            "set_env on {}",
                            other.type_name()
                        ))))
                    }
                };
                *env = Some(e);
                bcache.flush();
            }
            BC::ParentEnv => {
                let frame = frame.ok_or_else(|| {
                    Unwind::Error(RirError::Host("parent_env outside a call".into()))
                })?;
                interp.ostack.push(RVal::Env(frame.callee_env.clone()));
            }

            // -- promises and closures ---------------------------------------
            BC::MkPromise(child) => {
                let e = cur_env!().clone();
                let p = Promise::new(PromiseBody::Code(code.child(child)), e);
                interp.ostack.push(RVal::Promise(Rc::new(p)));
            }
            BC::Force => {
                let v = interp.ostack.pop();
                match force_value(interp, v) {
                    Ok(v) => interp.ostack.push(v),
                    Err(u) => {
                        pc = catch_unwind(&mut loops, &mut interp.ostack, u)?;
                    }
                }
            }
            BC::Close => {
                let proto = match interp.ostack.pop() {
                    RVal::Closure(c) => c,
                    other => {
                        return Err(Unwind::Error(RirError::Host(format!(
                            "close on {}",
                            other.type_name()
                        ))))
                    }
                };
                let body = match &*proto.body.borrow() {
                    rir_core::value::ClosureBody::Compiled(dt) => {
                        rir_core::value::ClosureBody::Compiled(Rc::clone(dt))
                    }
                    rir_core::value::ClosureBody::Ast(a) => {
                        rir_core::value::ClosureBody::Ast(a.clone())
                    }
                };
                let cls = RClosure {
                    formals: proto.formals.clone(),
                    body: std::cell::RefCell::new(body),
                    env: cur_env!().clone(),
                };
                interp.ostack.push(RVal::Closure(Rc::new(cls)));
            }

            // -- feedback -----------------------------------------------------
            BC::RecordCall(slot) => {
                code.feedback[slot as usize].call().record(interp.ostack.top());
            }
            BC::RecordBinop(slot) => {
                let fb = code.feedback[slot as usize].binop();
                fb[0].record(interp.ostack.at(1));
                fb[1].record(interp.ostack.at(0));
            }

            // -- calls --------------------------------------------------------
            BC::CallImplicit { ast, ref args } | BC::NamedCallImplicit { ast, ref args, .. } => {
                let names = match &bc {
                    BC::NamedCallImplicit { names, .. } => match interp.cp.get(*names).clone() {
                        RVal::Str(v) => Some(v),
                        _ => None,
                    },
                    _ => None,
                };
                let callee = interp.ostack.pop();
                let call = CallContext {
                    callee,
                    ast_idx: ast,
                    names,
                    args: CallArgs::Implicit {
                        codes: args.to_vec(),
                        owner: Rc::clone(&code),
                    },
                    caller_env: cur_env!().clone(),
                };
                match do_call(interp, call) {
                    Ok(v) => interp.ostack.push(v),
                    Err(u) => pc = catch_unwind(&mut loops, &mut interp.ostack, u)?,
                }
            }
            BC::Call { nargs, ast } | BC::NamedCall { nargs, ast, .. } => {
                let names = match &bc {
                    BC::NamedCall { names, .. } => match interp.cp.get(*names).clone() {
                        RVal::Str(v) => Some(v),
                        _ => None,
                    },
                    _ => None,
                };
                let args = interp.ostack.popn(nargs as usize);
                let callee = interp.ostack.pop();
                let call = CallContext {
                    callee,
                    ast_idx: ast,
                    names,
                    args: CallArgs::Stack(args),
                    caller_env: cur_env!().clone(),
                };
                match do_call(interp, call) {
                    Ok(v) => interp.ostack.push(v),
                    Err(u) => pc = catch_unwind(&mut loops, &mut interp.ostack, u)?,
                }
            }
            BC::StaticCall { nargs, ast, target } => {
                let args = interp.ostack.popn(nargs as usize);
                let callee = interp.cp.get(target).clone();
                // Specialized code may run without an installed environment;
                // safe builtins are exactly the calls that tolerate that.
                let caller_env = env.clone().unwrap_or_else(|| interp.global_env.clone());
                let call = CallContext {
                    callee,
                    ast_idx: ast,
                    names: None,
                    args: CallArgs::Stack(args),
                    caller_env,
                };
                match do_call(interp, call) {
                    Ok(v) => interp.ostack.push(v),
                    Err(u) => pc = catch_unwind(&mut loops, &mut interp.ostack, u)?,
                }
            }

            // -- checks -------------------------------------------------------
            BC::IsObj => {
                let v = interp.ostack.pop();
                interp.ostack.push(RVal::lgl(v.is_object()));
            }
            BC::Identical => {
                let b = interp.ostack.pop();
                let a = interp.ostack.pop();
                interp.ostack.push(RVal::lgl(a.identical(&b)));
            }
            BC::Is(tag) => {
                let v = interp.ostack.pop();
                interp.ostack.push(RVal::lgl(type_tag_matches(tag, &v)));
            }

            // -- arithmetic ---------------------------------------------------
            BC::Add | BC::Sub | BC::Mul | BC::Div => {
                binop_arith(interp, &code, this_pc, &bc)?;
            }
            BC::IDiv | BC::Mod | BC::Pow => {
                let rhs = interp.ostack.pop();
                let lhs = interp.ostack.pop();
                let op = arith_builtin_id(&bc);
                let call = call_src(interp, &code, this_pc);
                let v = builtins::arith(interp, op, &lhs, &rhs, call)?;
                interp.ostack.push(v);
            }
            BC::Eq | BC::Ne | BC::Lt | BC::Le | BC::Gt | BC::Ge => {
                binop_relop(interp, &bc)?;
            }
            BC::LglAnd | BC::LglOr => {
                let rhs = interp.ostack.pop();
                let lhs = interp.ostack.pop();
                let v = logical2(&bc, &lhs, &rhs)?;
                interp.ostack.push(v);
            }
            BC::Not => {
                let v = interp.ostack.pop();
                interp.ostack.push(builtins::not(&v)?);
            }
            BC::UPlus | BC::UMinus => {
                let v = interp.ostack.pop();
                let zero = RVal::int(0);
                let r = if matches!(bc, BC::UMinus) {
                    let call = call_src(interp, &code, this_pc);
                    builtins::arith(interp, BuiltinId::Sub, &zero, &v, call)?
                } else {
                    // Unary plus is the numeric identity.
                    match &v {
                        RVal::Int(_) | RVal::Real(_) | RVal::Lgl(_) => v,
                        other => {
                            return Err(Unwind::Error(RirError::Host(format!(
                                "invalid argument to unary operator: {}",
                                other.type_name()
                            ))))
                        }
                    }
                };
                interp.ostack.push(r);
            }
        }
    }
}

// =============================================================================
// Variable access
// =============================================================================

fn get_var(
    interp: &Interp,
    bcache: &mut BindingCache,
    env: &Env,
    idx: PoolIdx,
) -> Result<RVal, Unwind> {
    if let Some(cell) = bcache.cell(interp, env, idx) {
        let b = cell.borrow();
        if b.missing {
            return Ok(RVal::Missing);
        }
        return Ok(b.value.clone());
    }
    let name = interp.cp.get_sym(idx);
    env.get(name)
        .ok_or_else(|| Unwind::Error(RirError::UnboundVariable(name.clone())))
}

fn set_var(interp: &mut Interp, bcache: &mut BindingCache, env: &Env, idx: PoolIdx, v: RVal) {
    if let Some(cell) = bcache.cell(interp, env, idx) {
        let mut b = cell.borrow_mut();
        if !b.locked {
            b.value = v;
            b.missing = false;
            return;
        }
    }
    let name = interp.cp.get_sym(idx).clone();
    env.define(name, v);
}

/// Function lookup: walk the environment chain, skipping non-function
/// bindings, forcing promises along the way.
fn find_fun(interp: &mut Interp, env: &Env, idx: PoolIdx) -> Result<RVal, Unwind> {
    let name = interp.cp.get_sym(idx).clone();
    let mut cur = Some(env.clone());
    while let Some(e) = cur {
        if let Some(cell) = e.local_cell(&name) {
            let v = cell.borrow().value.clone();
            let v = force_value(interp, v)?;
            if v.is_function() {
                return Ok(v);
            }
        }
        cur = e.parent();
    }
    Err(Unwind::Error(RirError::UnboundFunction(name)))
}

// =============================================================================
// Fast-path arithmetic
// =============================================================================

fn arith_builtin_id(bc: &BC) -> BuiltinId {
    match bc {
        BC::Add => BuiltinId::Add,
        BC::Sub => BuiltinId::Sub,
        BC::Mul => BuiltinId::Mul,
        BC::Div => BuiltinId::Div,
        BC::IDiv => BuiltinId::IDiv,
        BC::Mod => BuiltinId::Mod,
        BC::Pow => BuiltinId::Pow,
        BC::Eq => BuiltinId::Eq,
        BC::Ne => BuiltinId::Ne,
        BC::Lt => BuiltinId::Lt,
        BC::Le => BuiltinId::Le,
        BC::Gt => BuiltinId::Gt,
        BC::Ge => BuiltinId::Ge,
        _ => unreachable!(),
    }
}

fn call_src(interp: &Interp, code: &Rc<Code>, pc: u32) -> Option<RVal> {
    let src = code.src_at(pc);
    if (src.0 as usize) < interp.sp.len() {
        Some(interp.sp.get(src).clone())
    } else {
        None
    }
}

/// Inline scalar arithmetic; anything else goes to the builtin.
fn binop_arith(
    interp: &mut Interp,
    code: &Rc<Code>,
    pc: u32,
    bc: &BC,
) -> Result<(), Unwind> {
    let rhs = interp.ostack.at(0).clone();
    let lhs = interp.ostack.at(1).clone();
    let div = matches!(bc, BC::Div);

    let fast = match (lhs.as_int_scalar(), rhs.as_int_scalar()) {
        (Some(x), Some(y)) if !div => {
            let mut naflag = false;
            let z = match bc {
                BC::Add => integer_plus(x, y, &mut naflag),
                BC::Sub => integer_minus(x, y, &mut naflag),
                BC::Mul => integer_times(x, y, &mut naflag),
                _ => unreachable!(),
            };
            if naflag {
                // One overflow warning per call site.
                let key = (code.addr(), pc);
                if interp.warned_overflow.insert(key) {
                    let call = call_src(interp, code, pc);
                    interp.warn("NAs produced by integer overflow", call);
                }
            }
            Some(RVal::int(z))
        }
        _ => {
            let lx = lhs
                .as_real_scalar()
                .or_else(|| lhs.as_int_scalar().map(int_as_real));
            let rx = rhs
                .as_real_scalar()
                .or_else(|| rhs.as_int_scalar().map(int_as_real));
            match (lx, rx) {
                (Some(x), Some(y)) => Some(RVal::real(match bc {
                    BC::Add => x + y,
                    BC::Sub => x - y,
                    BC::Mul => x * y,
                    BC::Div => x / y,
                    _ => unreachable!(),
                })),
                _ => None,
            }
        }
    };

    let result = match fast {
        Some(v) => v,
        None => {
            let op = arith_builtin_id(bc);
            let call = call_src(interp, code, pc);
            builtins::arith(interp, op, &lhs, &rhs, call)?
        }
    };
    interp.ostack.pop();
    interp.ostack.pop();
    interp.ostack.push(result);
    Ok(())
}

#[inline]
fn int_as_real(x: i32) -> f64 {
    if x == rir_core::value::NA_INTEGER {
        f64::NAN
    } else {
        f64::from(x)
    }
}

/// Inline scalar comparison; anything else goes to the builtin.
fn binop_relop(interp: &mut Interp, bc: &BC) -> Result<(), Unwind> {
    let rhs = interp.ostack.at(0).clone();
    let lhs = interp.ostack.at(1).clone();

    let fast = match (&lhs, &rhs) {
        (RVal::Lgl(_), RVal::Lgl(_)) => {
            match (lhs.as_lgl_scalar(), rhs.as_lgl_scalar()) {
                (Some(x), Some(y)) => {
                    if x == NA_LOGICAL || y == NA_LOGICAL {
                        Some(RVal::lgl_na())
                    } else {
                        Some(RVal::lgl(int_relop(bc, x, y)))
                    }
                }
                _ => None,
            }
        }
        _ => {
            let lx = lhs
                .as_real_scalar()
                .or_else(|| lhs.as_int_scalar().map(int_as_real));
            let rx = rhs
                .as_real_scalar()
                .or_else(|| rhs.as_int_scalar().map(int_as_real));
            match (lx, rx) {
                (Some(x), Some(y)) => {
                    if x.is_nan() || y.is_nan() {
                        Some(RVal::lgl_na())
                    } else {
                        Some(RVal::lgl(real_relop(bc, x, y)))
                    }
                }
                _ => None,
            }
        }
    };

    let result = match fast {
        Some(v) => v,
        None => builtins::relop(arith_builtin_id(bc), &lhs, &rhs)?,
    };
    interp.ostack.pop();
    interp.ostack.pop();
    interp.ostack.push(result);
    Ok(())
}

fn int_relop(bc: &BC, x: i32, y: i32) -> bool {
    match bc {
        BC::Eq => x == y,
        BC::Ne => x != y,
        BC::Lt => x < y,
        BC::Le => x <= y,
        BC::Gt => x > y,
        BC::Ge => x >= y,
        _ => unreachable!(),
    }
}

fn real_relop(bc: &BC, x: f64, y: f64) -> bool {
    match bc {
        BC::Eq => x == y,
        BC::Ne => x != y,
        BC::Lt => x < y,
        BC::Le => x <= y,
        BC::Gt => x > y,
        BC::Ge => x >= y,
        _ => unreachable!(),
    }
}

/// Scalar `&&` and `||` with three-valued logic.
fn logical2(bc: &BC, lhs: &RVal, rhs: &RVal) -> Result<RVal, Unwind> {
    let to3 = |v: &RVal| -> Result<Option<bool>, Unwind> {
        match v.as_lgl_scalar().or_else(|| {
            v.as_int_scalar()
                .map(|x| if x == rir_core::value::NA_INTEGER { NA_LOGICAL } else { (x != 0) as i32 })
        }) {
            Some(NA_LOGICAL) => Ok(None),
            Some(x) => Ok(Some(x != 0)),
            None => Err(Unwind::Error(RirError::Host(
                "invalid operand to logical operator".into(),
            ))),
        }
    };
    let (a, b) = (to3(lhs)?, to3(rhs)?);
    let and = matches!(bc, BC::LglAnd);
    let r = if and {
        match (a, b) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        }
    } else {
        match (a, b) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        }
    };
    Ok(match r {
        Some(b) => RVal::lgl(b),
        None => RVal::lgl_na(),
    })
}

/// Type tags for the `is_` check.
fn type_tag_matches(tag: u32, v: &RVal) -> bool {
    match tag {
        0 => matches!(v, RVal::Null),
        1 => matches!(v, RVal::Lgl(_)),
        2 => matches!(v, RVal::Int(_)),
        3 => matches!(v, RVal::Real(_)),
        4 => matches!(v, RVal::Str(_)),
        5 => matches!(v, RVal::Closure(_) | RVal::Builtin(_)),
        6 => matches!(v, RVal::Env(_)),
        _ => false,
    }
}
