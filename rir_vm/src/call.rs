//! Call contexts, argument adaptation, and the call trampoline.
//!
//! `do_call` is the single entry for every call instruction. Builtins get
//! eagerly evaluated arguments; closures get a lazy argument list and go
//! through `rir_call`, which selects a version, counts the invocation,
//! triggers the optimizer on the second baseline hit, and enters the
//! interpreter through a trampoline that restores the operand stack on
//! every exit path, including non-local ones.

use crate::{builtins, dispatch, interp, Interp};
use rir_core::error::{RirError, Unwind};
use rir_core::function::{Function, OPTIMIZE_THRESHOLD};
use rir_core::pool::PoolIdx;
use rir_core::value::{
    Binding, BuiltinId, Env, Promise, PromiseBody, RClosure, RVal, RVec,
};
use rir_core::code::Code;
use rir_compiler::bytecode::MISSING_ARG_IDX;
use std::cell::RefCell;
use std::rc::Rc;

/// How a call site supplies its arguments.
pub enum CallArgs {
    /// Evaluated values (or promises) already on the stack.
    Stack(Vec<RVal>),
    /// Promise codes in the immediates, children of `owner`.
    Implicit { codes: Vec<u32>, owner: Rc<Code> },
}

/// One call, as seen by the runtime.
pub struct CallContext {
    pub callee: RVal,
    pub ast_idx: PoolIdx,
    /// Argument names, empty string for positional, when the call is named.
    pub names: Option<Rc<RVec<Rc<str>>>>,
    pub args: CallArgs,
    pub caller_env: Env,
}

impl CallContext {
    #[must_use]
    pub fn nargs(&self) -> usize {
        match &self.args {
            CallArgs::Stack(v) => v.len(),
            CallArgs::Implicit { codes, .. } => codes.len(),
        }
    }

    fn name_at(&self, i: usize) -> Option<Rc<str>> {
        let names = self.names.as_ref()?;
        let n = names.data.get(i)?;
        if n.is_empty() {
            None
        } else {
            Some(Rc::clone(n))
        }
    }
}

/// The per-invocation context the interpreter sees.
pub struct CallFrame {
    /// Actual arguments in supplied order (promises unevaluated).
    pub args: Vec<RVal>,
    /// The callee closure's lexical environment.
    pub callee_env: Env,
}

/// Dispatch a call to its callee kind.
pub fn do_call(interp: &mut Interp, call: CallContext) -> Result<RVal, Unwind> {
    match call.callee.clone() {
        RVal::Builtin(id) => builtin_call(interp, id, call),
        RVal::Closure(cls) => rir_call(interp, call, &cls),
        _ => Err(Unwind::Error(RirError::NotAFunction)),
    }
}

/// Builtins evaluate their arguments eagerly, in order.
fn builtin_call(interp: &mut Interp, id: BuiltinId, call: CallContext) -> Result<RVal, Unwind> {
    let mut values = Vec::with_capacity(call.nargs());
    match &call.args {
        CallArgs::Stack(args) => {
            for v in args {
                values.push(interp::force_value(interp, v.clone())?);
            }
        }
        CallArgs::Implicit { codes, owner } => {
            for &c in codes {
                if c == MISSING_ARG_IDX {
                    return Err(Unwind::Error(RirError::Host(format!(
                        "argument missing in call to '{}'",
                        id.name()
                    ))));
                }
                let code = owner.child(c);
                let mut env = Some(call.caller_env.clone());
                values.push(interp::eval(interp, &code, &mut env, None, 0)?);
            }
        }
    }
    let ast = interp.cp.get(call.ast_idx).clone();
    builtins::call_builtin(interp, id, values, Some(ast))
}

/// Call a front-compiled closure, selecting a version from its table.
fn rir_call(interp: &mut Interp, call: CallContext, cls: &Rc<RClosure>) -> Result<RVal, Unwind> {
    // An uncompiled closure is compiled on first call; this engine is the
    // host's evaluator for closures too.
    let dt = match cls.dispatch_table() {
        Some(dt) => dt,
        None => {
            let closure = RVal::Closure(Rc::clone(cls));
            rir_compiler::compile::Compiler::new(&mut interp.cp, &mut interp.sp)
                .compile_closure(&closure)
                .map_err(Unwind::Error)?
        }
    };

    let inferred = dispatch::infer_assumptions(&call);
    let (mut slot, mut fun) = dt.dispatch(&inferred);
    fun.register_invocation();

    if slot == 0
        && (fun.invocation_count() == OPTIMIZE_THRESHOLD || fun.mark_opt.get())
        && interp.optimizer.is_some()
    {
        let name = call_name(interp, call.ast_idx);
        let hook = interp.optimizer.unwrap();
        hook(interp, &call.callee, name.as_ref());
        (slot, fun) = dt.dispatch(&inferred);
    }

    let arglist = build_arglist(&call);
    let frame = CallFrame {
        args: arglist.iter().map(|(_, v)| v.clone()).collect(),
        callee_env: cls.env.clone(),
    };

    let env = if slot == 0 {
        Some(closure_argument_adaptor(cls, &fun, arglist)?)
    } else {
        None
    };
    let result = call_trampoline(interp, &fun, env, &frame);
    debug_assert!(result.is_err() || !fun.deopt.get());
    result
}

/// The symbol in call position, for optimizer diagnostics.
fn call_name(interp: &Interp, ast_idx: PoolIdx) -> Option<rir_core::intern::Symbol> {
    match interp.cp.get(ast_idx) {
        RVal::Lang(l) => match &l.fun {
            RVal::Sym(s) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// The lazy argument list: promises for implicit arguments, values as-is
/// for stack arguments.
fn build_arglist(call: &CallContext) -> Vec<(Option<Rc<str>>, RVal)> {
    let mut out = Vec::with_capacity(call.nargs());
    match &call.args {
        CallArgs::Stack(args) => {
            for (i, v) in args.iter().enumerate() {
                out.push((call.name_at(i), v.clone()));
            }
        }
        CallArgs::Implicit { codes, owner } => {
            for (i, &c) in codes.iter().enumerate() {
                let v = if c == MISSING_ARG_IDX {
                    RVal::Missing
                } else {
                    RVal::Promise(Rc::new(Promise::new(
                        PromiseBody::Code(owner.child(c)),
                        call.caller_env.clone(),
                    )))
                };
                out.push((call.name_at(i), v));
            }
        }
    }
    out
}

/// Match actuals to formals (exact names, then position) and build the
/// callee frame. Unmatched formals get their default promise or a missing
/// binding.
fn closure_argument_adaptor(
    cls: &Rc<RClosure>,
    fun: &Rc<Function>,
    arglist: Vec<(Option<Rc<str>>, RVal)>,
) -> Result<Env, Unwind> {
    let env = Env::new(Some(cls.env.clone()));
    let nformals = cls.formals.len();
    let mut bound = vec![false; nformals];
    let mut positional: Vec<RVal> = Vec::new();

    for (name, value) in arglist {
        match name {
            Some(name) => {
                let pos = cls
                    .formals
                    .iter()
                    .position(|f| f.name.as_str() == name.as_ref());
                match pos {
                    Some(i) if !bound[i] => {
                        bound[i] = true;
                        env.define(cls.formals[i].name.clone(), value);
                    }
                    _ => {
                        return Err(Unwind::Error(RirError::Host(format!(
                            "unused argument ({name})"
                        ))))
                    }
                }
            }
            None => positional.push(value),
        }
    }

    let mut next = 0;
    for value in positional {
        while next < nformals && bound[next] {
            next += 1;
        }
        if next >= nformals {
            return Err(Unwind::Error(RirError::Host("unused argument".into())));
        }
        bound[next] = true;
        if matches!(value, RVal::Missing) {
            env.define_cell(
                cls.formals[next].name.clone(),
                Rc::new(RefCell::new(Binding::missing_arg())),
            );
        } else {
            env.define(cls.formals[next].name.clone(), value);
        }
    }

    for (i, formal) in cls.formals.iter().enumerate() {
        if bound[i] {
            continue;
        }
        match fun.defaults.get(i).and_then(Clone::clone) {
            Some(code) => {
                // Default promises evaluate in the callee frame itself.
                let p = Promise::new(PromiseBody::Code(code), env.clone());
                env.define(formal.name.clone(), RVal::Promise(Rc::new(p)));
            }
            None => {
                env.define_cell(
                    formal.name.clone(),
                    Rc::new(RefCell::new(Binding::missing_arg())),
                );
            }
        }
    }
    Ok(env)
}

/// Enter the interpreter on a function body, restoring the operand stack
/// depth on every exit, including errors and non-local jumps.
pub fn call_trampoline(
    interp: &mut Interp,
    fun: &Rc<Function>,
    env: Option<Env>,
    frame: &CallFrame,
) -> Result<RVal, Unwind> {
    let depth = interp.ostack.len();
    let mut env = env;
    let result = interp::eval(interp, &fun.body, &mut env, Some(frame), 0);
    if result.is_err() {
        interp.ostack.truncate(depth);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rir_core::value::{ClosureBody, Formal};

    fn closure_with_formals(formals: Vec<Formal>) -> Rc<RClosure> {
        Rc::new(RClosure {
            formals,
            body: RefCell::new(ClosureBody::Ast(RVal::Null)),
            env: Env::new(None),
        })
    }

    fn formal(name: &str) -> Formal {
        Formal {
            name: rir_core::intern::sym(name),
            default: None,
        }
    }

    fn dummy_fun(ndefaults: usize) -> Rc<Function> {
        let code = Code::new(
            vec![0],
            rir_core::pool::SrcIdx(0),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            1,
            0,
        );
        Function::new(
            code,
            vec![None; ndefaults],
            rir_core::function::FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            rir_core::assumptions::OptimizationContext::base(),
        )
    }

    #[test]
    fn test_positional_matching() {
        let cls = closure_with_formals(vec![formal("a"), formal("b")]);
        let env = closure_argument_adaptor(
            &cls,
            &dummy_fun(2),
            vec![(None, RVal::int(1)), (None, RVal::int(2))],
        )
        .unwrap();
        assert_eq!(env.get(&rir_core::intern::sym("a")).unwrap().as_int_scalar(), Some(1));
        assert_eq!(env.get(&rir_core::intern::sym("b")).unwrap().as_int_scalar(), Some(2));
    }

    #[test]
    fn test_named_matching_reorders() {
        let cls = closure_with_formals(vec![formal("a"), formal("b")]);
        let env = closure_argument_adaptor(
            &cls,
            &dummy_fun(2),
            vec![
                (Some("b".into()), RVal::int(2)),
                (None, RVal::int(1)),
            ],
        )
        .unwrap();
        assert_eq!(env.get(&rir_core::intern::sym("a")).unwrap().as_int_scalar(), Some(1));
        assert_eq!(env.get(&rir_core::intern::sym("b")).unwrap().as_int_scalar(), Some(2));
    }

    #[test]
    fn test_unmatched_formal_is_missing() {
        let cls = closure_with_formals(vec![formal("a")]);
        let env = closure_argument_adaptor(&cls, &dummy_fun(1), vec![]).unwrap();
        let cell = env.local_cell(&rir_core::intern::sym("a")).unwrap();
        assert!(cell.borrow().missing);
    }

    #[test]
    fn test_excess_argument_rejected() {
        let cls = closure_with_formals(vec![formal("a")]);
        let err = closure_argument_adaptor(
            &cls,
            &dummy_fun(1),
            vec![(None, RVal::int(1)), (None, RVal::int(2))],
        )
        .unwrap_err();
        assert!(matches!(err, Unwind::Error(RirError::Host(_))));
    }
}
