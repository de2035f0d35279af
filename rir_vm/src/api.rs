//! Host-facing entry points.
//!
//! The embedder hands in syntax trees or closures and gets compiled
//! closures back; evaluation, introspection, and debug-mask control go
//! through here as well. Everything operates on one [`Interp`] context.

use crate::call::{do_call, CallArgs, CallContext};
use crate::{interp, Interp};
use rir_compiler::bytecode::instruction::BC;
use rir_compiler::compile::Compiler;
use rir_core::debug::{self, DebugFlags};
use rir_core::error::{RirError, Unwind};
use rir_core::function::DispatchTable;
use rir_core::value::{ClosureBody, Env, RClosure, RVal};
use std::cell::RefCell;
use std::rc::Rc;

fn unwind_to_error(u: Unwind) -> RirError {
    match u {
        Unwind::Error(e) => e,
        Unwind::LoopBreak => RirError::Host("no loop for break".into()),
        Unwind::LoopNext => RirError::Host("no loop for next".into()),
    }
}

/// The dispatch table of a compiled closure.
fn dispatch_table(what: &RVal) -> Result<Rc<DispatchTable>, RirError> {
    let RVal::Closure(cls) = what else {
        return Err(RirError::CannotCompile("not a rir compiled code".into()));
    };
    cls.dispatch_table()
        .ok_or_else(|| RirError::CannotCompile("not a rir compiled code".into()))
}

/// Compile a closure in place, or wrap an expression into a compiled
/// zero-formal closure. Attaches a dispatch table with a baseline version.
pub fn rir_compile(interp: &mut Interp, what: &RVal, env: Option<Env>) -> Result<RVal, RirError> {
    match what {
        RVal::Closure(_) => {
            Compiler::new(&mut interp.cp, &mut interp.sp).compile_closure(what)?;
            Ok(what.clone())
        }
        ast => {
            let fun = Compiler::new(&mut interp.cp, &mut interp.sp).compile_expression(ast)?;
            let cls = RClosure {
                formals: Vec::new(),
                body: RefCell::new(ClosureBody::Compiled(DispatchTable::new(fun))),
                env: env.unwrap_or_else(|| interp.global_env.clone()),
            };
            Ok(RVal::Closure(Rc::new(cls)))
        }
    }
}

/// Evaluate compiled code in an environment.
pub fn rir_eval(interp: &mut Interp, what: &RVal, env: Option<Env>) -> Result<RVal, RirError> {
    let RVal::Closure(cls) = what else {
        return Err(RirError::CannotCompile("not rir compiled code".into()));
    };
    let dt = dispatch_table(what)?;
    let fun = dt.baseline();
    let frame = crate::call::CallFrame {
        args: Vec::new(),
        callee_env: cls.env.clone(),
    };
    let mut env = Some(env.unwrap_or_else(|| cls.env.clone()));
    interp::eval(interp, &fun.body, &mut env, Some(&frame), 0).map_err(unwind_to_error)
}

/// Compile and evaluate a syntax tree in one step.
pub fn eval_ast(interp: &mut Interp, ast: &RVal, env: Option<Env>) -> Result<RVal, RirError> {
    let env = env.unwrap_or_else(|| interp.global_env.clone());
    let compiled = rir_compile(interp, ast, Some(env.clone()))?;
    rir_eval(interp, &compiled, Some(env))
}

/// Call a compiled closure with evaluated arguments, through the regular
/// runtime dispatch (invocation counting included).
pub fn call_function(
    interp: &mut Interp,
    closure: &RVal,
    args: Vec<RVal>,
) -> Result<RVal, RirError> {
    let ast = rir_core::ast::lang(
        closure.clone(),
        args.iter()
            .map(|a| rir_core::ast::arg(a.clone()))
            .collect(),
    );
    let ast_idx = interp.cp.insert(ast);
    let call = CallContext {
        callee: closure.clone(),
        ast_idx,
        names: None,
        args: CallArgs::Stack(args),
        caller_env: interp.global_env.clone(),
    };
    do_call(interp, call).map_err(unwind_to_error)
}

/// Optimize a compiled closure in place; on success a specialized version
/// is added to its dispatch table.
pub fn pir_compile(
    interp: &mut Interp,
    what: &RVal,
    name: Option<&str>,
    debug_flags: Option<DebugFlags>,
) -> Result<RVal, RirError> {
    dispatch_table(what)?;
    let flags = debug_flags.unwrap_or_else(debug::flags);
    let Interp { cp, sp, .. } = interp;
    rir_opt::pir_compile(what, name, flags, cp, sp)?;
    Ok(what.clone())
}

/// Mark the baseline for optimization at its next dispatch.
pub fn rir_mark_optimize(what: &RVal) -> Result<(), RirError> {
    let dt = dispatch_table(what)?;
    dt.baseline().mark_opt.set(true);
    Ok(())
}

/// Per-slot invocation counts, zero for empty slots.
pub fn rir_invocation_count(what: &RVal) -> Result<Vec<u32>, RirError> {
    Ok(dispatch_table(what)?.invocation_counts())
}

/// Human-readable invocation summary.
pub fn rir_print_invocation(what: &RVal) -> Result<String, RirError> {
    let dt = dispatch_table(what)?;
    let mut out = String::new();
    for (i, count) in dt.invocation_counts().iter().enumerate() {
        if dt.slot(i).is_some() {
            out.push_str(&format!(
                "The vtable slot {i} has been called {count} time(s)\n"
            ));
        }
    }
    Ok(out)
}

/// Disassemble every populated slot of a closure's dispatch table.
pub fn rir_disassemble(what: &RVal) -> Result<String, RirError> {
    let dt = dispatch_table(what)?;
    let mut out = String::new();
    for i in 0..dt.capacity() {
        let Some(fun) = dt.slot(i) else { continue };
        out.push_str(&format!(
            "= vtable slot <{i}> (invoked {}, {}) =\n",
            fun.invocation_count(),
            fun.context
        ));
        disassemble_code(&fun.body, &mut out, 0)?;
    }
    Ok(out)
}

fn disassemble_code(
    code: &Rc<rir_core::code::Code>,
    out: &mut String,
    indent: usize,
) -> Result<(), RirError> {
    let pad = "  ".repeat(indent);
    let mut pc = 0;
    while pc < code.bc.len() {
        let (bc, next) = BC::decode(&code.bc, pc)?;
        out.push_str(&format!("{pad}{pc:4}: {bc}\n"));
        pc = next;
    }
    for (i, child) in code.children.iter().enumerate() {
        out.push_str(&format!("{pad}promise {i}:\n"));
        disassemble_code(child, out, indent + 1)?;
    }
    Ok(())
}

/// Replace the process-wide debug mask.
pub fn pir_set_debug_flags(bits: u32) {
    debug::set_flags(DebugFlags::from_bits_truncate(bits));
}

/// The current process-wide debug mask.
#[must_use]
pub fn pir_debug_flags() -> u32 {
    debug::flags().bits()
}

/// Read `PIR_DEBUG` once at startup.
pub fn init() {
    debug::init_from_env();
}
