//! Front compiler: syntax trees to baseline RIR.
//!
//! Expression-directed code generation. Every call site gets a
//! call-feedback slot and promise-wrapped arguments; every binary operator
//! gets a type-feedback slot. A fixed set of builtin names (`stop`,
//! `warning`, `vector`, `length`, `c`) is resolved statically to
//! `static_call_`; everything else goes through `ldfun_` and the implicit
//! call family.
//!
//! The compiler refuses constructs outside the supported subset with
//! `CannotCompile`; the embedder falls back to its own evaluator for those.

use crate::bytecode::builder::{CodeBuilder, Label};
use crate::bytecode::instruction::{BC, MISSING_ARG_IDX};
use rir_core::assumptions::OptimizationContext;
use rir_core::code::Code;
use rir_core::error::RirError;
use rir_core::function::{DispatchTable, Function, FunctionSignature};
use rir_core::intern::Symbol;
use rir_core::pool::{ConstPool, SrcPool};
use rir_core::value::{
    Arg, BuiltinId, ClosureBody, Env, Formal, Lang, RClosure, RVal, RVec,
};
use std::cell::RefCell;
use std::rc::Rc;

/// Builtin names the front compiler resolves statically.
const STATIC_BUILTINS: &[BuiltinId] = &[
    BuiltinId::Stop,
    BuiltinId::Warning,
    BuiltinId::Vector,
    BuiltinId::Length,
    BuiltinId::Concat,
];

/// The front compiler. Borrows the process pools for the duration of one
/// compilation.
pub struct Compiler<'p> {
    cp: &'p mut ConstPool,
    sp: &'p mut SrcPool,
}

impl<'p> Compiler<'p> {
    pub fn new(cp: &'p mut ConstPool, sp: &'p mut SrcPool) -> Self {
        Self { cp, sp }
    }

    /// Compile a closure in place: attach a dispatch table with a baseline
    /// function. Idempotent for already-compiled closures.
    pub fn compile_closure(&mut self, closure: &RVal) -> Result<Rc<DispatchTable>, RirError> {
        let RVal::Closure(cls) = closure else {
            return Err(RirError::CannotCompile("not a closure".into()));
        };
        if let Some(dt) = cls.dispatch_table() {
            return Ok(dt);
        }
        let body_ast = match &*cls.body.borrow() {
            ClosureBody::Ast(ast) => ast.clone(),
            ClosureBody::Compiled(dt) => return Ok(Rc::clone(dt)),
        };
        let fun = self.compile_function(&cls.formals, &body_ast)?;
        let dt = DispatchTable::new(fun);
        *cls.body.borrow_mut() = ClosureBody::Compiled(Rc::clone(&dt));
        Ok(dt)
    }

    /// Compile a top-level expression into a zero-formal function.
    pub fn compile_expression(&mut self, ast: &RVal) -> Result<Rc<Function>, RirError> {
        self.compile_function(&[], ast)
    }

    /// Compile a function body against its formals.
    pub fn compile_function(
        &mut self,
        formals: &[Formal],
        body: &RVal,
    ) -> Result<Rc<Function>, RirError> {
        let mut defaults = Vec::with_capacity(formals.len());
        for f in formals {
            defaults.push(match &f.default {
                Some(expr) => Some(self.compile_promise_code(expr)?),
                None => None,
            });
        }
        let signature = FunctionSignature {
            formals: formals.iter().map(|f| f.name.clone()).collect(),
            has_defaults: defaults.iter().any(Option::is_some),
        };

        let mut fc = FunCompiler {
            c: self,
            b: CodeBuilder::new(),
            loops: Vec::new(),
        };
        fc.expr(body, true)?;
        fc.b.emit(BC::Ret);
        let src = fc.c.sp.insert(body.clone());
        let code = fc.b.finish(src);

        Ok(Function::new(
            code,
            defaults,
            signature,
            OptimizationContext::base(),
        ))
    }

    /// Compile an expression into a standalone promise code object.
    fn compile_promise_code(&mut self, expr: &RVal) -> Result<Rc<Code>, RirError> {
        let mut fc = FunCompiler {
            c: self,
            b: CodeBuilder::new(),
            loops: Vec::new(),
        };
        fc.expr(expr, true)?;
        fc.b.emit(BC::Ret);
        let src = fc.c.sp.insert(expr.clone());
        Ok(fc.b.finish(src))
    }
}

struct LoopInfo {
    /// Jump target of `next`.
    head: Label,
    /// Jump target of `break` (runs `endcontext_` when the loop has one).
    done: Label,
}

struct FunCompiler<'c, 'p> {
    c: &'c mut Compiler<'p>,
    b: CodeBuilder,
    loops: Vec<LoopInfo>,
}

impl FunCompiler<'_, '_> {
    fn expr(&mut self, ast: &RVal, needed: bool) -> Result<(), RirError> {
        match ast {
            RVal::Null
            | RVal::Int(_)
            | RVal::Real(_)
            | RVal::Lgl(_)
            | RVal::Str(_)
            | RVal::Raw(_) => {
                if needed {
                    let idx = self.c.cp.insert(ast.clone());
                    self.b.emit(BC::Push(idx));
                }
                Ok(())
            }
            RVal::Sym(name) => {
                let idx = self.c.cp.insert_sym(name.clone());
                self.b.emit(BC::LdVar(idx));
                if !needed {
                    self.b.emit(BC::Pop);
                }
                Ok(())
            }
            RVal::Lang(l) => self.call(ast, l, needed),
            other => Err(RirError::CannotCompile(format!(
                "{} in expression position",
                other.type_name()
            ))),
        }
    }

    fn call(&mut self, ast: &RVal, l: &Lang, needed: bool) -> Result<(), RirError> {
        if let RVal::Sym(name) = &l.fun {
            if let Some(()) = self.special_form(ast, name, &l.args, needed)? {
                return Ok(());
            }
        }
        self.generic_call(ast, l, needed)
    }

    /// Handle a special form, returning `Some(())` if the name was one.
    #[allow(clippy::too_many_lines)]
    fn special_form(
        &mut self,
        ast: &RVal,
        name: &Symbol,
        args: &[Arg],
        needed: bool,
    ) -> Result<Option<()>, RirError> {
        match name.as_str() {
            "{" => {
                if args.is_empty() {
                    if needed {
                        let idx = self.c.cp.insert(RVal::Null);
                        self.b.emit(BC::Push(idx));
                    }
                    return Ok(Some(()));
                }
                let last = args.len() - 1;
                for (i, a) in args.iter().enumerate() {
                    self.expr(&a.value, i == last && needed)?;
                }
                Ok(Some(()))
            }
            "(" => {
                self.check_arity(name, args, 1)?;
                self.expr(&args[0].value, needed)?;
                if needed {
                    self.b.emit(BC::Visible);
                }
                Ok(Some(()))
            }
            "<-" | "=" => {
                self.assign(name, args, needed, false)?;
                Ok(Some(()))
            }
            "<<-" => {
                self.assign(name, args, needed, true)?;
                Ok(Some(()))
            }
            "if" => {
                self.if_form(args, needed)?;
                Ok(Some(()))
            }
            "while" => {
                self.check_arity(name, args, 2)?;
                self.loop_form(Some(&args[0].value), &args[1].value, needed)?;
                Ok(Some(()))
            }
            "repeat" => {
                self.check_arity(name, args, 1)?;
                self.loop_form(None, &args[0].value, needed)?;
                Ok(Some(()))
            }
            "break" => {
                let info = self
                    .loops
                    .last()
                    .ok_or_else(|| RirError::CannotCompile("break outside loop".into()))?;
                let done = info.done;
                self.b.br(done);
                if needed {
                    // Unreachable, but keeps the stack model balanced.
                    let idx = self.c.cp.insert(RVal::Null);
                    self.b.emit(BC::Push(idx));
                }
                Ok(Some(()))
            }
            "next" => {
                let info = self
                    .loops
                    .last()
                    .ok_or_else(|| RirError::CannotCompile("next outside loop".into()))?;
                let head = info.head;
                self.b.br(head);
                if needed {
                    let idx = self.c.cp.insert(RVal::Null);
                    self.b.emit(BC::Push(idx));
                }
                Ok(Some(()))
            }
            "function" => {
                self.function_literal(ast, args, needed)?;
                Ok(Some(()))
            }
            "missing" => {
                self.check_arity(name, args, 1)?;
                let RVal::Sym(var) = &args[0].value else {
                    return Err(RirError::CannotCompile(
                        "missing() needs a variable name".into(),
                    ));
                };
                let idx = self.c.cp.insert_sym(var.clone());
                self.b.emit(BC::Missing(idx));
                if !needed {
                    self.b.emit(BC::Pop);
                }
                Ok(Some(()))
            }
            "invisible" => {
                self.check_arity(name, args, 1)?;
                self.expr(&args[0].value, needed)?;
                self.b.emit(BC::Invisible);
                Ok(Some(()))
            }
            "&&" | "||" => {
                self.check_arity(name, args, 2)?;
                self.expr(&args[0].value, true)?;
                self.expr(&args[1].value, true)?;
                self.b.emit(if name.as_str() == "&&" {
                    BC::LglAnd
                } else {
                    BC::LglOr
                });
                if !needed {
                    self.b.emit(BC::Pop);
                }
                Ok(Some(()))
            }
            "+" | "-" if args.len() == 1 => {
                self.expr(&args[0].value, true)?;
                let src = self.c.sp.insert(ast.clone());
                self.b.emit_src(
                    if name.as_str() == "-" {
                        BC::UMinus
                    } else {
                        BC::UPlus
                    },
                    src,
                );
                if !needed {
                    self.b.emit(BC::Pop);
                }
                Ok(Some(()))
            }
            "!" => {
                self.check_arity(name, args, 1)?;
                self.expr(&args[0].value, true)?;
                let src = self.c.sp.insert(ast.clone());
                self.b.emit_src(BC::Not, src);
                if !needed {
                    self.b.emit(BC::Pop);
                }
                Ok(Some(()))
            }
            _ => {
                if let Some(op) = binop_bc(name.as_str()) {
                    if args.len() == 2 && args.iter().all(|a| a.name.is_none()) {
                        self.expr(&args[0].value, true)?;
                        self.expr(&args[1].value, true)?;
                        let slot = self.b.add_binop_feedback();
                        self.b.emit(BC::RecordBinop(slot));
                        let src = self.c.sp.insert(ast.clone());
                        self.b.emit_src(op, src);
                        if !needed {
                            self.b.emit(BC::Pop);
                        }
                        return Ok(Some(()));
                    }
                }
                if let Some(id) = BuiltinId::from_name(name.as_str()) {
                    if STATIC_BUILTINS.contains(&id) && args.iter().all(|a| a.name.is_none()) {
                        for a in args {
                            self.expr(&a.value, true)?;
                        }
                        let ast_idx = self.c.cp.insert(ast.clone());
                        let target = self.c.cp.insert(RVal::Builtin(id));
                        let src = self.c.sp.insert(ast.clone());
                        self.b.emit_src(
                            BC::StaticCall {
                                nargs: args.len() as u32,
                                ast: ast_idx,
                                target,
                            },
                            src,
                        );
                        if !needed {
                            self.b.emit(BC::Pop);
                        }
                        return Ok(Some(()));
                    }
                }
                Ok(None)
            }
        }
    }

    fn check_arity(&self, name: &Symbol, args: &[Arg], n: usize) -> Result<(), RirError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(RirError::CannotCompile(format!(
                "{name} expects {n} argument(s), got {}",
                args.len()
            )))
        }
    }

    fn assign(
        &mut self,
        name: &Symbol,
        args: &[Arg],
        needed: bool,
        superassign: bool,
    ) -> Result<(), RirError> {
        self.check_arity(name, args, 2)?;
        let RVal::Sym(target) = &args[0].value else {
            return Err(RirError::CannotCompile(
                "only symbol assignment targets are supported".into(),
            ));
        };
        self.expr(&args[1].value, true)?;
        if needed {
            self.b.emit(BC::Dup);
        }
        let idx = self.c.cp.insert_sym(target.clone());
        self.b.emit(if superassign {
            BC::StVarSuper(idx)
        } else {
            BC::StVar(idx)
        });
        if needed {
            self.b.emit(BC::Invisible);
        }
        Ok(())
    }

    fn if_form(&mut self, args: &[Arg], needed: bool) -> Result<(), RirError> {
        if args.len() < 2 || args.len() > 3 {
            return Err(RirError::CannotCompile("malformed if".into()));
        }
        self.expr(&args[0].value, true)?;
        let l_else = self.b.label();
        let l_end = self.b.label();
        self.b.br_false(l_else);
        self.expr(&args[1].value, needed)?;
        self.b.br(l_end);
        self.b.bind(l_else);
        if args.len() == 3 {
            self.expr(&args[2].value, needed)?;
        } else if needed {
            let idx = self.c.cp.insert(RVal::Null);
            self.b.emit(BC::Push(idx));
            self.b.emit(BC::Invisible);
        }
        self.b.bind(l_end);
        Ok(())
    }

    /// `while` and `repeat`. A loop whose body contains a call gets a
    /// scoped context so that non-local `break`/`next` can unwind to it.
    fn loop_form(&mut self, cond: Option<&RVal>, body: &RVal, needed: bool) -> Result<(), RirError> {
        let uses_context = contains_call(body);
        let l_head = self.b.label();
        let l_done = self.b.label();
        let l_exit = self.b.label();

        if uses_context {
            self.b.begin_loop(l_exit);
        }
        self.b.bind(l_head);
        if let Some(cond) = cond {
            self.expr(cond, true)?;
            self.b.br_false(l_done);
        }
        self.loops.push(LoopInfo {
            head: l_head,
            done: l_done,
        });
        let body_result = self.expr(body, false);
        self.loops.pop();
        body_result?;
        self.b.br(l_head);
        self.b.bind(l_done);
        if uses_context {
            self.b.emit(BC::EndContext);
        }
        self.b.bind(l_exit);
        if needed {
            let idx = self.c.cp.insert(RVal::Null);
            self.b.emit(BC::Push(idx));
            self.b.emit(BC::Invisible);
        }
        Ok(())
    }

    /// Compile a nested function literal eagerly into a prototype closure
    /// constant; `close_` rebinds it to the runtime environment.
    fn function_literal(&mut self, ast: &RVal, args: &[Arg], needed: bool) -> Result<(), RirError> {
        let Some((body_arg, formal_args)) = args.split_last() else {
            return Err(RirError::CannotCompile("malformed function literal".into()));
        };
        if body_arg.name.is_some() {
            return Err(RirError::CannotCompile(
                "function literal body must be the unnamed tail".into(),
            ));
        }
        let formals: Vec<Formal> = formal_args
            .iter()
            .map(|a| {
                a.name
                    .clone()
                    .map(|name| Formal {
                        name,
                        default: match &a.value {
                            RVal::Missing => None,
                            v => Some(v.clone()),
                        },
                    })
                    .ok_or_else(|| RirError::CannotCompile("unnamed formal".into()))
            })
            .collect::<Result<_, _>>()?;

        let fun = self.c.compile_function(&formals, &body_arg.value)?;
        let proto = RVal::Closure(Rc::new(RClosure {
            formals,
            body: RefCell::new(ClosureBody::Compiled(DispatchTable::new(fun))),
            env: Env::new(None),
        }));
        let idx = self.c.cp.insert(proto);
        let src = self.c.sp.insert(ast.clone());
        self.b.emit(BC::Push(idx));
        self.b.emit_src(BC::Close, src);
        if !needed {
            self.b.emit(BC::Pop);
        }
        Ok(())
    }

    /// A generic call: callee lookup, call feedback, promise-wrapped
    /// arguments.
    fn generic_call(&mut self, ast: &RVal, l: &Lang, needed: bool) -> Result<(), RirError> {
        match &l.fun {
            RVal::Sym(name) => {
                let idx = self.c.cp.insert_sym(name.clone());
                self.b.emit(BC::LdFun(idx));
            }
            fun => {
                self.expr(fun, true)?;
                self.b.emit(BC::Force);
            }
        }
        let slot = self.b.add_call_feedback();
        self.b.emit(BC::RecordCall(slot));

        let mut arg_codes = smallvec::SmallVec::<[u32; 4]>::new();
        let mut any_named = false;
        for a in &l.args {
            any_named |= a.name.is_some();
            if matches!(a.value, RVal::Missing) {
                arg_codes.push(MISSING_ARG_IDX);
            } else {
                let code = self.c.compile_promise_code(&a.value)?;
                arg_codes.push(self.b.add_child(code));
            }
        }

        let ast_idx = self.c.cp.insert(ast.clone());
        let src = self.c.sp.insert(ast.clone());
        if any_named {
            let names: Vec<Rc<str>> = l
                .args
                .iter()
                .map(|a| {
                    a.name
                        .as_ref()
                        .map_or_else(|| "".into(), |n| n.as_str().into())
                })
                .collect();
            let names_idx = self.c.cp.insert(RVal::Str(Rc::new(RVec::from_vec(names))));
            self.b.emit_src(
                BC::NamedCallImplicit {
                    ast: ast_idx,
                    names: names_idx,
                    args: arg_codes,
                },
                src,
            );
        } else {
            self.b.emit_src(
                BC::CallImplicit {
                    ast: ast_idx,
                    args: arg_codes,
                },
                src,
            );
        }
        if !needed {
            self.b.emit(BC::Pop);
        }
        Ok(())
    }
}

fn binop_bc(name: &str) -> Option<BC> {
    Some(match name {
        "+" => BC::Add,
        "-" => BC::Sub,
        "*" => BC::Mul,
        "/" => BC::Div,
        "%/%" => BC::IDiv,
        "%%" => BC::Mod,
        "^" => BC::Pow,
        "==" => BC::Eq,
        "!=" => BC::Ne,
        "<" => BC::Lt,
        "<=" => BC::Le,
        ">" => BC::Gt,
        ">=" => BC::Ge,
        _ => return None,
    })
}

/// Conservative test for calls that could observe the loop context.
fn contains_call(ast: &RVal) -> bool {
    match ast {
        RVal::Lang(l) => {
            if let RVal::Sym(name) = &l.fun {
                let structural = matches!(
                    name.as_str(),
                    "{" | "(" | "<-" | "=" | "<<-" | "if" | "while" | "repeat" | "break" | "next"
                );
                let operator = binop_bc(name.as_str()).is_some()
                    || matches!(name.as_str(), "!" | "&&" | "||");
                if !structural && !operator {
                    return true;
                }
            } else {
                return true;
            }
            l.args.iter().any(|a| contains_call(&a.value))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::Opcode;
    use rir_core::ast;

    fn decode_all(code: &[u8]) -> Vec<BC> {
        let mut out = Vec::new();
        let mut pc = 0;
        while pc < code.len() {
            let (bc, next) = BC::decode(code, pc).unwrap();
            out.push(bc);
            pc = next;
        }
        out
    }

    fn opcodes(code: &[u8]) -> Vec<Opcode> {
        decode_all(code).iter().map(BC::opcode).collect()
    }

    fn compile(ast: &RVal) -> (Rc<Function>, ConstPool, SrcPool) {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let fun = Compiler::new(&mut cp, &mut sp)
            .compile_expression(ast)
            .unwrap();
        (fun, cp, sp)
    }

    #[test]
    fn test_compile_constant() {
        let (fun, ..) = compile(&RVal::int(42));
        assert_eq!(opcodes(&fun.body.bc), vec![Opcode::Push, Opcode::Ret]);
    }

    #[test]
    fn test_compile_variable_read() {
        let (fun, ..) = compile(&ast::s("x"));
        assert_eq!(opcodes(&fun.body.bc), vec![Opcode::LdVar, Opcode::Ret]);
    }

    #[test]
    fn test_binop_records_feedback() {
        let (fun, ..) = compile(&ast::binop("+", ast::s("a"), ast::s("b")));
        assert_eq!(
            opcodes(&fun.body.bc),
            vec![
                Opcode::LdVar,
                Opcode::LdVar,
                Opcode::RecordBinop,
                Opcode::Add,
                Opcode::Ret
            ]
        );
        assert_eq!(fun.body.feedback.len(), 1);
    }

    #[test]
    fn test_call_compiles_promise_args() {
        let (fun, ..) = compile(&ast::call("f", vec![ast::s("y")]));
        assert_eq!(
            opcodes(&fun.body.bc),
            vec![
                Opcode::LdFun,
                Opcode::RecordCall,
                Opcode::CallImplicit,
                Opcode::Ret
            ]
        );
        assert_eq!(fun.body.children.len(), 1, "argument became a promise code");
        assert_eq!(
            opcodes(&fun.body.children[0].bc),
            vec![Opcode::LdVar, Opcode::Ret]
        );
    }

    #[test]
    fn test_named_call() {
        let (fun, ..) = compile(&ast::lang(
            ast::s("f"),
            vec![ast::named("x", RVal::int(1))],
        ));
        assert!(opcodes(&fun.body.bc).contains(&Opcode::NamedCallImplicit));
    }

    #[test]
    fn test_static_builtin_call() {
        let (fun, ..) = compile(&ast::call("stop", vec![RVal::string("boom")]));
        assert_eq!(
            opcodes(&fun.body.bc),
            vec![Opcode::Push, Opcode::StaticCall, Opcode::Ret]
        );
    }

    #[test]
    fn test_assignment_invisible() {
        let (fun, ..) = compile(&ast::assign("x", RVal::int(1)));
        assert_eq!(
            opcodes(&fun.body.bc),
            vec![
                Opcode::Push,
                Opcode::Dup,
                Opcode::StVar,
                Opcode::Invisible,
                Opcode::Ret
            ]
        );
    }

    #[test]
    fn test_block_voids_intermediates() {
        let (fun, ..) = compile(&ast::block(vec![
            ast::assign("a", RVal::int(1)),
            ast::s("a"),
        ]));
        let ops = opcodes(&fun.body.bc);
        // Assignment in statement position has no dup.
        assert_eq!(
            ops,
            vec![
                Opcode::Push,
                Opcode::StVar,
                Opcode::LdVar,
                Opcode::Ret
            ]
        );
    }

    #[test]
    fn test_if_else_branches() {
        let (fun, ..) = compile(&ast::if_(
            ast::s("c"),
            RVal::int(1),
            Some(RVal::int(2)),
        ));
        let ops = opcodes(&fun.body.bc);
        assert!(ops.contains(&Opcode::BrFalse));
        assert!(ops.contains(&Opcode::Br));
    }

    #[test]
    fn test_while_loop_without_calls_has_no_context() {
        let body = ast::assign("i", ast::binop("+", ast::s("i"), RVal::int(1)));
        let (fun, ..) = compile(&ast::while_(
            ast::binop("<", ast::s("i"), RVal::int(10)),
            body,
        ));
        let ops = opcodes(&fun.body.bc);
        assert!(!ops.contains(&Opcode::BeginLoop));
        assert!(ops.contains(&Opcode::BrFalse));
    }

    #[test]
    fn test_while_loop_with_call_gets_context() {
        let (fun, ..) = compile(&ast::while_(
            ast::s("c"),
            ast::call("f", vec![]),
        ));
        let ops = opcodes(&fun.body.bc);
        assert!(ops.contains(&Opcode::BeginLoop));
        assert!(ops.contains(&Opcode::EndContext));
    }

    #[test]
    fn test_function_literal() {
        let (fun, cp, _) = compile(&ast::function(vec![ast::param("x")], ast::s("x")));
        let ops = opcodes(&fun.body.bc);
        assert_eq!(ops, vec![Opcode::Push, Opcode::Close, Opcode::Ret]);
        // The prototype in the pool is already compiled.
        let proto = decode_all(&fun.body.bc);
        let BC::Push(idx) = proto[0] else { panic!() };
        let RVal::Closure(cls) = cp.get(idx) else {
            panic!("prototype closure expected")
        };
        assert!(cls.dispatch_table().is_some());
    }

    #[test]
    fn test_break_outside_loop_refused() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let err = Compiler::new(&mut cp, &mut sp)
            .compile_expression(&ast::call("break", vec![]))
            .unwrap_err();
        assert!(matches!(err, RirError::CannotCompile(_)));
    }

    #[test]
    fn test_compile_closure_idempotent() {
        let mut cp = ConstPool::new();
        let mut sp = SrcPool::new();
        let cls = RVal::Closure(Rc::new(RClosure {
            formals: vec![],
            body: RefCell::new(ClosureBody::Ast(RVal::int(1))),
            env: Env::new(None),
        }));
        let mut c = Compiler::new(&mut cp, &mut sp);
        let dt1 = c.compile_closure(&cls).unwrap();
        let dt2 = c.compile_closure(&cls).unwrap();
        assert!(Rc::ptr_eq(&dt1, &dt2));
    }
}
