//! End-to-end speculation tests: feedback-driven optimization, dispatch,
//! and deoptimization across the full pipeline.

use rir_compiler::bytecode::instruction::{Opcode, BC};
use rir_core::ast;
use rir_core::assumptions::{ArgAssume, OptimizationContext};
use rir_core::deopt::{DeoptMetadata, FrameInfo, ROOT_CODE_REF};
use rir_core::function::DispatchTable;
use rir_core::intern::sym;
use rir_core::value::{Env, RVal};
use rir_vm::api;
use rir_vm::Interp;
use std::rc::Rc;

fn run(interp: &mut Interp, asts: Vec<RVal>) -> RVal {
    let mut last = RVal::Null;
    for a in asts {
        last = api::eval_ast(interp, &a, None).unwrap();
    }
    last
}

fn global(interp: &Interp, name: &str) -> RVal {
    interp.global_env.get(&sym(name)).unwrap()
}

/// The full monomorphic-call story: observe, specialize, dispatch to the
/// specialized slot, then deoptimize when the callee is redefined.
#[test]
fn speculative_monomorphic_call_with_deopt() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![
            ast::assign(
                "f",
                ast::function(
                    vec![ast::param("x")],
                    ast::binop("+", ast::s("x"), RVal::int(1)),
                ),
            ),
            ast::assign(
                "g",
                ast::function(vec![ast::param("y")], ast::call("f", vec![ast::s("y")])),
            ),
        ],
    );

    // Two calls: the second triggers the optimizer.
    let r1 = run(&mut interp, vec![ast::call("g", vec![RVal::int(10)])]);
    assert_eq!(r1.as_int_scalar(), Some(11));
    let r2 = run(&mut interp, vec![ast::call("g", vec![RVal::int(10)])]);
    assert_eq!(r2.as_int_scalar(), Some(11));

    // A specialized version sits in slot 1 now.
    let g = global(&interp, "g");
    let counts = api::rir_invocation_count(&g).unwrap();
    assert_eq!(counts.len(), 2);
    let dt = {
        let RVal::Closure(cls) = &g else { panic!() };
        cls.dispatch_table().unwrap()
    };
    assert!(dt.slot(1).is_some(), "optimization installed a version");

    // Third call dispatches to the specialization.
    let r3 = run(&mut interp, vec![ast::call("g", vec![RVal::int(20)])]);
    assert_eq!(r3.as_int_scalar(), Some(21));
    assert!(
        dt.slot(1).unwrap().invocation_count() >= 1,
        "specialized slot was dispatched"
    );

    // Redefining f violates the identity assumption: the next call must
    // answer through the deopt path, not crash and not return 21.
    run(
        &mut interp,
        vec![ast::assign(
            "f",
            ast::function(
                vec![ast::param("x")],
                ast::binop("-", ast::s("x"), RVal::int(1)),
            ),
        )],
    );
    let r4 = run(&mut interp, vec![ast::call("g", vec![RVal::int(20)])]);
    assert_eq!(r4.as_int_scalar(), Some(19));
}

/// The specialized code really contains the speculation artifacts.
#[test]
fn specialized_code_carries_guard_and_deopt() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![
            ast::assign(
                "f",
                ast::function(
                    vec![ast::param("x")],
                    ast::binop("+", ast::s("x"), RVal::int(1)),
                ),
            ),
            ast::assign(
                "g",
                ast::function(vec![ast::param("y")], ast::call("f", vec![ast::s("y")])),
            ),
            ast::call("g", vec![RVal::int(1)]),
            ast::call("g", vec![RVal::int(1)]),
        ],
    );
    let g = global(&interp, "g");
    let RVal::Closure(cls) = &g else { panic!() };
    let spec = cls.dispatch_table().unwrap().slot(1).expect("specialized");
    let mut ops = Vec::new();
    let mut pc = 0;
    while pc < spec.body.bc.len() {
        let (bc, next) = BC::decode(&spec.body.bc, pc).unwrap();
        ops.push(bc.opcode());
        pc = next;
    }
    assert!(ops.contains(&Opcode::Identical), "identity guard");
    assert!(ops.contains(&Opcode::Deopt), "deopt landing pad");
    assert!(ops.contains(&Opcode::StaticCall), "devirtualized call");
}

/// Scalar type feedback elides the environment from hot binops.
#[test]
fn binop_speculation_after_warmup() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![
            ast::assign(
                "add",
                ast::function(
                    vec![ast::param("a"), ast::param("b")],
                    ast::binop("+", ast::s("a"), ast::s("b")),
                ),
            ),
            ast::call("add", vec![RVal::int(1), RVal::int(2)]),
            ast::call("add", vec![RVal::int(3), RVal::int(4)]),
        ],
    );
    let add = global(&interp, "add");
    let RVal::Closure(cls) = &add else { panic!() };
    let spec = cls.dispatch_table().unwrap().slot(1).expect("specialized");
    let mut ops = Vec::new();
    let mut pc = 0;
    while pc < spec.body.bc.len() {
        let (bc, next) = BC::decode(&spec.body.bc, pc).unwrap();
        ops.push(bc.opcode());
        pc = next;
    }
    assert!(ops.contains(&Opcode::IsObj), "object guards");
    // Still computes correctly afterwards.
    let r = run(&mut interp, vec![ast::call("add", vec![RVal::int(5), RVal::int(6)])]);
    assert_eq!(r.as_int_scalar(), Some(11));
}

/// An operand acquiring attributes between calls must not corrupt results:
/// the specialized fast path rejects it and the slow path answers.
#[test]
fn attributed_operand_falls_off_fast_path() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![
            ast::assign(
                "add",
                ast::function(
                    vec![ast::param("a"), ast::param("b")],
                    ast::binop("+", ast::s("a"), ast::s("b")),
                ),
            ),
            ast::call("add", vec![RVal::int(1), RVal::int(2)]),
            ast::call("add", vec![RVal::int(1), RVal::int(2)]),
        ],
    );
    // A value with a (non-class) attribute: no longer a simple scalar.
    let mut v = rir_core::value::RVec::scalar(7);
    v.set_attrib(sym("dim"), RVal::int(1));
    let attributed = RVal::Int(Rc::new(v));
    let add = global(&interp, "add");
    let r = api::call_function(&mut interp, &add, vec![attributed, RVal::int(1)]).unwrap();
    let RVal::Int(out) = r else { panic!() };
    assert_eq!(out.data, vec![8]);

    // A classed object takes the deopt path and still answers.
    let mut v = rir_core::value::RVec::scalar(7);
    v.set_attrib(sym("class"), RVal::string("myclass"));
    let object = RVal::Int(Rc::new(v));
    let r = api::call_function(&mut interp, &add, vec![object, RVal::int(1)]).unwrap();
    let RVal::Int(out) = r else { panic!() };
    assert_eq!(out.data, vec![8]);
}

/// Optimizing through the API equals the baseline (round-trip law).
#[test]
fn pir_compile_preserves_semantics() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![ast::assign(
            "f",
            ast::function(
                vec![ast::param("n")],
                ast::block(vec![
                    ast::assign("a", ast::binop("*", ast::s("n"), RVal::int(2))),
                    ast::binop("+", ast::s("a"), RVal::int(1)),
                ]),
            ),
        )],
    );
    let f = global(&interp, "f");
    let baseline_result = api::call_function(&mut interp, &f, vec![RVal::int(21)]).unwrap();

    api::pir_compile(&mut interp, &f, Some("f"), None).unwrap();
    let optimized_result = api::call_function(&mut interp, &f, vec![RVal::int(21)]).unwrap();

    assert_eq!(
        baseline_result.as_int_scalar(),
        optimized_result.as_int_scalar()
    );
    assert_eq!(optimized_result.as_int_scalar(), Some(43));
}

/// Frame reconstruction: a deopt after the first store resumes the
/// baseline with the partial environment intact.
#[test]
fn deopt_frame_reconstruction_mid_function() {
    let mut interp = Interp::new();
    // { a <- 1; b <- a + 1; b }
    let body = ast::block(vec![
        ast::assign("a", RVal::int(1)),
        ast::assign("b", ast::binop("+", ast::s("a"), RVal::int(1))),
        ast::s("b"),
    ]);
    let compiled = api::rir_compile(&mut interp, &body, None).unwrap();
    let RVal::Closure(cls) = &compiled else { panic!() };
    let baseline = cls.dispatch_table().unwrap().baseline();

    // Find the pc just past the first stvar.
    let mut pc = 0;
    let mut resume_pc = None;
    while pc < baseline.body.bc.len() {
        let (bc, next) = BC::decode(&baseline.body.bc, pc).unwrap();
        if matches!(bc, BC::StVar(_)) {
            resume_pc = Some(next as u32);
            break;
        }
        pc = next;
    }
    let resume_pc = resume_pc.expect("first stvar");

    // Synthesize the assumption failure: a specialized stub that deopts at
    // the checkpoint with `a` already bound.
    let frame_env = Env::new(Some(interp.global_env.clone()));
    frame_env.define(sym("a"), RVal::int(1));
    let env_idx = interp.cp.insert(RVal::Env(frame_env.clone()));
    let meta = DeoptMetadata::new(vec![FrameInfo {
        code_ref: ROOT_CODE_REF,
        pc: resume_pc,
        stack_size: 0,
    }]);
    let blob = interp.cp.insert(RVal::Raw(Rc::new(meta.serialize())));

    let mut b = rir_compiler::bytecode::builder::CodeBuilder::new();
    b.emit(BC::Push(env_idx));
    b.emit(BC::Deopt(blob));
    let stub_code = b.finish(rir_core::pool::SrcIdx(0));
    let stub = rir_core::function::Function::new(
        stub_code,
        Vec::new(),
        rir_core::function::FunctionSignature {
            formals: Vec::new(),
            has_defaults: false,
        },
        OptimizationContext::base(),
    );
    stub.set_baseline_code(Rc::clone(&baseline.body));

    let frame = rir_vm::call::CallFrame {
        args: Vec::new(),
        callee_env: interp.global_env.clone(),
    };
    let mut env = Some(interp.global_env.clone());
    let result = rir_vm::interp::eval(&mut interp, &stub.body, &mut env, Some(&frame), 0).unwrap();

    assert_eq!(result.as_int_scalar(), Some(2));
    assert_eq!(
        frame_env.get(&sym("a")).unwrap().as_int_scalar(),
        Some(1),
        "the synthesized frame sees the earlier store"
    );
    assert_eq!(
        frame_env.get(&sym("b")).unwrap().as_int_scalar(),
        Some(2),
        "execution continued in the synthesized environment"
    );
}

/// Dispatch monotonicity: incomparable contexts never coexist.
#[test]
fn incomparable_specializations_replace() {
    let base_fun = {
        let code = rir_core::code::Code::new(
            vec![Opcode::Ret as u8],
            rir_core::pool::SrcIdx(0),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            1,
            0,
        );
        rir_core::function::Function::new(
            code,
            Vec::new(),
            rir_core::function::FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            OptimizationContext::base(),
        )
    };
    let spec = |ctx: OptimizationContext| {
        let code = rir_core::code::Code::new(
            vec![Opcode::Ret as u8],
            rir_core::pool::SrcIdx(0),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            1,
            0,
        );
        rir_core::function::Function::new(
            code,
            Vec::new(),
            rir_core::function::FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            ctx,
        )
    };

    let dt = DispatchTable::with_capacity(base_fun, 3);
    let a = OptimizationContext::base().with_arg(0, ArgAssume::SCALAR_INT);
    let b = OptimizationContext::base().with_arg(0, ArgAssume::SCALAR_REAL);
    assert!(!a.comparable(&b));

    dt.insert(spec(a));
    dt.insert(spec(b.clone()));
    assert_eq!(dt.len(), 2, "later install replaced the earlier");
    assert_eq!(dt.slot(1).unwrap().context, b);

    // P1: every populated pair is strictly ordered.
    for i in 0..dt.len() {
        for j in (i + 1)..dt.len() {
            let (fi, fj) = (dt.slot(i).unwrap(), dt.slot(j).unwrap());
            assert!(fj.context.strictly_stronger_than(&fi.context));
        }
    }
}

/// mark_opt forces optimization on the next dispatch.
#[test]
fn mark_optimize_triggers_early() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![ast::assign(
            "f",
            ast::function(
                vec![ast::param("x")],
                ast::binop("+", ast::s("x"), RVal::int(1)),
            ),
        )],
    );
    let f = global(&interp, "f");
    api::rir_mark_optimize(&f).unwrap();
    // A single call suffices now.
    let r = run(&mut interp, vec![ast::call("f", vec![RVal::int(1)])]);
    assert_eq!(r.as_int_scalar(), Some(2));
    let RVal::Closure(cls) = &f else { panic!() };
    assert!(cls.dispatch_table().unwrap().slot(1).is_some());
}

/// DryRun optimizes but does not install.
#[test]
fn dry_run_installs_nothing() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![ast::assign(
            "f",
            ast::function(
                vec![ast::param("x")],
                ast::binop("+", ast::s("x"), RVal::int(1)),
            ),
        )],
    );
    let f = global(&interp, "f");
    api::pir_compile(
        &mut interp,
        &f,
        Some("f"),
        Some(rir_core::debug::DebugFlags::DRY_RUN),
    )
    .unwrap();
    let RVal::Closure(cls) = &f else { panic!() };
    assert!(cls.dispatch_table().unwrap().slot(1).is_none());
}

/// Compile-abort: a loop with a context falls back to the baseline with no
/// user-visible error.
#[test]
fn unsupported_construct_keeps_baseline() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![ast::assign(
            "w",
            ast::function(
                vec![ast::param("n")],
                ast::block(vec![
                    ast::assign("i", RVal::int(0)),
                    ast::while_(
                        ast::binop("<", ast::s("i"), ast::s("n")),
                        ast::assign("i", ast::call("id", vec![ast::binop(
                            "+",
                            ast::s("i"),
                            RVal::int(1),
                        )])),
                    ),
                    ast::s("i"),
                ]),
            ),
        )],
    );
    run(
        &mut interp,
        vec![ast::assign(
            "id",
            ast::function(vec![ast::param("x")], ast::s("x")),
        )],
    );
    // Repeated calls trigger the optimizer, which refuses the loop
    // context; execution keeps answering from the baseline.
    for _ in 0..4 {
        let r = run(&mut interp, vec![ast::call("w", vec![RVal::int(3)])]);
        assert_eq!(r.as_int_scalar(), Some(3));
    }
    let w = global(&interp, "w");
    let RVal::Closure(cls) = &w else { panic!() };
    assert!(
        cls.dispatch_table().unwrap().slot(1).is_none(),
        "no version installed for unsupported code"
    );
}
