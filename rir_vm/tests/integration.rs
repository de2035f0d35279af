//! End-to-end interpreter tests: compile syntax trees to RIR and run them.

use rir_core::ast;
use rir_core::value::{RVal, NA_INTEGER};
use rir_vm::api;
use rir_vm::Interp;

fn run(interp: &mut Interp, asts: Vec<RVal>) -> RVal {
    let mut last = RVal::Null;
    for a in asts {
        last = api::eval_ast(interp, &a, None).unwrap();
    }
    last
}

#[test]
fn identity_function() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign("id", ast::function(vec![ast::param("x")], ast::s("x"))),
            ast::call("id", vec![RVal::int(3)]),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(3));

    // Exactly one baseline invocation, no specialization yet.
    let id = interp.global_env.get(&rir_core::intern::sym("id")).unwrap();
    assert_eq!(api::rir_invocation_count(&id).unwrap(), vec![1, 0]);
}

#[test]
fn constant_expression() {
    let mut interp = Interp::new();
    let result = run(&mut interp, vec![RVal::int(42)]);
    assert_eq!(result.as_int_scalar(), Some(42));
}

#[test]
fn fast_path_integer_arithmetic() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign(
                "f",
                ast::function(
                    vec![ast::param("a"), ast::param("b")],
                    ast::binop("+", ast::s("a"), ast::s("b")),
                ),
            ),
            ast::call("f", vec![RVal::int(1), RVal::int(2)]),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(3));

    let result = run(
        &mut interp,
        vec![ast::call("f", vec![RVal::real(1.5), RVal::real(2.5)])],
    );
    assert_eq!(result.as_real_scalar(), Some(4.0));
}

#[test]
fn integer_overflow_warns_once_per_site() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign(
                "f",
                ast::function(
                    vec![ast::param("a"), ast::param("b")],
                    ast::binop("+", ast::s("a"), ast::s("b")),
                ),
            ),
            ast::call("f", vec![RVal::int(i32::MAX), RVal::int(1)]),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(NA_INTEGER));
    assert_eq!(interp.warnings.len(), 1);
    assert_eq!(interp.warnings[0].message, "NAs produced by integer overflow");

    // The same site overflowing again stays quiet.
    let result = run(
        &mut interp,
        vec![ast::call("f", vec![RVal::int(i32::MAX), RVal::int(2)])],
    );
    assert_eq!(result.as_int_scalar(), Some(NA_INTEGER));
    assert_eq!(interp.warnings.len(), 1);
}

#[test]
fn promise_laziness() {
    let mut interp = Interp::new();
    // The stop() argument is never forced; no error surfaces.
    let result = run(
        &mut interp,
        vec![
            ast::assign("f", ast::function(vec![ast::param("x")], RVal::int(1))),
            ast::call("f", vec![ast::call("stop", vec![RVal::string("boom")])]),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(1));
}

#[test]
fn forcing_a_failing_promise_raises() {
    let mut interp = Interp::new();
    let err = api::eval_ast(
        &mut interp,
        &ast::block(vec![
            ast::assign("f", ast::function(vec![ast::param("x")], ast::s("x"))),
            ast::call("f", vec![ast::call("stop", vec![RVal::string("boom")])]),
        ]),
        None,
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "boom");
}

#[test]
fn promises_memoize() {
    let mut interp = Interp::new();
    // x is read twice but its side effect (counter bump) happens once.
    let result = run(
        &mut interp,
        vec![
            ast::assign("n", RVal::int(0)),
            ast::assign(
                "f",
                ast::function(
                    vec![ast::param("x")],
                    ast::binop("+", ast::s("x"), ast::s("x")),
                ),
            ),
            ast::call(
                "f",
                vec![ast::block(vec![
                    ast::superassign("n", ast::binop("+", ast::s("n"), RVal::int(1))),
                    RVal::int(5),
                ])],
            ),
            ast::s("n"),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(1), "promise forced exactly once");
}

#[test]
fn default_arguments() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign(
                "f",
                ast::function(
                    vec![ast::param("a"), ast::param_default("b", RVal::int(10))],
                    ast::binop("+", ast::s("a"), ast::s("b")),
                ),
            ),
            ast::call("f", vec![RVal::int(1)]),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(11));
}

#[test]
fn named_argument_matching() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign(
                "f",
                ast::function(
                    vec![ast::param("a"), ast::param("b")],
                    ast::binop("-", ast::s("a"), ast::s("b")),
                ),
            ),
            ast::lang(
                ast::s("f"),
                vec![ast::named("b", RVal::int(1)), ast::arg(RVal::int(10))],
            ),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(9), "a = 10, b = 1");
}

#[test]
fn missing_argument_errors_on_read() {
    let mut interp = Interp::new();
    let err = api::eval_ast(
        &mut interp,
        &ast::block(vec![
            ast::assign("f", ast::function(vec![ast::param("x")], ast::s("x"))),
            ast::call("f", vec![]),
        ]),
        None,
    )
    .unwrap_err();
    assert!(err.to_string().contains("missing"));
}

#[test]
fn missing_builtin_observes_absence() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign(
                "f",
                ast::function(vec![ast::param("x")], ast::call("missing", vec![ast::s("x")])),
            ),
            ast::call("f", vec![]),
        ],
    );
    assert_eq!(result.as_lgl_scalar(), Some(1));
}

#[test]
fn if_else_branches() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![ast::if_(RVal::lgl(true), RVal::int(1), Some(RVal::int(2)))],
    );
    assert_eq!(result.as_int_scalar(), Some(1));

    let result = run(
        &mut interp,
        vec![ast::if_(RVal::lgl(false), RVal::int(1), Some(RVal::int(2)))],
    );
    assert_eq!(result.as_int_scalar(), Some(2));
}

#[test]
fn na_condition_is_an_error() {
    let mut interp = Interp::new();
    let err = api::eval_ast(
        &mut interp,
        &ast::if_(RVal::lgl_na(), RVal::int(1), Some(RVal::int(2))),
        None,
    )
    .unwrap_err();
    assert!(err.to_string().contains("logical"));
}

#[test]
fn while_loop_counts() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign("i", RVal::int(0)),
            ast::while_(
                ast::binop("<", ast::s("i"), RVal::int(10)),
                ast::assign("i", ast::binop("+", ast::s("i"), RVal::int(1))),
            ),
            ast::s("i"),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(10));
}

#[test]
fn superassignment_reaches_enclosing_frame() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign("x", RVal::int(1)),
            ast::assign(
                "bump",
                ast::function(vec![], ast::superassign("x", RVal::int(2))),
            ),
            ast::call("bump", vec![]),
            ast::s("x"),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(2));
}

#[test]
fn closures_capture_their_environment() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign(
                "make_adder",
                ast::function(
                    vec![ast::param("n")],
                    ast::function(
                        vec![ast::param("x")],
                        ast::binop("+", ast::s("x"), ast::s("n")),
                    ),
                ),
            ),
            ast::assign("add3", ast::call("make_adder", vec![RVal::int(3)])),
            ast::call("add3", vec![RVal::int(4)]),
        ],
    );
    assert_eq!(result.as_int_scalar(), Some(7));
}

#[test]
fn static_builtins() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![ast::call("length", vec![ast::call(
            "c",
            vec![RVal::int(1), RVal::int(2), RVal::int(3)],
        )])],
    );
    assert_eq!(result.as_int_scalar(), Some(3));

    let result = run(
        &mut interp,
        vec![ast::call(
            "vector",
            vec![RVal::string("integer"), RVal::int(2)],
        )],
    );
    let RVal::Int(v) = result else { panic!() };
    assert_eq!(v.data, vec![0, 0]);
}

#[test]
fn zero_formals_zero_statements() {
    let mut interp = Interp::new();
    let result = run(
        &mut interp,
        vec![
            ast::assign("f", ast::function(vec![], ast::block(vec![]))),
            ast::call("f", vec![]),
        ],
    );
    assert!(matches!(result, RVal::Null));
}

#[test]
fn disassembly_lists_slots() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![ast::assign(
            "f",
            ast::function(vec![ast::param("x")], ast::s("x")),
        )],
    );
    let f = interp.global_env.get(&rir_core::intern::sym("f")).unwrap();
    let text = api::rir_disassemble(&f).unwrap();
    assert!(text.contains("vtable slot <0>"));
    assert!(text.contains("LdVar"));
    assert!(text.contains("Ret"));
}

#[test]
fn warnings_accumulate_in_order() {
    let mut interp = Interp::new();
    run(
        &mut interp,
        vec![
            ast::call("warning", vec![RVal::string("first")]),
            ast::call("warning", vec![RVal::string("second")]),
        ],
    );
    let messages: Vec<_> = interp.warnings.iter().map(|w| w.message.clone()).collect();
    assert_eq!(messages, vec!["first", "second"]);
}
