//! Syntax-tree constructors.
//!
//! The host hands the engine unevaluated syntax trees; there is no parser
//! here. These helpers build the `Lang`/`Sym` values the front compiler
//! consumes, for embedders and tests.
//!
//! A function literal is represented as a call to the `function` symbol:
//! named arguments are the formals (value = default expression, or
//! `Missing` for none), and the single trailing unnamed argument is the
//! body.

use crate::intern::{sym, Symbol};
use crate::value::{Arg, Lang, RVal};
use std::rc::Rc;

/// A symbol value.
#[must_use]
pub fn s(name: &str) -> RVal {
    RVal::Sym(sym(name))
}

/// An unnamed call argument.
#[must_use]
pub fn arg(value: RVal) -> Arg {
    Arg { name: None, value }
}

/// A named call argument.
#[must_use]
pub fn named(name: &str, value: RVal) -> Arg {
    Arg {
        name: Some(sym(name)),
        value,
    }
}

/// A call expression with explicit arguments.
#[must_use]
pub fn lang(fun: RVal, args: Vec<Arg>) -> RVal {
    RVal::Lang(Rc::new(Lang { fun, args }))
}

/// `f(a, b, ...)` with positional arguments and a symbol callee.
#[must_use]
pub fn call(fun: &str, args: Vec<RVal>) -> RVal {
    lang(s(fun), args.into_iter().map(arg).collect())
}

/// `{ e1; e2; ... }`
#[must_use]
pub fn block(exprs: Vec<RVal>) -> RVal {
    call("{", exprs)
}

/// `name <- value`
#[must_use]
pub fn assign(name: &str, value: RVal) -> RVal {
    call("<-", vec![s(name), value])
}

/// `name <<- value`
#[must_use]
pub fn superassign(name: &str, value: RVal) -> RVal {
    call("<<-", vec![s(name), value])
}

/// `if (cond) then` or `if (cond) then else alt`
#[must_use]
pub fn if_(cond: RVal, then: RVal, alt: Option<RVal>) -> RVal {
    let mut args = vec![cond, then];
    if let Some(alt) = alt {
        args.push(alt);
    }
    call("if", args)
}

/// `while (cond) body`
#[must_use]
pub fn while_(cond: RVal, body: RVal) -> RVal {
    call("while", vec![cond, body])
}

/// `lhs op rhs`
#[must_use]
pub fn binop(op: &str, lhs: RVal, rhs: RVal) -> RVal {
    call(op, vec![lhs, rhs])
}

/// A formal parameter spec for [`function`].
pub struct Param {
    pub name: Symbol,
    pub default: Option<RVal>,
}

/// A parameter with no default.
#[must_use]
pub fn param(name: &str) -> Param {
    Param {
        name: sym(name),
        default: None,
    }
}

/// A parameter with a default expression.
#[must_use]
pub fn param_default(name: &str, default: RVal) -> Param {
    Param {
        name: sym(name),
        default: Some(default),
    }
}

/// `function(params) body`
#[must_use]
pub fn function(params: Vec<Param>, body: RVal) -> RVal {
    let mut args: Vec<Arg> = params
        .into_iter()
        .map(|p| Arg {
            name: Some(p.name),
            value: p.default.unwrap_or(RVal::Missing),
        })
        .collect();
    args.push(arg(body));
    lang(s("function"), args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_shape() {
        let ast = call("f", vec![RVal::int(1)]);
        let RVal::Lang(l) = &ast else { panic!() };
        assert!(matches!(&l.fun, RVal::Sym(s) if *s == "f"));
        assert_eq!(l.args.len(), 1);
        assert!(l.args[0].name.is_none());
    }

    #[test]
    fn test_function_literal_shape() {
        let ast = function(vec![param("x"), param_default("y", RVal::int(1))], s("x"));
        let RVal::Lang(l) = &ast else { panic!() };
        assert_eq!(l.args.len(), 3);
        assert!(l.args[0].name.is_some());
        assert!(matches!(l.args[0].value, RVal::Missing));
        assert!(l.args[1].name.is_some());
        assert!(l.args[2].name.is_none(), "body is the unnamed tail");
    }
}
