//! Builtin shims.
//!
//! The slow paths the interpreter delegates to: full vector arithmetic with
//! recycling and NA rules, relational operators, and the small builtin set
//! the front compiler resolves statically (`stop`, `warning`, `vector`,
//! `length`, `c`). Arguments reach builtins fully evaluated.

use crate::Interp;
use rir_core::error::{RirError, Unwind};
use rir_core::value::{
    integer_minus, integer_plus, integer_times, BuiltinId, RVal, RVec, NA_INTEGER, NA_LOGICAL,
};
use std::rc::Rc;

/// Call a builtin with evaluated arguments.
pub fn call_builtin(
    interp: &mut Interp,
    id: BuiltinId,
    args: Vec<RVal>,
    call: Option<RVal>,
) -> Result<RVal, Unwind> {
    match id {
        BuiltinId::Add
        | BuiltinId::Sub
        | BuiltinId::Mul
        | BuiltinId::Div
        | BuiltinId::IDiv
        | BuiltinId::Mod
        | BuiltinId::Pow => {
            check_arity(id, &args, 2)?;
            arith(interp, id, &args[0], &args[1], call)
        }
        BuiltinId::Eq
        | BuiltinId::Ne
        | BuiltinId::Lt
        | BuiltinId::Le
        | BuiltinId::Gt
        | BuiltinId::Ge => {
            check_arity(id, &args, 2)?;
            relop(id, &args[0], &args[1])
        }
        BuiltinId::Not => {
            check_arity(id, &args, 1)?;
            not(&args[0])
        }
        BuiltinId::Stop => {
            let msg = args
                .first()
                .and_then(string_scalar)
                .unwrap_or_else(|| "error".to_string());
            Err(Unwind::Error(RirError::Host(msg)))
        }
        BuiltinId::Warning => {
            let msg = args
                .first()
                .and_then(string_scalar)
                .unwrap_or_else(|| "warning".to_string());
            interp.warn(msg, call);
            interp.visible = false;
            Ok(RVal::Null)
        }
        BuiltinId::Vector => {
            let mode = args
                .first()
                .and_then(string_scalar)
                .unwrap_or_else(|| "logical".to_string());
            let len = args.get(1).and_then(RVal::as_int_scalar).unwrap_or(0).max(0) as usize;
            alloc_vector(&mode, len)
        }
        BuiltinId::Length => {
            check_arity(id, &args, 1)?;
            Ok(RVal::int(args[0].length() as i32))
        }
        BuiltinId::Concat => concat(args),
    }
}

fn check_arity(id: BuiltinId, args: &[RVal], n: usize) -> Result<(), Unwind> {
    if args.len() == n {
        Ok(())
    } else {
        Err(Unwind::Error(RirError::Host(format!(
            "{} argument{} passed to '{}' which requires {}",
            args.len(),
            if args.len() == 1 { "" } else { "s" },
            id.name(),
            n
        ))))
    }
}

fn string_scalar(v: &RVal) -> Option<String> {
    match v {
        RVal::Str(s) if !s.data.is_empty() => Some(s.data[0].to_string()),
        _ => None,
    }
}

// =============================================================================
// Coercion
// =============================================================================

/// Numeric data widened for a binary operation.
enum Numeric {
    Int(Vec<i32>),
    Real(Vec<f64>),
}

fn as_numeric(v: &RVal) -> Result<Numeric, Unwind> {
    match v {
        RVal::Int(x) => Ok(Numeric::Int(x.data.clone())),
        RVal::Lgl(x) => Ok(Numeric::Int(
            x.data
                .iter()
                .map(|&b| if b == NA_LOGICAL { NA_INTEGER } else { b })
                .collect(),
        )),
        RVal::Real(x) => Ok(Numeric::Real(x.data.clone())),
        other => Err(Unwind::Error(RirError::Host(format!(
            "non-numeric argument to binary operator: {}",
            other.type_name()
        )))),
    }
}

fn int_to_real(x: &[i32]) -> Vec<f64> {
    x.iter()
        .map(|&v| if v == NA_INTEGER { f64::NAN } else { f64::from(v) })
        .collect()
}

#[inline]
fn recycled(len_a: usize, len_b: usize) -> usize {
    if len_a == 0 || len_b == 0 {
        0
    } else {
        len_a.max(len_b)
    }
}

// =============================================================================
// Arithmetic
// =============================================================================

/// Full vector arithmetic with recycling; the interpreter's fast path
/// handles the simple-scalar cases before falling back here.
pub fn arith(
    interp: &mut Interp,
    op: BuiltinId,
    lhs: &RVal,
    rhs: &RVal,
    call: Option<RVal>,
) -> Result<RVal, Unwind> {
    let l = as_numeric(lhs)?;
    let r = as_numeric(rhs)?;
    // Division-like operators and pow work in doubles.
    let force_real = matches!(op, BuiltinId::Div | BuiltinId::Pow);
    match (l, r) {
        (Numeric::Int(a), Numeric::Int(b)) if !force_real && !matches!(op, BuiltinId::Mod | BuiltinId::IDiv) => {
            let n = recycled(a.len(), b.len());
            let mut out = Vec::with_capacity(n);
            let mut naflag = false;
            for i in 0..n {
                let (x, y) = (a[i % a.len()], b[i % b.len()]);
                out.push(match op {
                    BuiltinId::Add => integer_plus(x, y, &mut naflag),
                    BuiltinId::Sub => integer_minus(x, y, &mut naflag),
                    BuiltinId::Mul => integer_times(x, y, &mut naflag),
                    _ => unreachable!(),
                });
            }
            if naflag {
                interp.warn("NAs produced by integer overflow", call);
            }
            Ok(RVal::Int(Rc::new(RVec::from_vec(out))))
        }
        (Numeric::Int(a), Numeric::Int(b)) if matches!(op, BuiltinId::IDiv | BuiltinId::Mod) => {
            let n = recycled(a.len(), b.len());
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let (x, y) = (a[i % a.len()], b[i % b.len()]);
                out.push(if x == NA_INTEGER || y == NA_INTEGER || y == 0 {
                    NA_INTEGER
                } else if matches!(op, BuiltinId::IDiv) {
                    (f64::from(x) / f64::from(y)).floor() as i32
                } else {
                    x - (f64::from(x) / f64::from(y)).floor() as i32 * y
                });
            }
            Ok(RVal::Int(Rc::new(RVec::from_vec(out))))
        }
        (l, r) => {
            let a = match l {
                Numeric::Int(x) => int_to_real(&x),
                Numeric::Real(x) => x,
            };
            let b = match r {
                Numeric::Int(x) => int_to_real(&x),
                Numeric::Real(x) => x,
            };
            let n = recycled(a.len(), b.len());
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let (x, y) = (a[i % a.len()], b[i % b.len()]);
                out.push(real_op(op, x, y));
            }
            Ok(RVal::Real(Rc::new(RVec::from_vec(out))))
        }
    }
}

fn real_op(op: BuiltinId, x: f64, y: f64) -> f64 {
    match op {
        BuiltinId::Add => x + y,
        BuiltinId::Sub => x - y,
        BuiltinId::Mul => x * y,
        BuiltinId::Div => x / y,
        BuiltinId::Pow => x.powf(y),
        BuiltinId::IDiv => (x / y).floor(),
        BuiltinId::Mod => {
            if y == 0.0 {
                f64::NAN
            } else {
                let q = (x / y).floor();
                x - q * y
            }
        }
        _ => unreachable!(),
    }
}

// =============================================================================
// Comparison
// =============================================================================

/// Relational operators over numeric and string vectors.
pub fn relop(op: BuiltinId, lhs: &RVal, rhs: &RVal) -> Result<RVal, Unwind> {
    if let (RVal::Str(a), RVal::Str(b)) = (lhs, rhs) {
        let n = recycled(a.len(), b.len());
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let (x, y) = (&a.data[i % a.len()], &b.data[i % b.len()]);
            out.push(cmp_result(op, x.as_ref().cmp(y.as_ref())) as i32);
        }
        return Ok(RVal::Lgl(Rc::new(RVec::from_vec(out))));
    }
    let (a, b) = (as_numeric(lhs)?, as_numeric(rhs)?);
    let a = match a {
        Numeric::Int(x) => int_to_real(&x),
        Numeric::Real(x) => x,
    };
    let b = match b {
        Numeric::Int(x) => int_to_real(&x),
        Numeric::Real(x) => x,
    };
    let n = recycled(a.len(), b.len());
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let (x, y) = (a[i % a.len()], b[i % b.len()]);
        if x.is_nan() || y.is_nan() {
            out.push(NA_LOGICAL);
        } else {
            let r = match op {
                BuiltinId::Eq => x == y,
                BuiltinId::Ne => x != y,
                BuiltinId::Lt => x < y,
                BuiltinId::Le => x <= y,
                BuiltinId::Gt => x > y,
                BuiltinId::Ge => x >= y,
                _ => unreachable!(),
            };
            out.push(r as i32);
        }
    }
    Ok(RVal::Lgl(Rc::new(RVec::from_vec(out))))
}

fn cmp_result(op: BuiltinId, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BuiltinId::Eq => ord == Equal,
        BuiltinId::Ne => ord != Equal,
        BuiltinId::Lt => ord == Less,
        BuiltinId::Le => ord != Greater,
        BuiltinId::Gt => ord == Greater,
        BuiltinId::Ge => ord != Less,
        _ => unreachable!(),
    }
}

/// Logical negation.
pub fn not(v: &RVal) -> Result<RVal, Unwind> {
    let data: Vec<i32> = match v {
        RVal::Lgl(x) => x.data.clone(),
        RVal::Int(x) => x
            .data
            .iter()
            .map(|&i| if i == NA_INTEGER { NA_LOGICAL } else { (i != 0) as i32 })
            .collect(),
        RVal::Real(x) => x
            .data
            .iter()
            .map(|&f| if f.is_nan() { NA_LOGICAL } else { (f != 0.0) as i32 })
            .collect(),
        other => {
            return Err(Unwind::Error(RirError::Host(format!(
                "invalid argument type to '!': {}",
                other.type_name()
            ))))
        }
    };
    let out = data
        .into_iter()
        .map(|b| if b == NA_LOGICAL { NA_LOGICAL } else { (b == 0) as i32 })
        .collect();
    Ok(RVal::Lgl(Rc::new(RVec::from_vec(out))))
}

// =============================================================================
// Allocation and concatenation
// =============================================================================

fn alloc_vector(mode: &str, len: usize) -> Result<RVal, Unwind> {
    match mode {
        "logical" => Ok(RVal::Lgl(Rc::new(RVec::from_vec(vec![0; len])))),
        "integer" => Ok(RVal::Int(Rc::new(RVec::from_vec(vec![0; len])))),
        "double" | "numeric" => Ok(RVal::Real(Rc::new(RVec::from_vec(vec![0.0; len])))),
        "character" => Ok(RVal::Str(Rc::new(RVec::from_vec(vec!["".into(); len])))),
        other => Err(Unwind::Error(RirError::Host(format!(
            "vector: cannot make a vector of mode '{other}'"
        )))),
    }
}

fn concat(args: Vec<RVal>) -> Result<RVal, Unwind> {
    #[derive(PartialEq, PartialOrd, Clone, Copy)]
    enum Mode {
        Lgl,
        Int,
        Real,
        Str,
    }
    let mut mode = Mode::Lgl;
    for a in &args {
        let m = match a {
            RVal::Null => continue,
            RVal::Lgl(_) => Mode::Lgl,
            RVal::Int(_) => Mode::Int,
            RVal::Real(_) => Mode::Real,
            RVal::Str(_) => Mode::Str,
            other => {
                return Err(Unwind::Error(RirError::Host(format!(
                    "c: cannot combine {}",
                    other.type_name()
                ))))
            }
        };
        if m > mode {
            mode = m;
        }
    }
    match mode {
        Mode::Str => {
            let mut out: Vec<Rc<str>> = Vec::new();
            for a in &args {
                match a {
                    RVal::Null => {}
                    RVal::Str(x) => out.extend(x.data.iter().cloned()),
                    RVal::Int(x) => out.extend(x.data.iter().map(|v| {
                        if *v == NA_INTEGER {
                            "NA".into()
                        } else {
                            v.to_string().into()
                        }
                    })),
                    RVal::Real(x) => out.extend(x.data.iter().map(|v| v.to_string().into())),
                    RVal::Lgl(x) => out.extend(x.data.iter().map(|v| {
                        match *v {
                            NA_LOGICAL => "NA".into(),
                            0 => "FALSE".into(),
                            _ => "TRUE".into(),
                        }
                    })),
                    _ => unreachable!(),
                }
            }
            Ok(RVal::Str(Rc::new(RVec::from_vec(out))))
        }
        Mode::Real => {
            let mut out: Vec<f64> = Vec::new();
            for a in &args {
                match a {
                    RVal::Null => {}
                    RVal::Real(x) => out.extend(&x.data),
                    RVal::Int(x) => out.extend(int_to_real(&x.data)),
                    RVal::Lgl(x) => out.extend(int_to_real(&x.data)),
                    _ => unreachable!(),
                }
            }
            Ok(RVal::Real(Rc::new(RVec::from_vec(out))))
        }
        Mode::Int | Mode::Lgl => {
            let mut out: Vec<i32> = Vec::new();
            let mut any_int = false;
            for a in &args {
                match a {
                    RVal::Null => {}
                    RVal::Int(x) => {
                        any_int = true;
                        out.extend(&x.data);
                    }
                    RVal::Lgl(x) => out.extend(x.data.iter().map(|&b| {
                        if b == NA_LOGICAL {
                            NA_INTEGER
                        } else {
                            b
                        }
                    })),
                    _ => unreachable!(),
                }
            }
            if any_int || mode == Mode::Int {
                Ok(RVal::Int(Rc::new(RVec::from_vec(out))))
            } else {
                Ok(RVal::Lgl(Rc::new(RVec::from_vec(out))))
            }
        }
    }
}
