//! PIR instructions.
//!
//! One tagged enum covers the whole instruction taxonomy; shared behavior
//! (result types, effect sets, input lists) lives in functions dispatched on
//! the tag rather than in a class hierarchy. Instructions live in the
//! owning version's arena and reference each other through [`Val`].

use crate::pir::effects::Effects;
use crate::pir::module::PromId;
use crate::pir::types::PirType;
use crate::pir::bb::BBId;
use rir_core::feedback::ObservedType;
use rir_core::intern::Symbol;
use rir_core::pool::{PoolIdx, SrcIdx};
use rir_core::value::BuiltinId;
use smallvec::SmallVec;
use std::fmt;

/// Arena index of an instruction within one closure version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(pub u32);

/// Anything an instruction may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Val {
    /// The result of another instruction.
    Instr(InstrId),
    /// The elided environment: proof that no environment is needed.
    ElidedEnv,
    /// The missing-argument sentinel.
    MissingArg,
}

impl Val {
    #[inline]
    #[must_use]
    pub fn instr(self) -> Option<InstrId> {
        match self {
            Val::Instr(id) => Some(id),
            _ => None,
        }
    }
}

/// Binary operators with host dispatch semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinopKind {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LglAnd,
    LglOr,
}

impl BinopKind {
    /// Comparison operators always produce a logical.
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinopKind::Eq
                | BinopKind::Ne
                | BinopKind::Lt
                | BinopKind::Le
                | BinopKind::Gt
                | BinopKind::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnopKind {
    Not,
    Plus,
    Minus,
}

/// The instruction taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    /// A constant-pool value.
    LdConst(PoolIdx),
    /// The lexical environment of the function being compiled.
    LdFunEnv,
    /// Variable read; result may be promise-wrapped.
    LdVar { name: Symbol, env: Val },
    LdVarSuper { name: Symbol, env: Val },
    /// Function lookup: skips non-function bindings.
    LdFun { name: Symbol, env: Val },
    /// Read the i-th actual argument of the current call.
    LdArg(u32),
    StVar { name: Symbol, val: Val, env: Val },
    StVarSuper { name: Symbol, val: Val, env: Val },
    /// Is the named argument missing in `env`?
    Missing { name: Symbol, env: Val },
    /// Evaluate a promise to its value; identity on ordinary values.
    Force { val: Val },
    /// Wrap a promise region into an argument promise.
    MkArg { prom: PromId, eager: Val, env: Val },
    /// Materialize a closure from a compiled prototype constant.
    MkCls { proto: PoolIdx, env: Val },
    /// Materialize an environment with the given bindings.
    MkEnv {
        parent: Val,
        names: Vec<Symbol>,
        values: SmallVec<[Val; 4]>,
    },
    /// SSA join; one input per predecessor of the owning block.
    Phi {
        inputs: SmallVec<[(BBId, Val); 2]>,
    },
    Binop {
        op: BinopKind,
        lhs: Val,
        rhs: Val,
        env: Val,
        src: SrcIdx,
    },
    Unop {
        op: UnopKind,
        val: Val,
        env: Val,
        src: SrcIdx,
    },
    IsObject(Val),
    Identical(Val, Val),
    Is { type_tag: u32, val: Val },
    CheckMissing(Val),
    /// Runtime coercion to a stricter type than the producer guarantees.
    CastType { val: Val, to: PirType },
    Call {
        callee: Val,
        args: SmallVec<[Val; 4]>,
        env: Val,
        ast: PoolIdx,
    },
    NamedCall {
        callee: Val,
        args: SmallVec<[Val; 4]>,
        names: PoolIdx,
        env: Val,
        ast: PoolIdx,
    },
    /// Call of a statically resolved, compiled closure version.
    StaticCall {
        callee: PoolIdx,
        args: SmallVec<[Val; 4]>,
        env: Val,
        ast: PoolIdx,
    },
    CallBuiltin {
        builtin: BuiltinId,
        args: SmallVec<[Val; 4]>,
        env: Val,
        ast: PoolIdx,
    },
    /// Builtin call proven independent of any environment.
    CallSafeBuiltin {
        builtin: BuiltinId,
        args: SmallVec<[Val; 4]>,
        ast: PoolIdx,
    },

    // Terminators.
    /// Two successors: 0 when true, 1 when false.
    Branch(Val),
    /// One successor.
    Jump,
    Return(Val),
    /// Reconstruct the baseline frame at `pc` with the given live stack.
    Deopt {
        pc: u32,
        env: Val,
        stack: SmallVec<[Val; 4]>,
    },
}

/// An SSA node: kind, result type, effect set, optional type feedback.
#[derive(Debug, Clone)]
pub struct Instr {
    pub kind: InstrKind,
    pub ty: PirType,
    pub effects: Effects,
    /// Observed operand types propagated from RIR feedback.
    pub feedback: Option<ObservedType>,
}

impl Instr {
    /// Build an instruction with its table-driven base type and effects.
    #[must_use]
    pub fn new(kind: InstrKind) -> Instr {
        let ty = base_type(&kind);
        let effects = base_effects(&kind);
        Instr {
            kind,
            ty,
            effects,
            feedback: None,
        }
    }

    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::Branch(_) | InstrKind::Jump | InstrKind::Return(_) | InstrKind::Deopt { .. }
        )
    }

    #[must_use]
    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstrKind::Phi { .. })
    }

    /// All value inputs, in positional order.
    #[must_use]
    pub fn inputs(&self) -> SmallVec<[Val; 4]> {
        use InstrKind::*;
        let mut out = SmallVec::new();
        match &self.kind {
            LdConst(_) | LdFunEnv | LdArg(_) | Jump => {}
            LdVar { env, .. } | LdVarSuper { env, .. } | LdFun { name: _, env }
            | Missing { env, .. } => out.push(*env),
            StVar { val, env, .. } | StVarSuper { val, env, .. } => {
                out.push(*val);
                out.push(*env);
            }
            Force { val } => out.push(*val),
            MkArg { eager, env, .. } => {
                out.push(*eager);
                out.push(*env);
            }
            MkCls { env, .. } => out.push(*env),
            MkEnv { parent, values, .. } => {
                out.push(*parent);
                out.extend(values.iter().copied());
            }
            Phi { inputs } => out.extend(inputs.iter().map(|(_, v)| *v)),
            Binop { lhs, rhs, env, .. } => {
                out.push(*lhs);
                out.push(*rhs);
                out.push(*env);
            }
            Unop { val, env, .. } => {
                out.push(*val);
                out.push(*env);
            }
            IsObject(v) | Is { val: v, .. } | CheckMissing(v) | CastType { val: v, .. }
            | Branch(v) | Return(v) => out.push(*v),
            Identical(a, b) => {
                out.push(*a);
                out.push(*b);
            }
            Call { callee, args, env, .. } | NamedCall { callee, args, env, .. } => {
                out.push(*callee);
                out.extend(args.iter().copied());
                out.push(*env);
            }
            StaticCall { args, env, .. } | CallBuiltin { args, env, .. } => {
                out.extend(args.iter().copied());
                out.push(*env);
            }
            CallSafeBuiltin { args, .. } => out.extend(args.iter().copied()),
            Deopt { env, stack, .. } => {
                out.push(*env);
                out.extend(stack.iter().copied());
            }
        }
        out
    }

    /// Rewrite every input through `f`.
    pub fn map_inputs(&mut self, mut f: impl FnMut(Val) -> Val) {
        use InstrKind::*;
        match &mut self.kind {
            LdConst(_) | LdFunEnv | LdArg(_) | Jump => {}
            LdVar { env, .. } | LdVarSuper { env, .. } | LdFun { name: _, env }
            | Missing { env, .. } => *env = f(*env),
            StVar { val, env, .. } | StVarSuper { val, env, .. } => {
                *val = f(*val);
                *env = f(*env);
            }
            Force { val } => *val = f(*val),
            MkArg { eager, env, .. } => {
                *eager = f(*eager);
                *env = f(*env);
            }
            MkCls { env, .. } => *env = f(*env),
            MkEnv { parent, values, .. } => {
                *parent = f(*parent);
                for v in values {
                    *v = f(*v);
                }
            }
            Phi { inputs } => {
                for (_, v) in inputs {
                    *v = f(*v);
                }
            }
            Binop { lhs, rhs, env, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
                *env = f(*env);
            }
            Unop { val, env, .. } => {
                *val = f(*val);
                *env = f(*env);
            }
            IsObject(v) | Is { val: v, .. } | CheckMissing(v) | CastType { val: v, .. }
            | Branch(v) | Return(v) => *v = f(*v),
            Identical(a, b) => {
                *a = f(*a);
                *b = f(*b);
            }
            Call { callee, args, env, .. } | NamedCall { callee, args, env, .. } => {
                *callee = f(*callee);
                for a in args {
                    *a = f(*a);
                }
                *env = f(*env);
            }
            StaticCall { args, env, .. } | CallBuiltin { args, env, .. } => {
                for a in args {
                    *a = f(*a);
                }
                *env = f(*env);
            }
            CallSafeBuiltin { args, .. } => {
                for a in args {
                    *a = f(*a);
                }
            }
            Deopt { env, stack, .. } => {
                *env = f(*env);
                for v in stack {
                    *v = f(*v);
                }
            }
        }
    }

    /// The environment operand, if the instruction has one.
    #[must_use]
    pub fn env(&self) -> Option<Val> {
        use InstrKind::*;
        match &self.kind {
            LdVar { env, .. }
            | LdVarSuper { env, .. }
            | LdFun { env, .. }
            | Missing { env, .. }
            | StVar { env, .. }
            | StVarSuper { env, .. }
            | MkArg { env, .. }
            | MkCls { env, .. }
            | Binop { env, .. }
            | Unop { env, .. }
            | Call { env, .. }
            | NamedCall { env, .. }
            | StaticCall { env, .. }
            | CallBuiltin { env, .. }
            | Deopt { env, .. } => Some(*env),
            _ => None,
        }
    }
}

/// Result type keyed by tag, before any refinement.
fn base_type(kind: &InstrKind) -> PirType {
    use InstrKind::*;
    match kind {
        LdFunEnv | MkEnv { .. } => PirType::env(),
        LdVar { .. } | LdVarSuper { .. } => PirType::any(),
        LdFun { .. } => PirType::closure(),
        LdArg(_) => PirType::any(),
        LdConst(_) => PirType::val(),
        StVar { .. } | StVarSuper { .. } | Branch(_) | Jump | Return(_) | Deopt { .. } => {
            PirType::voyd()
        }
        Missing { .. } | IsObject(_) | Identical(..) | Is { .. } => PirType::scalar_lgl(),
        CheckMissing(_) => PirType::voyd(),
        Force { .. } => PirType::val(),
        MkArg { .. } => PirType::any(),
        MkCls { .. } => PirType::closure(),
        Phi { .. } => PirType::voyd(), // recomputed as the join of inputs
        Binop { op, .. } => {
            if op.is_comparison() {
                PirType::scalar_lgl()
            } else {
                PirType::val()
            }
        }
        Unop { op: UnopKind::Not, .. } => PirType::scalar_lgl(),
        Unop { .. } => PirType::val(),
        CastType { to, .. } => *to,
        Call { .. } | NamedCall { .. } | StaticCall { .. } | CallBuiltin { .. }
        | CallSafeBuiltin { .. } => PirType::val(),
    }
}

/// Effect set keyed by tag; conservative upper bounds.
fn base_effects(kind: &InstrKind) -> Effects {
    use InstrKind::*;
    match kind {
        LdConst(_) | LdFunEnv | LdArg(_) | Phi { .. } | IsObject(_) | Identical(..)
        | Is { .. } | CastType { .. } | Jump => Effects::none(),
        LdVar { .. } | LdVarSuper { .. } => Effects::READS_ENV | Effects::ERROR,
        LdFun { .. } => Effects::READS_ENV | Effects::ERROR | Effects::FORCE,
        Missing { .. } => Effects::READS_ENV,
        StVar { .. } | StVarSuper { .. } => Effects::WRITES_ENV,
        CheckMissing(_) => Effects::ERROR,
        Force { .. } => {
            Effects::FORCE | Effects::EXECUTE_CODE | Effects::ERROR | Effects::REFLECTION
        }
        // The promise closes over the environment.
        MkArg { .. } => Effects::LEAKS_ENV | Effects::LEAK_ARG,
        MkCls { .. } => Effects::LEAKS_ENV,
        MkEnv { .. } => Effects::none(),
        Binop { env, .. } | Unop { env, .. } => {
            if matches!(env, Val::ElidedEnv) {
                // Fast-path arithmetic can still warn (integer overflow)
                // and error (invalid operand shapes).
                Effects::WARN | Effects::ERROR
            } else {
                Effects::any()
            }
        }
        Call { .. } | NamedCall { .. } | StaticCall { .. } | CallBuiltin { .. } => Effects::call(),
        CallSafeBuiltin { .. } => Effects::WARN | Effects::ERROR,
        Branch(_) => Effects::none(),
        Return(_) => Effects::none(),
        Deopt { .. } => Effects::TRIGGER_DEOPT | Effects::LEAKS_ENV,
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Instr(id) => write!(f, "%{}", id.0),
            Val::ElidedEnv => write!(f, "elided"),
            Val::MissingArg => write!(f, "missing"),
        }
    }
}
