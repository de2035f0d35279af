//! The RIR stack interpreter and its runtime.
//!
//! One [`Interp`] is the single logical execution context of the engine: it
//! owns the process pools, the operand stack, the warning sink, and the
//! global environment. The interpreter, the optimizer trigger, and the
//! deoptimization runtime all run on it cooperatively; nothing here is
//! preemptible.

pub mod api;
pub mod builtins;
pub mod call;
pub mod deopt;
pub mod dispatch;
pub mod interp;
pub mod opt_bridge;
pub mod ostack;

use rir_core::error::Warning;
use rir_core::intern::Symbol;
use rir_core::pool::{ConstPool, SrcPool};
use rir_core::value::{BuiltinId, Env, RVal};
use rustc_hash::FxHashSet;

/// Hook the interpreter invokes on a hot closure.
pub type OptimizerHook = fn(&mut Interp, &RVal, Option<&Symbol>);

/// The global execution context.
pub struct Interp {
    pub cp: ConstPool,
    pub sp: SrcPool,
    pub ostack: ostack::OStack,
    /// Warnings in emission order.
    pub warnings: Vec<Warning>,
    /// Call sites that already warned about integer overflow.
    pub(crate) warned_overflow: FxHashSet<(usize, u32)>,
    /// The visibility flag of the most recent value.
    pub visible: bool,
    /// User environment; its parent binds the builtins.
    pub global_env: Env,
    pub(crate) optimizer: Option<OptimizerHook>,
}

impl Interp {
    /// A fresh context with the builtin environment installed.
    #[must_use]
    pub fn new() -> Interp {
        let base = Env::new(None);
        for id in [
            BuiltinId::Add,
            BuiltinId::Sub,
            BuiltinId::Mul,
            BuiltinId::Div,
            BuiltinId::IDiv,
            BuiltinId::Mod,
            BuiltinId::Pow,
            BuiltinId::Eq,
            BuiltinId::Ne,
            BuiltinId::Lt,
            BuiltinId::Le,
            BuiltinId::Gt,
            BuiltinId::Ge,
            BuiltinId::Not,
            BuiltinId::Stop,
            BuiltinId::Warning,
            BuiltinId::Vector,
            BuiltinId::Length,
            BuiltinId::Concat,
        ] {
            base.define(rir_core::intern::sym(id.name()), RVal::Builtin(id));
        }
        let global_env = Env::new(Some(base));
        let mut interp = Interp {
            cp: ConstPool::new(),
            sp: SrcPool::new(),
            ostack: ostack::OStack::new(),
            warnings: Vec::new(),
            warned_overflow: FxHashSet::default(),
            visible: true,
            global_env,
            optimizer: None,
        };
        opt_bridge::install(&mut interp);
        interp
    }

    /// Record a warning against a call.
    pub fn warn(&mut self, message: impl Into<String>, call: Option<RVal>) {
        self.warnings.push(Warning {
            message: message.into(),
            call,
        });
    }
}

impl Default for Interp {
    fn default() -> Self {
        Self::new()
    }
}
