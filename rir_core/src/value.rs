//! Host value shim.
//!
//! The engine proper treats host values as opaque; this module supplies the
//! minimal R-like model the core consumes through its narrow interface:
//! attributed vectors with NA semantics, symbols, call syntax trees,
//! closures, builtins, promises, and first-class environments.
//!
//! Values are reference counted and cheap to clone. Environments and
//! promises use interior mutability; everything else is immutable once
//! built. The engine is single-threaded (see the concurrency model), so
//! `Rc`/`RefCell` is the intended sharing discipline.

use crate::function::DispatchTable;
use crate::intern::Symbol;
use crate::code::Code;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Integer NA, matching the host's sentinel.
pub const NA_INTEGER: i32 = i32::MIN;
/// Logical NA. Logicals are stored as `i32` with this sentinel.
pub const NA_LOGICAL: i32 = i32::MIN;
/// Real NA. Any NaN payload is accepted on read.
pub const NA_REAL: f64 = f64::NAN;

// =============================================================================
// Vectors
// =============================================================================

/// An attributed vector. Length-1 vectors with no attributes are "simple
/// scalars" and eligible for the interpreter's fast arithmetic paths.
#[derive(Debug, Clone)]
pub struct RVec<T> {
    pub data: Vec<T>,
    pub attribs: Vec<(Symbol, RVal)>,
}

impl<T> RVec<T> {
    #[must_use]
    pub fn scalar(v: T) -> Self {
        Self {
            data: vec![v],
            attribs: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            data,
            attribs: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length 1 and no attributes.
    #[inline]
    #[must_use]
    pub fn is_simple_scalar(&self) -> bool {
        self.data.len() == 1 && self.attribs.is_empty()
    }

    #[must_use]
    pub fn get_attrib(&self, name: &Symbol) -> Option<&RVal> {
        self.attribs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn set_attrib(&mut self, name: Symbol, value: RVal) {
        if let Some(slot) = self.attribs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.attribs.push((name, value));
        }
    }
}

// =============================================================================
// Syntax trees
// =============================================================================

/// One argument in a call expression, optionally named.
#[derive(Debug, Clone)]
pub struct Arg {
    pub name: Option<Symbol>,
    pub value: RVal,
}

/// A call expression: function position plus arguments.
#[derive(Debug, Clone)]
pub struct Lang {
    pub fun: RVal,
    pub args: Vec<Arg>,
}

// =============================================================================
// Closures
// =============================================================================

/// One formal parameter: name and optional default expression.
#[derive(Debug, Clone)]
pub struct Formal {
    pub name: Symbol,
    pub default: Option<RVal>,
}

/// The body of a closure: raw syntax until the front compiler runs, a
/// dispatch table afterwards. `rir_compile` swaps the body in place.
#[derive(Debug)]
pub enum ClosureBody {
    Ast(RVal),
    Compiled(Rc<DispatchTable>),
}

/// A surface closure: formals, body, defining environment.
#[derive(Debug)]
pub struct RClosure {
    pub formals: Vec<Formal>,
    pub body: RefCell<ClosureBody>,
    pub env: Env,
}

impl RClosure {
    /// The dispatch table, if the closure has been front-compiled.
    #[must_use]
    pub fn dispatch_table(&self) -> Option<Rc<DispatchTable>> {
        match &*self.body.borrow() {
            ClosureBody::Compiled(dt) => Some(Rc::clone(dt)),
            ClosureBody::Ast(_) => None,
        }
    }
}

// =============================================================================
// Builtins
// =============================================================================

/// Identity of a host builtin. Implementations live in the interpreter
/// crate; the core only carries the identity and its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinId {
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
    Not,
    Stop,
    Warning,
    Vector,
    Length,
    Concat,
}

impl BuiltinId {
    /// Surface name of the builtin.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            BuiltinId::Add => "+",
            BuiltinId::Sub => "-",
            BuiltinId::Mul => "*",
            BuiltinId::Div => "/",
            BuiltinId::IDiv => "%/%",
            BuiltinId::Mod => "%%",
            BuiltinId::Pow => "^",
            BuiltinId::Eq => "==",
            BuiltinId::Ne => "!=",
            BuiltinId::Lt => "<",
            BuiltinId::Le => "<=",
            BuiltinId::Gt => ">",
            BuiltinId::Ge => ">=",
            BuiltinId::Not => "!",
            BuiltinId::Stop => "stop",
            BuiltinId::Warning => "warning",
            BuiltinId::Vector => "vector",
            BuiltinId::Length => "length",
            BuiltinId::Concat => "c",
        }
    }

    /// Safe builtins have no environment dependence and no reflective
    /// behavior; the optimizer may call them without materializing an
    /// environment.
    #[must_use]
    pub const fn is_safe(self) -> bool {
        matches!(
            self,
            BuiltinId::Vector | BuiltinId::Length | BuiltinId::Concat
        )
    }

    /// Look a builtin up by its surface name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "+" => BuiltinId::Add,
            "-" => BuiltinId::Sub,
            "*" => BuiltinId::Mul,
            "/" => BuiltinId::Div,
            "%/%" => BuiltinId::IDiv,
            "%%" => BuiltinId::Mod,
            "^" => BuiltinId::Pow,
            "==" => BuiltinId::Eq,
            "!=" => BuiltinId::Ne,
            "<" => BuiltinId::Lt,
            "<=" => BuiltinId::Le,
            ">" => BuiltinId::Gt,
            ">=" => BuiltinId::Ge,
            "!" => BuiltinId::Not,
            "stop" => BuiltinId::Stop,
            "warning" => BuiltinId::Warning,
            "vector" => BuiltinId::Vector,
            "length" => BuiltinId::Length,
            "c" => BuiltinId::Concat,
            _ => return None,
        })
    }
}

// =============================================================================
// Promises
// =============================================================================

/// Body of a promise: raw syntax, or a compiled promise code object.
#[derive(Debug, Clone)]
pub enum PromiseBody {
    Ast(RVal),
    Code(Rc<Code>),
}

/// A delayed computation paired with its defining environment. Forcing is
/// memoized: once a value is present the environment link is dropped.
#[derive(Debug)]
pub struct Promise {
    pub body: PromiseBody,
    pub env: RefCell<Option<Env>>,
    value: RefCell<Option<RVal>>,
    being_forced: Cell<bool>,
}

impl Promise {
    #[must_use]
    pub fn new(body: PromiseBody, env: Env) -> Self {
        Self {
            body,
            env: RefCell::new(Some(env)),
            value: RefCell::new(None),
            being_forced: Cell::new(false),
        }
    }

    /// The memoized value, if the promise has been forced.
    #[must_use]
    pub fn value(&self) -> Option<RVal> {
        self.value.borrow().clone()
    }

    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// Record the forced value and release the environment.
    pub fn fulfill(&self, v: RVal) {
        *self.value.borrow_mut() = Some(v);
        *self.env.borrow_mut() = None;
        self.being_forced.set(false);
    }

    /// Guard against cyclic forcing. Returns false if already in progress.
    pub fn begin_force(&self) -> bool {
        if self.being_forced.get() {
            return false;
        }
        self.being_forced.set(true);
        true
    }

    /// Forcing unwound without a value; allow a later retry.
    pub fn abort_force(&self) {
        self.being_forced.set(false);
    }
}

// =============================================================================
// Environments
// =============================================================================

/// A binding cell. Cells are shared so that a cached cell and the frame see
/// the same slot.
pub type BindingCell = Rc<RefCell<Binding>>;

#[derive(Debug, Clone)]
pub struct Binding {
    pub value: RVal,
    pub missing: bool,
    pub locked: bool,
}

impl Binding {
    #[must_use]
    pub fn new(value: RVal) -> Self {
        Self {
            value,
            missing: false,
            locked: false,
        }
    }

    #[must_use]
    pub fn missing_arg() -> Self {
        Self {
            value: RVal::Missing,
            missing: true,
            locked: false,
        }
    }
}

#[derive(Debug)]
struct EnvData {
    parent: Option<Env>,
    frame: RefCell<FxHashMap<Symbol, BindingCell>>,
}

/// A first-class environment: name to binding-cell map with a parent link.
/// Cloning shares the frame; equality is identity.
#[derive(Clone)]
pub struct Env(Rc<EnvData>);

impl Env {
    #[must_use]
    pub fn new(parent: Option<Env>) -> Self {
        Env(Rc::new(EnvData {
            parent,
            frame: RefCell::new(FxHashMap::default()),
        }))
    }

    #[must_use]
    pub fn parent(&self) -> Option<Env> {
        self.0.parent.clone()
    }

    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    #[must_use]
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// The binding cell for `name` in this frame only.
    #[must_use]
    pub fn local_cell(&self, name: &Symbol) -> Option<BindingCell> {
        self.0.frame.borrow().get(name).cloned()
    }

    /// The binding cell for `name`, searching enclosing frames.
    #[must_use]
    pub fn find_cell(&self, name: &Symbol) -> Option<BindingCell> {
        let mut env = Some(self.clone());
        while let Some(e) = env {
            if let Some(cell) = e.local_cell(name) {
                return Some(cell);
            }
            env = e.parent();
        }
        None
    }

    /// Bind `name` in this frame, creating or overwriting the cell value.
    pub fn define(&self, name: Symbol, value: RVal) {
        let mut frame = self.0.frame.borrow_mut();
        match frame.get(&name) {
            Some(cell) => {
                let mut b = cell.borrow_mut();
                b.value = value;
                b.missing = false;
            }
            None => {
                frame.insert(name, Rc::new(RefCell::new(Binding::new(value))));
            }
        }
    }

    /// Install a pre-built binding cell (used for missing-argument slots).
    pub fn define_cell(&self, name: Symbol, cell: BindingCell) {
        self.0.frame.borrow_mut().insert(name, cell);
    }

    /// Read `name`, searching enclosing frames. Does not force promises.
    #[must_use]
    pub fn get(&self, name: &Symbol) -> Option<RVal> {
        self.find_cell(name).map(|c| c.borrow().value.clone())
    }

    /// Superassignment: set `name` in the nearest enclosing frame that binds
    /// it, or define it in the outermost frame.
    pub fn set_super(&self, name: Symbol, value: RVal) {
        let mut env = self.parent();
        let mut last = self.clone();
        while let Some(e) = env {
            if let Some(cell) = e.local_cell(&name) {
                let mut b = cell.borrow_mut();
                b.value = value;
                b.missing = false;
                return;
            }
            last = e.clone();
            env = e.parent();
        }
        last.define(name, value);
    }

    /// Names bound in this frame (unordered).
    #[must_use]
    pub fn local_names(&self) -> Vec<Symbol> {
        self.0.frame.borrow().keys().cloned().collect()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<env {:p}>", Rc::as_ptr(&self.0))
    }
}

// =============================================================================
// Values
// =============================================================================

/// A host value.
#[derive(Clone)]
pub enum RVal {
    Null,
    /// The explicitly-missing-argument sentinel.
    Missing,
    Int(Rc<RVec<i32>>),
    Real(Rc<RVec<f64>>),
    Lgl(Rc<RVec<i32>>),
    Str(Rc<RVec<Rc<str>>>),
    /// Raw byte vector; carries deopt metadata blobs in the constant pool.
    Raw(Rc<Vec<u8>>),
    Sym(Symbol),
    Lang(Rc<Lang>),
    Closure(Rc<RClosure>),
    Builtin(BuiltinId),
    Promise(Rc<Promise>),
    Env(Env),
}

impl RVal {
    // -- constructors ---------------------------------------------------------

    #[must_use]
    pub fn int(v: i32) -> RVal {
        RVal::Int(Rc::new(RVec::scalar(v)))
    }

    #[must_use]
    pub fn real(v: f64) -> RVal {
        RVal::Real(Rc::new(RVec::scalar(v)))
    }

    #[must_use]
    pub fn lgl(v: bool) -> RVal {
        RVal::Lgl(Rc::new(RVec::scalar(v as i32)))
    }

    #[must_use]
    pub fn lgl_na() -> RVal {
        RVal::Lgl(Rc::new(RVec::scalar(NA_LOGICAL)))
    }

    #[must_use]
    pub fn int_na() -> RVal {
        RVal::Int(Rc::new(RVec::scalar(NA_INTEGER)))
    }

    #[must_use]
    pub fn string(s: &str) -> RVal {
        RVal::Str(Rc::new(RVec::scalar(s.into())))
    }

    #[must_use]
    pub fn ints(v: Vec<i32>) -> RVal {
        RVal::Int(Rc::new(RVec::from_vec(v)))
    }

    #[must_use]
    pub fn reals(v: Vec<f64>) -> RVal {
        RVal::Real(Rc::new(RVec::from_vec(v)))
    }

    // -- classification -------------------------------------------------------

    /// Human-readable type name, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            RVal::Null => "NULL",
            RVal::Missing => "missing",
            RVal::Int(_) => "integer",
            RVal::Real(_) => "double",
            RVal::Lgl(_) => "logical",
            RVal::Str(_) => "character",
            RVal::Raw(_) => "raw",
            RVal::Sym(_) => "symbol",
            RVal::Lang(_) => "language",
            RVal::Closure(_) => "closure",
            RVal::Builtin(_) => "builtin",
            RVal::Promise(_) => "promise",
            RVal::Env(_) => "environment",
        }
    }

    /// An object carries a class attribute and dispatches through the host.
    #[must_use]
    pub fn is_object(&self) -> bool {
        let class = crate::intern::sym("class");
        match self {
            RVal::Int(v) => v.get_attrib(&class).is_some(),
            RVal::Real(v) => v.get_attrib(&class).is_some(),
            RVal::Lgl(v) => v.get_attrib(&class).is_some(),
            RVal::Str(v) => v.get_attrib(&class).is_some(),
            _ => false,
        }
    }

    /// True for any attributed vector, object or not.
    #[must_use]
    pub fn has_attribs(&self) -> bool {
        match self {
            RVal::Int(v) => !v.attribs.is_empty(),
            RVal::Real(v) => !v.attribs.is_empty(),
            RVal::Lgl(v) => !v.attribs.is_empty(),
            RVal::Str(v) => !v.attribs.is_empty(),
            _ => false,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_function(&self) -> bool {
        matches!(self, RVal::Closure(_) | RVal::Builtin(_))
    }

    // -- scalar access --------------------------------------------------------

    /// A simple scalar integer: length 1, no attributes.
    #[must_use]
    pub fn as_int_scalar(&self) -> Option<i32> {
        match self {
            RVal::Int(v) if v.is_simple_scalar() => Some(v.data[0]),
            _ => None,
        }
    }

    /// A simple scalar real: length 1, no attributes.
    #[must_use]
    pub fn as_real_scalar(&self) -> Option<f64> {
        match self {
            RVal::Real(v) if v.is_simple_scalar() => Some(v.data[0]),
            _ => None,
        }
    }

    /// A simple scalar logical: length 1, no attributes.
    #[must_use]
    pub fn as_lgl_scalar(&self) -> Option<i32> {
        match self {
            RVal::Lgl(v) if v.is_simple_scalar() => Some(v.data[0]),
            _ => None,
        }
    }

    /// Coerce to a branch condition. `None` for NA, empty, or untestable.
    #[must_use]
    pub fn as_condition(&self) -> Option<bool> {
        match self {
            RVal::Lgl(v) if !v.data.is_empty() => match v.data[0] {
                NA_LOGICAL => None,
                x => Some(x != 0),
            },
            RVal::Int(v) if !v.data.is_empty() => match v.data[0] {
                NA_INTEGER => None,
                x => Some(x != 0),
            },
            RVal::Real(v) if !v.data.is_empty() => {
                let x = v.data[0];
                if x.is_nan() {
                    None
                } else {
                    Some(x != 0.0)
                }
            }
            _ => None,
        }
    }

    /// Vector length, where defined.
    #[must_use]
    pub fn length(&self) -> usize {
        match self {
            RVal::Null => 0,
            RVal::Int(v) => v.len(),
            RVal::Real(v) => v.len(),
            RVal::Lgl(v) => v.len(),
            RVal::Str(v) => v.len(),
            RVal::Raw(v) => v.len(),
            _ => 1,
        }
    }

    // -- identity -------------------------------------------------------------

    /// Pointer identity for reference values, bitwise equality for scalars.
    /// This is the semantics of the `identical_` speculation guard.
    #[must_use]
    pub fn identical(&self, other: &RVal) -> bool {
        match (self, other) {
            (RVal::Null, RVal::Null) => true,
            (RVal::Missing, RVal::Missing) => true,
            (RVal::Int(a), RVal::Int(b)) => Rc::ptr_eq(a, b) || a.data == b.data,
            (RVal::Real(a), RVal::Real(b)) => {
                Rc::ptr_eq(a, b)
                    || (a.len() == b.len()
                        && a.data
                            .iter()
                            .zip(&b.data)
                            .all(|(x, y)| x.to_bits() == y.to_bits()))
            }
            (RVal::Lgl(a), RVal::Lgl(b)) => Rc::ptr_eq(a, b) || a.data == b.data,
            (RVal::Str(a), RVal::Str(b)) => Rc::ptr_eq(a, b) || a.data == b.data,
            (RVal::Sym(a), RVal::Sym(b)) => a == b,
            (RVal::Closure(a), RVal::Closure(b)) => Rc::ptr_eq(a, b),
            (RVal::Builtin(a), RVal::Builtin(b)) => a == b,
            (RVal::Env(a), RVal::Env(b)) => a.ptr_eq(b),
            (RVal::Promise(a), RVal::Promise(b)) => Rc::ptr_eq(a, b),
            (RVal::Lang(a), RVal::Lang(b)) => Rc::ptr_eq(a, b),
            (RVal::Raw(a), RVal::Raw(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for RVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RVal::Null => write!(f, "NULL"),
            RVal::Missing => write!(f, "<missing>"),
            RVal::Int(v) => write!(f, "Int{:?}", v.data),
            RVal::Real(v) => write!(f, "Real{:?}", v.data),
            RVal::Lgl(v) => write!(f, "Lgl{:?}", v.data),
            RVal::Str(v) => write!(f, "Str{:?}", v.data),
            RVal::Raw(v) => write!(f, "Raw[{} bytes]", v.len()),
            RVal::Sym(s) => write!(f, "`{s}`"),
            RVal::Lang(l) => write!(f, "Lang({:?}, {} args)", l.fun, l.args.len()),
            RVal::Closure(_) => write!(f, "<closure>"),
            RVal::Builtin(b) => write!(f, "<builtin {}>", b.name()),
            RVal::Promise(p) => {
                if p.is_forced() {
                    write!(f, "<promise: forced>")
                } else {
                    write!(f, "<promise>")
                }
            }
            RVal::Env(e) => e.fmt(f),
        }
    }
}

// =============================================================================
// Integer arithmetic with NA and overflow rules
// =============================================================================

/// Checked integer addition under host NA rules. Sets `naflag` on overflow.
#[inline]
pub fn integer_plus(x: i32, y: i32, naflag: &mut bool) -> i32 {
    if x == NA_INTEGER || y == NA_INTEGER {
        return NA_INTEGER;
    }
    match x.checked_add(y) {
        Some(z) if z != NA_INTEGER => z,
        _ => {
            *naflag = true;
            NA_INTEGER
        }
    }
}

/// Checked integer subtraction under host NA rules.
#[inline]
pub fn integer_minus(x: i32, y: i32, naflag: &mut bool) -> i32 {
    if x == NA_INTEGER || y == NA_INTEGER {
        return NA_INTEGER;
    }
    match x.checked_sub(y) {
        Some(z) if z != NA_INTEGER => z,
        _ => {
            *naflag = true;
            NA_INTEGER
        }
    }
}

/// Checked integer multiplication under host NA rules.
#[inline]
pub fn integer_times(x: i32, y: i32, naflag: &mut bool) -> i32 {
    if x == NA_INTEGER || y == NA_INTEGER {
        return NA_INTEGER;
    }
    match x.checked_mul(y) {
        Some(z) if z != NA_INTEGER => z,
        _ => {
            *naflag = true;
            NA_INTEGER
        }
    }
}
