//! Bytecode instruction definitions.
//!
//! RIR is a variable-length stack bytecode: a one-byte opcode followed by
//! zero or more 32-bit immediates (pool indices, jump offsets, argument
//! counts, feedback-slot indices). Implicit call instructions additionally
//! carry one immediate per argument naming the promise code to wrap.
//!
//! Jump offsets are signed and relative to the program counter after the
//! whole instruction has been decoded.

use rir_core::error::RirError;
use rir_core::pool::PoolIdx;
use smallvec::SmallVec;
use std::fmt;

/// Immediate marking an explicitly missing argument in an implicit call.
pub const MISSING_ARG_IDX: u32 = u32::MAX;
/// Immediate marking a `...` argument in an implicit call.
pub const DOTS_ARG_IDX: u32 = u32::MAX - 1;

/// Bytecode opcodes.
///
/// Grouped by category:
/// - 0x00-0x0F: stack shuffling
/// - 0x10-0x17: local slots
/// - 0x18-0x27: variables and environments-as-names
/// - 0x28-0x2F: control
/// - 0x30-0x37: calls
/// - 0x38-0x3F: promises and closures
/// - 0x40-0x57: arithmetic, comparison, logic
/// - 0x58-0x5F: feedback recording
/// - 0x60-0x67: first-class environments
/// - 0x68-0x6F: specialized checks
/// - 0x70-0x7F: visibility and padding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    Push = 0x01,
    Pop = 0x02,
    Dup = 0x03,
    Dup2 = 0x04,
    Swap = 0x05,
    Pick = 0x06,
    Put = 0x07,
    Pull = 0x08,

    LdLoc = 0x10,
    StLoc = 0x11,
    MovLoc = 0x12,

    LdVar = 0x18,
    LdVarNoForce = 0x19,
    LdVarSuper = 0x1A,
    StVar = 0x1B,
    StVarSuper = 0x1C,
    LdArg = 0x1D,
    LdFun = 0x1E,
    LdDdVar = 0x1F,
    Missing = 0x20,
    CheckMissing = 0x21,

    Br = 0x28,
    BrTrue = 0x29,
    BrFalse = 0x2A,
    Ret = 0x2B,
    BeginLoop = 0x2C,
    EndContext = 0x2D,
    Deopt = 0x2E,

    Call = 0x30,
    CallImplicit = 0x31,
    NamedCall = 0x32,
    NamedCallImplicit = 0x33,
    StaticCall = 0x34,

    MkPromise = 0x38,
    Force = 0x39,
    Close = 0x3A,

    Add = 0x40,
    Sub = 0x41,
    Mul = 0x42,
    Div = 0x43,
    IDiv = 0x44,
    Mod = 0x45,
    Pow = 0x46,
    Eq = 0x47,
    Ne = 0x48,
    Lt = 0x49,
    Le = 0x4A,
    Gt = 0x4B,
    Ge = 0x4C,
    Not = 0x4D,
    UPlus = 0x4E,
    UMinus = 0x4F,
    LglAnd = 0x50,
    LglOr = 0x51,

    RecordCall = 0x58,
    RecordBinop = 0x59,

    MkEnv = 0x60,
    GetEnv = 0x61,
    SetEnv = 0x62,
    ParentEnv = 0x63,

    IsObj = 0x68,
    Identical = 0x69,
    Is = 0x6A,

    Invisible = 0x70,
    Visible = 0x71,
}

impl Opcode {
    /// Decode a raw opcode byte.
    #[must_use]
    pub fn from_u8(b: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match b {
            0x00 => Nop,
            0x01 => Push,
            0x02 => Pop,
            0x03 => Dup,
            0x04 => Dup2,
            0x05 => Swap,
            0x06 => Pick,
            0x07 => Put,
            0x08 => Pull,
            0x10 => LdLoc,
            0x11 => StLoc,
            0x12 => MovLoc,
            0x18 => LdVar,
            0x19 => LdVarNoForce,
            0x1A => LdVarSuper,
            0x1B => StVar,
            0x1C => StVarSuper,
            0x1D => LdArg,
            0x1E => LdFun,
            0x1F => LdDdVar,
            0x20 => Missing,
            0x21 => CheckMissing,
            0x28 => Br,
            0x29 => BrTrue,
            0x2A => BrFalse,
            0x2B => Ret,
            0x2C => BeginLoop,
            0x2D => EndContext,
            0x2E => Deopt,
            0x30 => Call,
            0x31 => CallImplicit,
            0x32 => NamedCall,
            0x33 => NamedCallImplicit,
            0x34 => StaticCall,
            0x38 => MkPromise,
            0x39 => Force,
            0x3A => Close,
            0x40 => Add,
            0x41 => Sub,
            0x42 => Mul,
            0x43 => Div,
            0x44 => IDiv,
            0x45 => Mod,
            0x46 => Pow,
            0x47 => Eq,
            0x48 => Ne,
            0x49 => Lt,
            0x4A => Le,
            0x4B => Gt,
            0x4C => Ge,
            0x4D => Not,
            0x4E => UPlus,
            0x4F => UMinus,
            0x50 => LglAnd,
            0x51 => LglOr,
            0x58 => RecordCall,
            0x59 => RecordBinop,
            0x60 => MkEnv,
            0x61 => GetEnv,
            0x62 => SetEnv,
            0x63 => ParentEnv,
            0x68 => IsObj,
            0x69 => Identical,
            0x6A => Is,
            0x70 => Invisible,
            0x71 => Visible,
            _ => return None,
        })
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BC {
    Nop,
    Push(PoolIdx),
    Pop,
    Dup,
    Dup2,
    Swap,
    Pick(u32),
    Put(u32),
    Pull(u32),

    LdLoc(u32),
    StLoc(u32),
    MovLoc(u32, u32),

    LdVar(PoolIdx),
    LdVarNoForce(PoolIdx),
    LdVarSuper(PoolIdx),
    StVar(PoolIdx),
    StVarSuper(PoolIdx),
    LdArg(u32),
    LdFun(PoolIdx),
    LdDdVar(PoolIdx),
    Missing(PoolIdx),
    CheckMissing,

    Br(i32),
    BrTrue(i32),
    BrFalse(i32),
    Ret,
    BeginLoop(i32),
    EndContext,
    Deopt(PoolIdx),

    Call {
        nargs: u32,
        ast: PoolIdx,
    },
    CallImplicit {
        ast: PoolIdx,
        args: SmallVec<[u32; 4]>,
    },
    NamedCall {
        nargs: u32,
        ast: PoolIdx,
        names: PoolIdx,
    },
    NamedCallImplicit {
        ast: PoolIdx,
        names: PoolIdx,
        args: SmallVec<[u32; 4]>,
    },
    StaticCall {
        nargs: u32,
        ast: PoolIdx,
        target: PoolIdx,
    },

    MkPromise(u32),
    Force,
    Close,

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
    UPlus,
    UMinus,
    LglAnd,
    LglOr,

    RecordCall(u32),
    RecordBinop(u32),

    MkEnv {
        names: PoolIdx,
        nargs: u32,
    },
    GetEnv,
    SetEnv,
    ParentEnv,

    IsObj,
    Identical,
    Is(u32),

    Invisible,
    Visible,
}

#[inline]
fn read_u32(code: &[u8], at: usize) -> Result<u32, RirError> {
    code.get(at..at + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or(RirError::InvalidOpcode(0))
}

#[inline]
fn read_i32(code: &[u8], at: usize) -> Result<i32, RirError> {
    Ok(read_u32(code, at)? as i32)
}

impl BC {
    /// Decode the instruction at `pc`, returning it and the pc just past it.
    pub fn decode(code: &[u8], pc: usize) -> Result<(BC, usize), RirError> {
        let byte = *code.get(pc).ok_or(RirError::InvalidOpcode(0))?;
        let op = Opcode::from_u8(byte).ok_or(RirError::InvalidOpcode(byte))?;
        let imm = pc + 1;
        let u = |i: usize| read_u32(code, imm + 4 * i);
        let s = |i: usize| read_i32(code, imm + 4 * i);
        use Opcode as O;
        let (bc, nimm) = match op {
            O::Nop => (BC::Nop, 0),
            O::Push => (BC::Push(PoolIdx(u(0)?)), 1),
            O::Pop => (BC::Pop, 0),
            O::Dup => (BC::Dup, 0),
            O::Dup2 => (BC::Dup2, 0),
            O::Swap => (BC::Swap, 0),
            O::Pick => (BC::Pick(u(0)?), 1),
            O::Put => (BC::Put(u(0)?), 1),
            O::Pull => (BC::Pull(u(0)?), 1),
            O::LdLoc => (BC::LdLoc(u(0)?), 1),
            O::StLoc => (BC::StLoc(u(0)?), 1),
            O::MovLoc => (BC::MovLoc(u(0)?, u(1)?), 2),
            O::LdVar => (BC::LdVar(PoolIdx(u(0)?)), 1),
            O::LdVarNoForce => (BC::LdVarNoForce(PoolIdx(u(0)?)), 1),
            O::LdVarSuper => (BC::LdVarSuper(PoolIdx(u(0)?)), 1),
            O::StVar => (BC::StVar(PoolIdx(u(0)?)), 1),
            O::StVarSuper => (BC::StVarSuper(PoolIdx(u(0)?)), 1),
            O::LdArg => (BC::LdArg(u(0)?), 1),
            O::LdFun => (BC::LdFun(PoolIdx(u(0)?)), 1),
            O::LdDdVar => (BC::LdDdVar(PoolIdx(u(0)?)), 1),
            O::Missing => (BC::Missing(PoolIdx(u(0)?)), 1),
            O::CheckMissing => (BC::CheckMissing, 0),
            O::Br => (BC::Br(s(0)?), 1),
            O::BrTrue => (BC::BrTrue(s(0)?), 1),
            O::BrFalse => (BC::BrFalse(s(0)?), 1),
            O::Ret => (BC::Ret, 0),
            O::BeginLoop => (BC::BeginLoop(s(0)?), 1),
            O::EndContext => (BC::EndContext, 0),
            O::Deopt => (BC::Deopt(PoolIdx(u(0)?)), 1),
            O::Call => (
                BC::Call {
                    nargs: u(0)?,
                    ast: PoolIdx(u(1)?),
                },
                2,
            ),
            O::CallImplicit => {
                let nargs = u(0)?;
                let ast = PoolIdx(u(1)?);
                let mut args = SmallVec::new();
                for i in 0..nargs {
                    args.push(u(2 + i as usize)?);
                }
                (BC::CallImplicit { ast, args }, 2 + nargs as usize)
            }
            O::NamedCall => (
                BC::NamedCall {
                    nargs: u(0)?,
                    ast: PoolIdx(u(1)?),
                    names: PoolIdx(u(2)?),
                },
                3,
            ),
            O::NamedCallImplicit => {
                let nargs = u(0)?;
                let ast = PoolIdx(u(1)?);
                let names = PoolIdx(u(2)?);
                let mut args = SmallVec::new();
                for i in 0..nargs {
                    args.push(u(3 + i as usize)?);
                }
                (BC::NamedCallImplicit { ast, names, args }, 3 + nargs as usize)
            }
            O::StaticCall => (
                BC::StaticCall {
                    nargs: u(0)?,
                    ast: PoolIdx(u(1)?),
                    target: PoolIdx(u(2)?),
                },
                3,
            ),
            O::MkPromise => (BC::MkPromise(u(0)?), 1),
            O::Force => (BC::Force, 0),
            O::Close => (BC::Close, 0),
            O::Add => (BC::Add, 0),
            O::Sub => (BC::Sub, 0),
            O::Mul => (BC::Mul, 0),
            O::Div => (BC::Div, 0),
            O::IDiv => (BC::IDiv, 0),
            O::Mod => (BC::Mod, 0),
            O::Pow => (BC::Pow, 0),
            O::Eq => (BC::Eq, 0),
            O::Ne => (BC::Ne, 0),
            O::Lt => (BC::Lt, 0),
            O::Le => (BC::Le, 0),
            O::Gt => (BC::Gt, 0),
            O::Ge => (BC::Ge, 0),
            O::Not => (BC::Not, 0),
            O::UPlus => (BC::UPlus, 0),
            O::UMinus => (BC::UMinus, 0),
            O::LglAnd => (BC::LglAnd, 0),
            O::LglOr => (BC::LglOr, 0),
            O::RecordCall => (BC::RecordCall(u(0)?), 1),
            O::RecordBinop => (BC::RecordBinop(u(0)?), 1),
            O::MkEnv => (
                BC::MkEnv {
                    names: PoolIdx(u(0)?),
                    nargs: u(1)?,
                },
                2,
            ),
            O::GetEnv => (BC::GetEnv, 0),
            O::SetEnv => (BC::SetEnv, 0),
            O::ParentEnv => (BC::ParentEnv, 0),
            O::IsObj => (BC::IsObj, 0),
            O::Identical => (BC::Identical, 0),
            O::Is => (BC::Is(u(0)?), 1),
            O::Invisible => (BC::Invisible, 0),
            O::Visible => (BC::Visible, 0),
        };
        Ok((bc, pc + 1 + 4 * nimm))
    }

    /// The opcode of this instruction.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        use Opcode as O;
        match self {
            BC::Nop => O::Nop,
            BC::Push(_) => O::Push,
            BC::Pop => O::Pop,
            BC::Dup => O::Dup,
            BC::Dup2 => O::Dup2,
            BC::Swap => O::Swap,
            BC::Pick(_) => O::Pick,
            BC::Put(_) => O::Put,
            BC::Pull(_) => O::Pull,
            BC::LdLoc(_) => O::LdLoc,
            BC::StLoc(_) => O::StLoc,
            BC::MovLoc(..) => O::MovLoc,
            BC::LdVar(_) => O::LdVar,
            BC::LdVarNoForce(_) => O::LdVarNoForce,
            BC::LdVarSuper(_) => O::LdVarSuper,
            BC::StVar(_) => O::StVar,
            BC::StVarSuper(_) => O::StVarSuper,
            BC::LdArg(_) => O::LdArg,
            BC::LdFun(_) => O::LdFun,
            BC::LdDdVar(_) => O::LdDdVar,
            BC::Missing(_) => O::Missing,
            BC::CheckMissing => O::CheckMissing,
            BC::Br(_) => O::Br,
            BC::BrTrue(_) => O::BrTrue,
            BC::BrFalse(_) => O::BrFalse,
            BC::Ret => O::Ret,
            BC::BeginLoop(_) => O::BeginLoop,
            BC::EndContext => O::EndContext,
            BC::Deopt(_) => O::Deopt,
            BC::Call { .. } => O::Call,
            BC::CallImplicit { .. } => O::CallImplicit,
            BC::NamedCall { .. } => O::NamedCall,
            BC::NamedCallImplicit { .. } => O::NamedCallImplicit,
            BC::StaticCall { .. } => O::StaticCall,
            BC::MkPromise(_) => O::MkPromise,
            BC::Force => O::Force,
            BC::Close => O::Close,
            BC::Add => O::Add,
            BC::Sub => O::Sub,
            BC::Mul => O::Mul,
            BC::Div => O::Div,
            BC::IDiv => O::IDiv,
            BC::Mod => O::Mod,
            BC::Pow => O::Pow,
            BC::Eq => O::Eq,
            BC::Ne => O::Ne,
            BC::Lt => O::Lt,
            BC::Le => O::Le,
            BC::Gt => O::Gt,
            BC::Ge => O::Ge,
            BC::Not => O::Not,
            BC::UPlus => O::UPlus,
            BC::UMinus => O::UMinus,
            BC::LglAnd => O::LglAnd,
            BC::LglOr => O::LglOr,
            BC::RecordCall(_) => O::RecordCall,
            BC::RecordBinop(_) => O::RecordBinop,
            BC::MkEnv { .. } => O::MkEnv,
            BC::GetEnv => O::GetEnv,
            BC::SetEnv => O::SetEnv,
            BC::ParentEnv => O::ParentEnv,
            BC::IsObj => O::IsObj,
            BC::Identical => O::Identical,
            BC::Is(_) => O::Is,
            BC::Invisible => O::Invisible,
            BC::Visible => O::Visible,
        }
    }

    /// Encode into a byte stream.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        let mut u = |v: u32| out.extend_from_slice(&v.to_le_bytes());
        match self {
            BC::Push(p)
            | BC::LdVar(p)
            | BC::LdVarNoForce(p)
            | BC::LdVarSuper(p)
            | BC::StVar(p)
            | BC::StVarSuper(p)
            | BC::LdFun(p)
            | BC::LdDdVar(p)
            | BC::Missing(p)
            | BC::Deopt(p) => u(p.0),
            BC::Pick(i) | BC::Put(i) | BC::Pull(i) | BC::LdLoc(i) | BC::StLoc(i)
            | BC::LdArg(i) | BC::MkPromise(i) | BC::RecordCall(i) | BC::RecordBinop(i)
            | BC::Is(i) => u(*i),
            BC::MovLoc(a, b) => {
                u(*a);
                u(*b);
            }
            BC::Br(o) | BC::BrTrue(o) | BC::BrFalse(o) | BC::BeginLoop(o) => u(*o as u32),
            BC::Call { nargs, ast } => {
                u(*nargs);
                u(ast.0);
            }
            BC::CallImplicit { ast, args } => {
                u(args.len() as u32);
                u(ast.0);
                for a in args {
                    u(*a);
                }
            }
            BC::NamedCall { nargs, ast, names } => {
                u(*nargs);
                u(ast.0);
                u(names.0);
            }
            BC::NamedCallImplicit { ast, names, args } => {
                u(args.len() as u32);
                u(ast.0);
                u(names.0);
                for a in args {
                    u(*a);
                }
            }
            BC::StaticCall { nargs, ast, target } => {
                u(*nargs);
                u(ast.0);
                u(target.0);
            }
            BC::MkEnv { names, nargs } => {
                u(names.0);
                u(*nargs);
            }
            _ => {}
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut buf = Vec::with_capacity(16);
        self.encode(&mut buf);
        buf.len()
    }

    /// Values popped from the operand stack. `Deopt` is excluded from
    /// static accounting (its consumption is metadata-driven).
    #[must_use]
    pub fn pops(&self) -> usize {
        match self {
            BC::Pop | BC::StLoc(_) | BC::StVar(_) | BC::StVarSuper(_) | BC::Ret
            | BC::BrTrue(_) | BC::BrFalse(_) | BC::SetEnv => 1,
            BC::Swap | BC::Identical | BC::LglAnd | BC::LglOr => 2,
            BC::Add | BC::Sub | BC::Mul | BC::Div | BC::IDiv | BC::Mod | BC::Pow | BC::Eq
            | BC::Ne | BC::Lt | BC::Le | BC::Gt | BC::Ge => 2,
            BC::Not | BC::UPlus | BC::UMinus | BC::Force | BC::Close | BC::IsObj | BC::Is(_) => 1,
            BC::Call { nargs, .. } | BC::NamedCall { nargs, .. } => *nargs as usize + 1,
            BC::CallImplicit { .. } | BC::NamedCallImplicit { .. } => 1,
            BC::StaticCall { nargs, .. } => *nargs as usize,
            BC::MkEnv { nargs, .. } => *nargs as usize + 1,
            _ => 0,
        }
    }

    /// Values pushed onto the operand stack.
    #[must_use]
    pub fn pushes(&self) -> usize {
        match self {
            BC::Push(_) | BC::Pull(_) | BC::LdLoc(_) | BC::LdVar(_) | BC::LdVarNoForce(_)
            | BC::LdVarSuper(_) | BC::LdArg(_) | BC::LdFun(_) | BC::LdDdVar(_)
            | BC::Missing(_) | BC::MkPromise(_) | BC::GetEnv | BC::ParentEnv => 1,
            BC::Dup => 1,
            BC::Dup2 => 2,
            BC::Swap => 2,
            BC::Call { .. } | BC::CallImplicit { .. } | BC::NamedCall { .. }
            | BC::NamedCallImplicit { .. } | BC::StaticCall { .. } => 1,
            BC::Force | BC::Close | BC::IsObj | BC::Identical | BC::Is(_) => 1,
            BC::Add | BC::Sub | BC::Mul | BC::Div | BC::IDiv | BC::Mod | BC::Pow | BC::Eq
            | BC::Ne | BC::Lt | BC::Le | BC::Gt | BC::Ge | BC::Not | BC::UPlus | BC::UMinus
            | BC::LglAnd | BC::LglOr => 1,
            BC::MkEnv { .. } => 1,
            _ => 0,
        }
    }

    /// Is this a jump (conditional or not)?
    #[must_use]
    pub fn is_jmp(&self) -> bool {
        matches!(
            self,
            BC::Br(_) | BC::BrTrue(_) | BC::BrFalse(_) | BC::BeginLoop(_)
        )
    }

    /// Is this an unconditional jump?
    #[must_use]
    pub fn is_uncond_jmp(&self) -> bool {
        matches!(self, BC::Br(_))
    }

    /// Does this instruction leave the code object?
    #[must_use]
    pub fn is_exit(&self) -> bool {
        matches!(self, BC::Ret | BC::Deopt(_))
    }

    /// Is this a call-family instruction?
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            BC::Call { .. }
                | BC::CallImplicit { .. }
                | BC::NamedCall { .. }
                | BC::NamedCallImplicit { .. }
                | BC::StaticCall { .. }
        )
    }

    /// The raw signed offset of a jump.
    #[must_use]
    pub fn jmp_offset(&self) -> Option<i32> {
        match self {
            BC::Br(o) | BC::BrTrue(o) | BC::BrFalse(o) | BC::BeginLoop(o) => Some(*o),
            _ => None,
        }
    }

    /// Absolute jump target, given the pc just past this instruction.
    #[must_use]
    pub fn jmp_target(&self, pc_after: usize) -> Option<usize> {
        self.jmp_offset().map(|o| (pc_after as i64 + o as i64) as usize)
    }
}

impl fmt::Display for BC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
