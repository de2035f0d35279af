//! Deoptimization frame synthesis.
//!
//! When `deopt_` fires, the interpreter becomes the baseline frame captured
//! at compile time: frame 0 replaces the current code and program counter,
//! and the remaining frames wait on a worklist. Each time a synthesized
//! frame returns, the next one is re-entered at its captured position with
//! the returned value pushed, until the worklist drains.
//!
//! The mechanism itself lives in the interpreter loop; this module holds
//! the worklist entry and the invariants' tests.

use rir_core::code::Code;
use std::rc::Rc;

/// One frame awaiting synthesis.
pub struct SynthFrame {
    pub code: Rc<Code>,
    pub pc: u32,
}

#[cfg(test)]
mod tests {
    use crate::call::CallFrame;
    use crate::{interp, Interp};
    use rir_compiler::bytecode::builder::CodeBuilder;
    use rir_compiler::bytecode::instruction::BC;
    use rir_core::deopt::{DeoptMetadata, FrameInfo, ROOT_CODE_REF};
    use rir_core::function::{Function, FunctionSignature};
    use rir_core::pool::SrcIdx;
    use rir_core::value::{Env, RVal};
    use std::rc::Rc;

    /// Baseline: push k; <resume point> push 1; add; ret
    /// Specialized: push stack value k, push env, deopt into the baseline
    /// at the resume point.
    #[test]
    fn test_single_frame_reconstruction() {
        let mut interp = Interp::new();

        let k = interp.cp.insert(RVal::int(41));
        let one = interp.cp.insert(RVal::int(1));

        let mut b = CodeBuilder::new();
        b.emit(BC::Push(k));
        let resume_pc = b.pc();
        b.emit(BC::Push(one));
        b.emit(BC::Add);
        b.emit(BC::Ret);
        let baseline_code = b.finish(SrcIdx(0));
        let baseline = Function::new(
            baseline_code,
            Vec::new(),
            FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            rir_core::assumptions::OptimizationContext::base(),
        );

        let meta = DeoptMetadata::new(vec![FrameInfo {
            code_ref: ROOT_CODE_REF,
            pc: resume_pc,
            stack_size: 1,
        }]);
        let blob = interp.cp.insert(RVal::Raw(Rc::new(meta.serialize())));

        // The specialized body materializes the captured frame and deopts.
        let env_const = interp.cp.insert(RVal::Env(Env::new(None)));
        let mut sb = CodeBuilder::new();
        sb.emit(BC::Push(k)); // captured stack slot
        sb.emit(BC::Push(env_const)); // environment on top
        sb.emit(BC::Deopt(blob));
        let spec_code = sb.finish(SrcIdx(0));
        let spec = Function::new(
            spec_code,
            Vec::new(),
            FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            rir_core::assumptions::OptimizationContext::base(),
        );
        spec.set_baseline_code(Rc::clone(&baseline.body));

        let frame = CallFrame {
            args: Vec::new(),
            callee_env: Env::new(None),
        };
        let mut env = Some(Env::new(None));
        let result = interp::eval(&mut interp, &spec.body, &mut env, Some(&frame), 0).unwrap();
        assert_eq!(result.as_int_scalar(), Some(42));
        assert_eq!(
            baseline.invocation_count(),
            1,
            "the baseline registers the deopt entry"
        );
    }

    /// Deopt immediately at function entry: the baseline runs from pc 0
    /// with an empty captured stack.
    #[test]
    fn test_deopt_at_entry() {
        let mut interp = Interp::new();
        let k = interp.cp.insert(RVal::int(7));

        let mut b = CodeBuilder::new();
        b.emit(BC::Push(k));
        b.emit(BC::Ret);
        let baseline_code = b.finish(SrcIdx(0));
        let baseline = Function::new(
            baseline_code,
            Vec::new(),
            FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            rir_core::assumptions::OptimizationContext::base(),
        );

        let meta = DeoptMetadata::new(vec![FrameInfo {
            code_ref: ROOT_CODE_REF,
            pc: 0,
            stack_size: 0,
        }]);
        let blob = interp.cp.insert(RVal::Raw(Rc::new(meta.serialize())));
        let env_const = interp.cp.insert(RVal::Env(Env::new(None)));

        let mut sb = CodeBuilder::new();
        sb.emit(BC::Push(env_const));
        sb.emit(BC::Deopt(blob));
        let spec_code = sb.finish(SrcIdx(0));
        let spec = Function::new(
            spec_code,
            Vec::new(),
            FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            rir_core::assumptions::OptimizationContext::base(),
        );
        spec.set_baseline_code(Rc::clone(&baseline.body));

        let frame = CallFrame {
            args: Vec::new(),
            callee_env: Env::new(None),
        };
        let mut env = Some(Env::new(None));
        let result = interp::eval(&mut interp, &spec.body, &mut env, Some(&frame), 0).unwrap();
        assert_eq!(result.as_int_scalar(), Some(7));
    }

    /// Two frames: after frame 0 completes, the remaining frame re-enters
    /// at its captured position with the returned value pushed.
    #[test]
    fn test_two_frame_reconstruction_order() {
        let mut interp = Interp::new();

        let ten = interp.cp.insert(RVal::int(10));
        let two = interp.cp.insert(RVal::int(2));

        // Outer frame: resumes with [10, result]; add; ret.
        let mut outer = CodeBuilder::new();
        outer.emit(BC::Push(ten));
        outer.emit(BC::Push(ten));
        let outer_pc = outer.pc();
        outer.emit(BC::Add);
        outer.emit(BC::Ret);
        let outer_code = outer.finish(SrcIdx(0));

        // Baseline root (the inner frame): push 10; <resume> push 2; mul;
        // ret. The outer frame's code is its child #0 (deopt ref 1).
        let mut inner = CodeBuilder::new();
        inner.emit(BC::Push(ten));
        let inner_pc = inner.pc();
        inner.emit(BC::Push(two));
        inner.emit(BC::Mul);
        inner.emit(BC::Ret);
        inner.add_child(outer_code);
        let root = inner.finish(SrcIdx(0));
        let baseline = Function::new(
            root,
            Vec::new(),
            FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            rir_core::assumptions::OptimizationContext::base(),
        );

        let meta = DeoptMetadata::new(vec![
            FrameInfo {
                code_ref: ROOT_CODE_REF,
                pc: inner_pc,
                stack_size: 1,
            },
            FrameInfo {
                code_ref: 1,
                pc: outer_pc,
                stack_size: 1,
            },
        ]);
        let blob = interp.cp.insert(RVal::Raw(Rc::new(meta.serialize())));

        let env_const = interp.cp.insert(RVal::Env(Env::new(None)));
        let mut sb = CodeBuilder::new();
        // Frame images are [stack values, environment], outermost deepest,
        // the frame to resume on top.
        sb.emit(BC::Push(ten));
        sb.emit(BC::Push(env_const));
        sb.emit(BC::Push(ten));
        sb.emit(BC::Push(env_const));
        sb.emit(BC::Deopt(blob));
        let spec_code = sb.finish(SrcIdx(0));
        let spec = Function::new(
            spec_code,
            Vec::new(),
            FunctionSignature {
                formals: Vec::new(),
                has_defaults: false,
            },
            rir_core::assumptions::OptimizationContext::base(),
        );
        spec.set_baseline_code(Rc::clone(&baseline.body));

        let frame = CallFrame {
            args: Vec::new(),
            callee_env: Env::new(None),
        };
        let mut env = Some(Env::new(None));
        let result = interp::eval(&mut interp, &spec.body, &mut env, Some(&frame), 0).unwrap();
        // Inner computes 10 * 2 = 20; the outer resumes with [10, 20] and
        // adds them.
        assert_eq!(result.as_int_scalar(), Some(30));
        assert!(interp.ostack.is_empty(), "both frame images consumed");
    }
}
