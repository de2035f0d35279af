//! Code-object builder.
//!
//! Emits the variable-length byte stream with label-based jump patching,
//! tracks the operand-stack high-water mark, and collects the side tables
//! (source references, child codes, feedback slots) that make up a
//! [`Code`] object.

use crate::bytecode::instruction::BC;
use rir_core::code::Code;
use rir_core::feedback::{CallFeedback, FeedbackSlot, TypeFeedback};
use rir_core::pool::SrcIdx;
use std::rc::Rc;

/// A forward-patchable jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Debug, Default)]
struct LabelInfo {
    pos: Option<u32>,
    /// Operand-stack depth carried into the label by some jump.
    depth: Option<u32>,
}

#[derive(Debug)]
struct Patch {
    /// Byte position of the 32-bit offset field.
    at: usize,
    /// pc just past the jump instruction; offsets are relative to it.
    after: u32,
    label: Label,
}

#[derive(Debug, Default)]
pub struct CodeBuilder {
    bc: Vec<u8>,
    labels: Vec<LabelInfo>,
    patches: Vec<Patch>,
    srcrefs: Vec<(u32, SrcIdx)>,
    children: Vec<Rc<Code>>,
    feedback: Vec<FeedbackSlot>,
    cur_stack: u32,
    max_stack: u32,
    locals: u32,
    reachable: bool,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reachable: true,
            ..Self::default()
        }
    }

    /// Current program counter.
    #[inline]
    #[must_use]
    pub fn pc(&self) -> u32 {
        self.bc.len() as u32
    }

    #[inline]
    #[must_use]
    pub fn stack_depth(&self) -> u32 {
        self.cur_stack
    }

    fn track(&mut self, bc: &BC) {
        if !self.reachable {
            return;
        }
        let pops = bc.pops() as u32;
        debug_assert!(
            self.cur_stack >= pops,
            "operand stack underflow emitting {bc:?}"
        );
        self.cur_stack = self.cur_stack.saturating_sub(pops) + bc.pushes() as u32;
        self.max_stack = self.max_stack.max(self.cur_stack);
        if bc.is_exit() || bc.is_uncond_jmp() {
            self.reachable = false;
        }
    }

    /// Emit one instruction.
    pub fn emit(&mut self, bc: BC) {
        debug_assert!(bc.jmp_offset().is_none(), "jumps go through the label API");
        self.track(&bc);
        bc.encode(&mut self.bc);
    }

    /// Emit one instruction with a source reference for its pc.
    pub fn emit_src(&mut self, bc: BC, src: SrcIdx) {
        self.srcrefs.push((self.pc(), src));
        self.emit(bc);
    }

    /// Allocate a fresh label.
    pub fn label(&mut self) -> Label {
        self.labels.push(LabelInfo::default());
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind a label to the current position.
    pub fn bind(&mut self, label: Label) {
        let pc = self.pc();
        let info = &mut self.labels[label.0 as usize];
        debug_assert!(info.pos.is_none(), "label bound twice");
        info.pos = Some(pc);
        if let Some(depth) = info.depth {
            self.cur_stack = if self.reachable {
                self.cur_stack.max(depth)
            } else {
                depth
            };
        }
        self.reachable = true;
    }

    fn emit_jump(&mut self, bc: BC, label: Label) {
        self.track(&bc);
        bc.encode(&mut self.bc);
        let after = self.pc();
        self.patches.push(Patch {
            at: after as usize - 4,
            after,
            label,
        });
        // Record the depth flowing along the edge.
        let depth = self.cur_stack;
        let info = &mut self.labels[label.0 as usize];
        info.depth = Some(info.depth.map_or(depth, |d| d.max(depth)));
    }

    pub fn br(&mut self, label: Label) {
        self.emit_jump(BC::Br(0), label);
    }

    pub fn br_true(&mut self, label: Label) {
        self.emit_jump(BC::BrTrue(0), label);
    }

    pub fn br_false(&mut self, label: Label) {
        self.emit_jump(BC::BrFalse(0), label);
    }

    pub fn begin_loop(&mut self, exit: Label) {
        self.emit_jump(BC::BeginLoop(0), exit);
    }

    /// Attach a child code object (promise body), returning its index.
    pub fn add_child(&mut self, code: Rc<Code>) -> u32 {
        self.children.push(code);
        self.children.len() as u32 - 1
    }

    /// Allocate a call-feedback slot, returning its index.
    pub fn add_call_feedback(&mut self) -> u32 {
        self.feedback.push(FeedbackSlot::Call(CallFeedback::new()));
        self.feedback.len() as u32 - 1
    }

    /// Allocate a binop type-feedback slot, returning its index.
    pub fn add_binop_feedback(&mut self) -> u32 {
        self.feedback
            .push(FeedbackSlot::Binop([TypeFeedback::new(), TypeFeedback::new()]));
        self.feedback.len() as u32 - 1
    }

    /// Declare the number of local slots.
    pub fn set_locals(&mut self, n: u32) {
        self.locals = n;
    }

    /// Patch all jumps and produce the immutable code object.
    #[must_use]
    pub fn finish(mut self, src: SrcIdx) -> Rc<Code> {
        for patch in &self.patches {
            let pos = self.labels[patch.label.0 as usize]
                .pos
                .expect("jump to unbound label");
            let offset = pos as i64 - patch.after as i64;
            self.bc[patch.at..patch.at + 4]
                .copy_from_slice(&(offset as i32).to_le_bytes());
        }
        Code::new(
            self.bc,
            src,
            self.srcrefs,
            self.children,
            self.feedback,
            self.max_stack,
            self.locals,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rir_core::pool::PoolIdx;

    #[test]
    fn test_forward_jump_patching() {
        let mut b = CodeBuilder::new();
        b.emit(BC::Push(PoolIdx(0)));
        let end = b.label();
        b.br_true(end);
        b.emit(BC::Push(PoolIdx(1)));
        b.emit(BC::Pop);
        b.bind(end);
        b.emit(BC::Push(PoolIdx(2)));
        b.emit(BC::Ret);
        let code = b.finish(SrcIdx(0));

        let (bc, after) = BC::decode(&code.bc, 5).unwrap();
        let target = bc.jmp_target(after).unwrap();
        let (at_target, _) = BC::decode(&code.bc, target).unwrap();
        assert_eq!(at_target, BC::Push(PoolIdx(2)));
    }

    #[test]
    fn test_backward_jump() {
        let mut b = CodeBuilder::new();
        let head = b.label();
        b.bind(head);
        b.emit(BC::Push(PoolIdx(0)));
        b.emit(BC::Pop);
        b.br(head);
        let code = b.finish(SrcIdx(0));

        let (bc, after) = BC::decode(&code.bc, 6).unwrap();
        assert_eq!(bc.jmp_target(after), Some(0));
    }

    #[test]
    fn test_max_stack_tracking() {
        let mut b = CodeBuilder::new();
        b.emit(BC::Push(PoolIdx(0)));
        b.emit(BC::Push(PoolIdx(1)));
        b.emit(BC::Push(PoolIdx(2)));
        b.emit(BC::Add);
        b.emit(BC::Add);
        b.emit(BC::Ret);
        let code = b.finish(SrcIdx(0));
        assert_eq!(code.max_stack, 3);
    }

    #[test]
    fn test_feedback_slots() {
        let mut b = CodeBuilder::new();
        assert_eq!(b.add_call_feedback(), 0);
        assert_eq!(b.add_binop_feedback(), 1);
        b.emit(BC::Push(PoolIdx(0)));
        b.emit(BC::Ret);
        let code = b.finish(SrcIdx(0));
        assert_eq!(code.feedback.len(), 2);
        assert!(matches!(code.feedback[0], FeedbackSlot::Call(_)));
        assert!(matches!(code.feedback[1], FeedbackSlot::Binop(_)));
    }
}
