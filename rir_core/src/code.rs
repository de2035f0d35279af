//! Code objects.
//!
//! A code object is a contiguous region of bytecodes plus its side tables:
//! child code objects (promise bodies and argument defaults), a per-opcode
//! source-reference table, feedback slots referenced by immediate index, and
//! the declared operand-stack and local-slot maxima. Code objects are
//! immutable once emitted; a new version is always a fresh object. Feedback
//! cells are the one interior-mutable exception, written by the interpreter
//! while the object executes.

use crate::feedback::FeedbackSlot;
use crate::function::Function;
use crate::pool::SrcIdx;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

#[derive(Debug)]
pub struct Code {
    /// The instruction stream: one-byte opcodes with inline immediates.
    pub bc: Vec<u8>,
    /// Source reference of the whole code object.
    pub src: SrcIdx,
    /// Per-opcode source references, sorted by program counter.
    pub srcrefs: Vec<(u32, SrcIdx)>,
    /// Child code objects, referenced by index from promise and call
    /// instructions. Owned by this code object.
    pub children: Vec<Rc<Code>>,
    /// Inline feedback slots, referenced by immediate index.
    pub feedback: Vec<FeedbackSlot>,
    /// Declared maximum operand-stack depth.
    pub max_stack: u32,
    /// Number of local slots.
    pub locals_count: u32,
    /// Back link to the owning function, set when the function is built.
    owner: RefCell<Weak<Function>>,
}

impl Code {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        bc: Vec<u8>,
        src: SrcIdx,
        srcrefs: Vec<(u32, SrcIdx)>,
        children: Vec<Rc<Code>>,
        feedback: Vec<FeedbackSlot>,
        max_stack: u32,
        locals_count: u32,
    ) -> Rc<Code> {
        Rc::new(Code {
            bc,
            src,
            srcrefs,
            children,
            feedback,
            max_stack,
            locals_count,
            owner: RefCell::new(Weak::new()),
        })
    }

    /// The source reference recorded for the opcode at `pc`, or the code
    /// object's own reference if none was recorded.
    #[must_use]
    pub fn src_at(&self, pc: u32) -> SrcIdx {
        match self.srcrefs.binary_search_by_key(&pc, |(p, _)| *p) {
            Ok(i) => self.srcrefs[i].1,
            Err(_) => self.src,
        }
    }

    /// The owning function, if the back link has been established.
    #[must_use]
    pub fn function(&self) -> Option<Rc<Function>> {
        self.owner.borrow().upgrade()
    }

    /// Install the owner back link on this code object and all children.
    pub fn set_owner(self: &Rc<Self>, fun: &Rc<Function>) {
        *self.owner.borrow_mut() = Rc::downgrade(fun);
        for child in &self.children {
            child.set_owner(fun);
        }
    }

    /// Stable address, used to key per-site state such as one-shot warnings.
    #[inline]
    #[must_use]
    pub fn addr(self: &Rc<Self>) -> usize {
        Rc::as_ptr(self) as usize
    }

    #[must_use]
    pub fn child(&self, idx: u32) -> Rc<Code> {
        Rc::clone(&self.children[idx as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_code(srcrefs: Vec<(u32, SrcIdx)>) -> Rc<Code> {
        Code::new(vec![0], SrcIdx(0), srcrefs, Vec::new(), Vec::new(), 1, 0)
    }

    #[test]
    fn test_src_at_exact() {
        let c = dummy_code(vec![(0, SrcIdx(5)), (3, SrcIdx(7))]);
        assert_eq!(c.src_at(0), SrcIdx(5));
        assert_eq!(c.src_at(3), SrcIdx(7));
    }

    #[test]
    fn test_src_at_fallback() {
        let c = dummy_code(vec![(3, SrcIdx(7))]);
        assert_eq!(c.src_at(1), SrcIdx(0), "falls back to the code's own src");
    }

    #[test]
    fn test_owner_unset() {
        let c = dummy_code(Vec::new());
        assert!(c.function().is_none());
    }
}
