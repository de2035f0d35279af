//! Editable bytecode lists.
//!
//! The editor holds a code object's instructions as a doubly-linked list
//! (arena-indexed, no raw pointers) with jump targets resolved to labels.
//! Every edit is O(1), and cursors survive edits that do not delete the
//! node they sit on. Linearizing back to a byte stream recomputes offsets.

use crate::bytecode::instruction::BC;
use rir_core::code::Code;
use rustc_hash::FxHashMap;

/// A label in the editor's own numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// A position in the list. Ids are stable for the life of the editor; a
/// deleted node's id must not be dereferenced again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// Jump flavors carried by [`EditNode::Jump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Br,
    BrTrue,
    BrFalse,
    BeginLoop,
}

/// One list entry: an ordinary instruction, a jump with a symbolic target,
/// or a label marking a jump target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditNode {
    Label(LabelId),
    Instr(BC),
    Jump { kind: JumpKind, target: LabelId },
}

impl EditNode {
    /// Does control fall through to the next node?
    #[must_use]
    pub fn falls_through(&self) -> bool {
        match self {
            EditNode::Label(_) => true,
            EditNode::Jump { kind, .. } => !matches!(kind, JumpKind::Br),
            EditNode::Instr(bc) => !bc.is_exit(),
        }
    }
}

#[derive(Debug)]
struct Node {
    item: EditNode,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    live: bool,
}

/// The editable instruction list for one code object.
#[derive(Debug)]
pub struct CodeEditor {
    arena: Vec<Node>,
    first: Option<NodeId>,
    last: Option<NodeId>,
    labels: Vec<NodeId>,
    changed: bool,
}

impl CodeEditor {
    /// Decode a code object into an editable list.
    pub fn from_code(code: &Code) -> Result<Self, rir_core::error::RirError> {
        // First pass: find jump targets.
        let mut targets: Vec<usize> = Vec::new();
        let mut pc = 0;
        while pc < code.bc.len() {
            let (bc, next) = BC::decode(&code.bc, pc)?;
            if let Some(t) = bc.jmp_target(next) {
                targets.push(t);
            }
            pc = next;
        }
        targets.sort_unstable();
        targets.dedup();
        let label_of: FxHashMap<usize, LabelId> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (*t, LabelId(i as u32)))
            .collect();

        // Second pass: build the list, inserting labels before targets.
        let mut ed = CodeEditor {
            arena: Vec::new(),
            first: None,
            last: None,
            labels: vec![NodeId(u32::MAX); targets.len()],
            changed: false,
        };
        let mut pc = 0;
        while pc < code.bc.len() {
            if let Some(l) = label_of.get(&pc) {
                let id = ed.push_back(EditNode::Label(*l));
                ed.labels[l.0 as usize] = id;
            }
            let (bc, next) = BC::decode(&code.bc, pc)?;
            let node = match bc.jmp_target(next) {
                Some(t) => EditNode::Jump {
                    kind: match bc {
                        BC::Br(_) => JumpKind::Br,
                        BC::BrTrue(_) => JumpKind::BrTrue,
                        BC::BrFalse(_) => JumpKind::BrFalse,
                        BC::BeginLoop(_) => JumpKind::BeginLoop,
                        _ => unreachable!(),
                    },
                    target: label_of[&t],
                },
                None => EditNode::Instr(bc),
            };
            ed.push_back(node);
            pc = next;
        }
        ed.changed = false;
        Ok(ed)
    }

    fn push_back(&mut self, item: EditNode) -> NodeId {
        let id = NodeId(self.arena.len() as u32);
        self.arena.push(Node {
            item,
            prev: self.last,
            next: None,
            live: true,
        });
        if let Some(last) = self.last {
            self.arena[last.0 as usize].next = Some(id);
        } else {
            self.first = Some(id);
        }
        self.last = Some(id);
        id
    }

    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<NodeId> {
        self.first
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> &EditNode {
        let n = &self.arena[id.0 as usize];
        debug_assert!(n.live, "dereferenced a deleted node");
        &n.item
    }

    #[must_use]
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.arena[id.0 as usize].next
    }

    #[must_use]
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.arena[id.0 as usize].prev
    }

    /// The node carrying a label.
    #[must_use]
    pub fn label_node(&self, l: LabelId) -> NodeId {
        self.labels[l.0 as usize]
    }

    /// Has any edit been made?
    #[must_use]
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Insert a node before `at`, returning the new node's id.
    pub fn insert_before(&mut self, at: NodeId, item: EditNode) -> NodeId {
        self.changed = true;
        let prev = self.arena[at.0 as usize].prev;
        let id = NodeId(self.arena.len() as u32);
        self.arena.push(Node {
            item,
            prev,
            next: Some(at),
            live: true,
        });
        self.arena[at.0 as usize].prev = Some(id);
        match prev {
            Some(p) => self.arena[p.0 as usize].next = Some(id),
            None => self.first = Some(id),
        }
        id
    }

    /// Insert a node after `at`, returning the new node's id.
    pub fn insert_after(&mut self, at: NodeId, item: EditNode) -> NodeId {
        self.changed = true;
        let next = self.arena[at.0 as usize].next;
        let id = NodeId(self.arena.len() as u32);
        self.arena.push(Node {
            item,
            prev: Some(at),
            next,
            live: true,
        });
        self.arena[at.0 as usize].next = Some(id);
        match next {
            Some(n) => self.arena[n.0 as usize].prev = Some(id),
            None => self.last = Some(id),
        }
        id
    }

    /// Remove a node, returning the id of its successor. Labels must not be
    /// removed while jumps still reference them.
    pub fn remove(&mut self, at: NodeId) -> Option<NodeId> {
        self.changed = true;
        let (prev, next) = {
            let n = &mut self.arena[at.0 as usize];
            debug_assert!(n.live);
            n.live = false;
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.arena[p.0 as usize].next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.arena[n.0 as usize].prev = prev,
            None => self.last = prev,
        }
        next
    }

    /// Iterate live node ids in list order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut cur = self.first;
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.next(id);
            Some(id)
        })
    }

    /// Linearize back to a byte stream, recomputing jump offsets.
    #[must_use]
    pub fn assemble(&self) -> Vec<u8> {
        // Lay out positions; labels occupy no bytes.
        let mut pos: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut at = 0;
        for id in self.iter() {
            pos.insert(id, at);
            at += match self.get(id) {
                EditNode::Label(_) => 0,
                EditNode::Instr(bc) => bc.size(),
                // All jumps carry one 32-bit offset.
                EditNode::Jump { .. } => BC::Br(0).size(),
            };
        }
        let mut out = Vec::with_capacity(at);
        for id in self.iter() {
            match self.get(id) {
                EditNode::Label(_) => {}
                EditNode::Instr(bc) => bc.encode(&mut out),
                EditNode::Jump { kind, target } => {
                    let after = out.len() + BC::Br(0).size();
                    let tpos = pos[&self.label_node(*target)];
                    let off = tpos as i64 - after as i64;
                    let bc = match kind {
                        JumpKind::Br => BC::Br(off as i32),
                        JumpKind::BrTrue => BC::BrTrue(off as i32),
                        JumpKind::BrFalse => BC::BrFalse(off as i32),
                        JumpKind::BeginLoop => BC::BeginLoop(off as i32),
                    };
                    bc.encode(&mut out);
                }
            }
        }
        out
    }
}
