//! Deoptimization metadata layout.
//!
//! A `deopt_` opcode's immediate is a constant-pool index of a raw byte
//! vector holding a `DeoptMetadata` blob: a header with the frame count
//! followed by one record per frame. Frames are listed with the frame to
//! resume first at position 0; the environment and live stack values are
//! implicit on the operand stack at deopt time.
//!
//! Binary layout (little endian):
//!
//! ```text
//! u32 num_frames
//! num_frames x { u32 code_ref, u32 pc, u32 stack_size }
//! ```
//!
//! `code_ref` 0 names the owning function's root code object; `k > 0` names
//! `children[k - 1]` of the root.

use crate::code::Code;
use crate::error::RirError;
use std::rc::Rc;

/// Reference to the root code object of the target function.
pub const ROOT_CODE_REF: u32 = 0;

/// One frame to synthesize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub code_ref: u32,
    /// Program counter to resume at, in the referenced code object.
    pub pc: u32,
    /// Number of operand-stack values live at `pc`.
    pub stack_size: u32,
}

/// An ordered list of frames to reconstruct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptMetadata {
    pub frames: Vec<FrameInfo>,
}

impl DeoptMetadata {
    #[must_use]
    pub fn new(frames: Vec<FrameInfo>) -> Self {
        assert!(!frames.is_empty(), "deopt metadata needs at least one frame");
        Self { frames }
    }

    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Serialize into the raw-vector layout.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.frames.len() * 12);
        out.extend_from_slice(&(self.frames.len() as u32).to_le_bytes());
        for f in &self.frames {
            out.extend_from_slice(&f.code_ref.to_le_bytes());
            out.extend_from_slice(&f.pc.to_le_bytes());
            out.extend_from_slice(&f.stack_size.to_le_bytes());
        }
        out
    }

    /// Decode from the raw-vector layout.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, RirError> {
        let read_u32 = |at: usize| -> Result<u32, RirError> {
            bytes
                .get(at..at + 4)
                .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                .ok_or(RirError::BadDeoptMetadata)
        };
        let n = read_u32(0)? as usize;
        if n == 0 {
            return Err(RirError::BadDeoptMetadata);
        }
        let mut frames = Vec::with_capacity(n);
        for i in 0..n {
            let base = 4 + i * 12;
            frames.push(FrameInfo {
                code_ref: read_u32(base)?,
                pc: read_u32(base + 4)?,
                stack_size: read_u32(base + 8)?,
            });
        }
        Ok(Self { frames })
    }

    /// Resolve a frame's code reference against the target root code.
    pub fn resolve_code(root: &Rc<Code>, code_ref: u32) -> Result<Rc<Code>, RirError> {
        if code_ref == ROOT_CODE_REF {
            return Ok(Rc::clone(root));
        }
        root.children
            .get(code_ref as usize - 1)
            .cloned()
            .ok_or(RirError::BadDeoptMetadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let m = DeoptMetadata::new(vec![
            FrameInfo {
                code_ref: 0,
                pc: 12,
                stack_size: 2,
            },
            FrameInfo {
                code_ref: 1,
                pc: 3,
                stack_size: 0,
            },
        ]);
        let bytes = m.serialize();
        assert_eq!(bytes.len(), 4 + 2 * 12);
        assert_eq!(DeoptMetadata::deserialize(&bytes).unwrap(), m);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let m = DeoptMetadata::new(vec![FrameInfo {
            code_ref: 0,
            pc: 0,
            stack_size: 0,
        }]);
        let mut bytes = m.serialize();
        bytes.pop();
        assert!(DeoptMetadata::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_zero_frames_rejected() {
        assert!(DeoptMetadata::deserialize(&0u32.to_le_bytes()).is_err());
    }
}
