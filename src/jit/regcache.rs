//! Cache of VM registers held in host registers.
//!
//! Each VM register is either absent, cached (the host register equals the
//! state block field) or dirty (the host register is newer). The frame
//! pointer is read-only and never becomes dirty.

use super::abi::{CONTEXT_REG, FP_REG, MARK_SP_REG, SP_REG};
use super::codebuf::CodeBuffer;
use super::x86_64::{Reg, X86_64Assembler};
use crate::vm::OpFlags;
use crate::vm::layout::{FRAME_POINTER_OFFSET, MARK_STACK_POINTER_OFFSET, STACK_POINTER_OFFSET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmReg {
    StackPointer,
    MarkStackPointer,
    FramePointer,
}

impl VmReg {
    pub const ALL: [VmReg; 3] = [VmReg::StackPointer, VmReg::MarkStackPointer, VmReg::FramePointer];

    pub fn host(self) -> Reg {
        match self {
            VmReg::StackPointer => SP_REG,
            VmReg::MarkStackPointer => MARK_SP_REG,
            VmReg::FramePointer => FP_REG,
        }
    }

    /// Offset of the backing field in the state block.
    pub fn state_offset(self) -> i32 {
        match self {
            VmReg::StackPointer => STACK_POINTER_OFFSET,
            VmReg::MarkStackPointer => MARK_STACK_POINTER_OFFSET,
            VmReg::FramePointer => FRAME_POINTER_OFFSET,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegCache {
    cached: [bool; 3],
    dirty: [bool; 3],
}

impl RegCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cached(&self, r: VmReg) -> bool {
        self.cached[r.index()]
    }

    pub fn is_dirty(&self, r: VmReg) -> bool {
        self.dirty[r.index()]
    }

    pub fn any_dirty(&self) -> bool {
        self.dirty.iter().any(|&d| d)
    }

    /// Loads `r` from the state block unless it is already cached.
    pub fn ensure_loaded(&mut self, buf: &mut CodeBuffer, r: VmReg) -> Reg {
        if !self.is_cached(r) {
            X86_64Assembler::new(buf).mov_rm(r.host(), CONTEXT_REG, r.state_offset());
            self.cached[r.index()] = true;
        }
        r.host()
    }

    /// Records that the host register now holds a newer value.
    pub fn mark_dirty(&mut self, r: VmReg) {
        debug_assert!(self.is_cached(r), "{:?} dirtied while not cached", r);
        debug_assert!(r != VmReg::FramePointer, "frame pointer is read-only");
        if r != VmReg::FramePointer {
            self.dirty[r.index()] = true;
        }
    }

    /// Writes every dirty register back. Registers stay cached.
    pub fn flush(&mut self, buf: &mut CodeBuffer) {
        let mut asm = X86_64Assembler::new(buf);
        for r in VmReg::ALL {
            if self.dirty[r.index()] {
                asm.mov_mr(CONTEXT_REG, r.state_offset(), r.host());
                self.dirty[r.index()] = false;
            }
        }
    }

    /// Forgets a cached register. It must not be dirty.
    pub fn invalidate(&mut self, r: VmReg) {
        debug_assert!(!self.is_dirty(r), "{:?} invalidated while dirty", r);
        self.cached[r.index()] = false;
        self.dirty[r.index()] = false;
    }

    /// Forgets everything; used at join points after a flush.
    pub fn reset(&mut self) {
        debug_assert!(!self.any_dirty(), "reset with dirty registers");
        *self = Self::default();
    }

    /// Flushes before a call and drops whatever the callee may move.
    pub fn sync_for_call(&mut self, buf: &mut CodeBuffer, flags: OpFlags) {
        self.flush(buf);
        if flags.contains(OpFlags::UPDATE_SP) {
            self.invalidate(VmReg::StackPointer);
        }
        if flags.contains(OpFlags::UPDATE_MARK_SP) {
            self.invalidate(VmReg::MarkStackPointer);
        }
        if flags.contains(OpFlags::UPDATE_FP) {
            self.invalidate(VmReg::FramePointer);
        }
    }
}
