//! Growable buffer that generated code is written into.
//!
//! The length of the byte vector is the program counter. Patches are
//! bounds-checked writes at offsets that were emitted earlier; nothing is
//! ever removed.

use super::memory::{ExecutableMemory, MemoryError};
use crate::error::{JitError, JitResult};

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current write position.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn patch(&mut self, offset: usize, bytes: &[u8]) -> JitResult<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.code.len())
            .ok_or(JitError::PatchOutOfBounds {
                offset,
                len: bytes.len(),
            })?;
        self.code[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Overwrite one previously emitted byte.
    pub fn patch_i8(&mut self, offset: usize, value: i8) -> JitResult<()> {
        self.patch(offset, &value.to_le_bytes())
    }

    /// Overwrite four previously emitted bytes.
    pub fn patch_i32(&mut self, offset: usize, value: i32) -> JitResult<()> {
        self.patch(offset, &value.to_le_bytes())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    /// Copy the code into fresh memory and flip it to read+execute.
    pub fn finalize(self) -> Result<ExecutableMemory, MemoryError> {
        ExecutableMemory::publish(&self.code)
    }
}
