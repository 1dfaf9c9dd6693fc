//! Executable memory for published code.
//!
//! Code is copied into a fresh anonymous mapping while it is writable, then
//! the mapping is flipped to read+execute and never written again.

use std::ptr::NonNull;

#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed(std::io::Error),
    ProtectionFailed(std::io::Error),
    InvalidSize,
    Sealed,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed(e) => write!(f, "mapping code memory failed: {}", e),
            MemoryError::ProtectionFailed(e) => write!(f, "making code executable failed: {}", e),
            MemoryError::InvalidSize => write!(f, "invalid code size"),
            MemoryError::Sealed => write!(f, "code memory is already executable"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A page-aligned block holding published machine code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    /// Mapped size, a multiple of the page size.
    size: usize,
    /// Bytes of code at the start of the block.
    len: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map a writable block large enough for `len` bytes.
    pub fn new(len: usize) -> Result<Self, MemoryError> {
        if len == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page = page_size();
        let size = len.div_ceil(page) * page;
        let ptr = map(size)?;
        Ok(Self {
            ptr,
            size,
            len: 0,
            executable: false,
        })
    }

    /// Map, fill and seal in one step.
    pub fn publish(code: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::new(code.len())?;
        mem.write(0, code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.size)
            .ok_or(MemoryError::InvalidSize)?;
        // SAFETY: `offset..end` lies inside the writable mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        self.len = self.len.max(end);
        Ok(())
    }

    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if !self.executable {
            protect_exec(self.ptr, self.size)?;
            self.executable = true;
        }
        Ok(())
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mapped size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes of code written.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// The published code.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the first `len` bytes were initialised by `write` and the
        // mapping is readable in both states.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

#[cfg(unix)]
fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
    // SAFETY: anonymous private mapping with no address hint.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed(std::io::Error::last_os_error()));
    }
    NonNull::new(ptr as *mut u8)
        .ok_or_else(|| MemoryError::AllocationFailed(std::io::Error::other("null mapping")))
}

#[cfg(unix)]
fn protect_exec(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
    // SAFETY: `ptr..ptr+size` is a mapping created by `map`.
    let rc = unsafe {
        libc::mprotect(ptr.as_ptr() as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_EXEC)
    };
    if rc != 0 {
        return Err(MemoryError::ProtectionFailed(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(unix)]
fn unmap(ptr: NonNull<u8>, size: usize) {
    // SAFETY: `ptr..ptr+size` is a mapping created by `map`.
    unsafe {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
    }
}

// Without mmap the block is ordinary heap memory. It can be inspected but
// the compiler refuses to run it.
#[cfg(not(unix))]
fn layout(size: usize) -> Result<std::alloc::Layout, MemoryError> {
    std::alloc::Layout::from_size_align(size, page_size()).map_err(|_| MemoryError::InvalidSize)
}

#[cfg(not(unix))]
fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
    let layout = layout(size)?;
    // SAFETY: `layout` has a non-zero size.
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr).ok_or_else(|| MemoryError::AllocationFailed(std::io::Error::other("out of memory")))
}

#[cfg(not(unix))]
fn protect_exec(_ptr: NonNull<u8>, _size: usize) -> Result<(), MemoryError> {
    Ok(())
}

#[cfg(not(unix))]
fn unmap(ptr: NonNull<u8>, size: usize) {
    if let Ok(layout) = layout(size) {
        // SAFETY: allocated by `map` with the same layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unmap(self.ptr, self.size);
    }
}

// The block is immutable once sealed and owned by exactly one value.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_rounds_to_pages() {
        let mem = ExecutableMemory::publish(&[0xC3]).unwrap();
        assert!(mem.size() >= 1);
        assert_eq!(mem.size() % page_size(), 0);
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.bytes(), &[0xC3]);
        assert!(mem.is_executable());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(ExecutableMemory::new(0), Err(MemoryError::InvalidSize)));
    }

    #[test]
    fn test_cannot_write_after_seal() {
        let mut mem = ExecutableMemory::new(16).unwrap();
        mem.write(0, &[0x90, 0xC3]).unwrap();
        mem.make_executable().unwrap();
        assert!(matches!(mem.write(0, &[0x90]), Err(MemoryError::Sealed)));
    }

    #[test]
    fn test_write_past_end_rejected() {
        let mut mem = ExecutableMemory::new(8).unwrap();
        let size = mem.size();
        assert!(mem.write(size, &[0x90]).is_err());
    }
}
