//! Fiber stack allocation
//!
//! Each non-root fiber owns one anonymous mapping with a `PROT_NONE`
//! guard page at the low end, so overflowing the stack faults instead of
//! scribbling over the neighboring allocation.

use std::io;
use std::ptr;

use filament_core::error::{Result, RuntimeError};

const PAGE_SIZE: usize = 4096;
const GUARD_SIZE: usize = PAGE_SIZE;

/// An owned, guarded fiber stack.
pub struct FiberStack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

// The raw pointer is only dereferenced by the fiber running on this
// stack; the mapping itself is owned exclusively by the Fiber.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack of at least `size` usable bytes (rounded up to whole
    /// pages) plus a guard page below it.
    pub fn alloc(size: usize) -> Result<Self> {
        let usable = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let total = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackAlloc {
                size: total,
                source: io::Error::last_os_error(),
            });
        }
        let base = base as *mut u8;

        // Guard page at the low end; the stack grows down toward it.
        let ret = unsafe { libc::mprotect(base as *mut libc::c_void, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let source = io::Error::last_os_error();
            unsafe {
                libc::munmap(base as *mut libc::c_void, total);
            }
            return Err(RuntimeError::StackAlloc { size: total, source });
        }

        Ok(FiberStack {
            base,
            total,
            usable,
        })
    }

    /// Highest address of the mapping; initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes between the guard page and the top.
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounds_up() {
        let stack = FiberStack::alloc(1).unwrap();
        assert_eq!(stack.size(), PAGE_SIZE);
    }

    #[test]
    fn test_stack_is_writable_to_the_top() {
        let stack = FiberStack::alloc(64 * 1024).unwrap();
        unsafe {
            // Touch the first usable byte above the guard and the last byte.
            *stack.top().sub(1) = 0xAB;
            *stack.top().sub(stack.size()) = 0xCD;
            assert_eq!(*stack.top().sub(1), 0xAB);
        }
    }
}
