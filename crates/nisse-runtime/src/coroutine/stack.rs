//! Coroutine stacks.
//!
//! Each stack is a private anonymous mapping with a `PROT_NONE` guard page
//! below the usable range, so an overflow faults instead of silently
//! corrupting whatever the allocator placed next to it.

use std::io;
use std::ptr;

/// Default usable stack size per coroutine.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

const PAGE_SIZE: usize = 4096;

/// An owned, mmap'd coroutine stack.
pub struct CoroStack {
    base: *mut u8,
    total: usize,
}

impl CoroStack {
    /// Map a stack with at least `size` usable bytes plus a guard page.
    pub fn new(size: usize) -> io::Result<Self> {
        let usable = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let total = usable + PAGE_SIZE;

        // Reserve the whole range inaccessible, then open up everything
        // above the guard page.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let rc = unsafe {
            libc::mprotect(
                (base as *mut u8).add(PAGE_SIZE) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(Self {
            base: base as *mut u8,
            total,
        })
    }

    /// Upper end of the usable range; stacks grow downward from here.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (guard page excluded).
    pub fn usable(&self) -> usize {
        self.total - PAGE_SIZE
    }
}

impl Drop for CoroStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

// The mapping is plain memory; ownership can move between threads.
unsafe impl Send for CoroStack {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_page_size() {
        let stack = CoroStack::new(1).unwrap();
        assert_eq!(stack.usable(), PAGE_SIZE);
    }

    #[test]
    fn top_is_writable() {
        let stack = CoroStack::new(DEFAULT_STACK_SIZE).unwrap();
        assert_eq!(stack.usable(), DEFAULT_STACK_SIZE);
        unsafe {
            let below_top = stack.top().sub(8);
            below_top.write(0xA5);
            assert_eq!(below_top.read(), 0xA5);
        }
    }
}
