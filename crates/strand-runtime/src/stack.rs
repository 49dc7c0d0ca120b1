//! Fiber stack allocation
//!
//! Each fiber owns one private mmap'd stack with a PROT_NONE guard
//! page at the low end, so overflow faults instead of scribbling over
//! a neighboring allocation. The mapping is never reallocated while
//! the fiber exists.

use strand_core::constants::{GUARD_SIZE, MIN_STACK_SIZE};
use strand_core::error::{SchedError, SchedResult};

/// A private, guarded fiber stack.
pub struct FiberStack {
    base: *mut u8,
    /// Total mapping size including the guard page
    mapped: usize,
}

// The raw pointer is owned exclusively by this value.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Allocate a stack with `size` usable bytes.
    ///
    /// `size` is rounded up to the page size and floored at
    /// `MIN_STACK_SIZE`. A guard page sits below the usable range.
    pub fn allocate(size: usize) -> SchedResult<FiberStack> {
        let page = page_size();
        let usable = size.max(MIN_STACK_SIZE).div_ceil(page) * page;
        let mapped = usable + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::StackAllocationFailed);
        }

        // Guard page at the low end; stacks grow down toward it
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe {
                libc::munmap(base, mapped);
            }
            return Err(SchedError::StackAllocationFailed);
        }

        Ok(FiberStack {
            base: base as *mut u8,
            mapped,
        })
    }

    /// High end of the usable range; the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped) }
    }

    /// Usable bytes (excludes the guard page)
    #[inline]
    pub fn size(&self) -> usize {
        self.mapped - GUARD_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mapped);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
