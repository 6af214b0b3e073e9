//! Coroutine stack allocation.
//!
//! Two strategies:
//!
//! - Default-size stacks are handed out by a slab pool in O(1): a
//!   single large page-aligned mapping is carved into fixed-size
//!   chunks, recycled on return instead of being `munmap`'d.
//! - Non-default sizes fall back to a private anonymous mapping sized
//!   to the nearest page multiple.
//!
//! Optional "strong stack protection" marks the page closest to the
//! stack's high address read-only after allocation, and the allocator
//! refuses to hand out a stack smaller than `3 * page_size` when that
//! mode is on.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::{fatal, FlowrtError, FlowrtResult};

/// Fixed canary value written at the high-address sentinel of every
/// stack; checked on every switch-out.
const STACK_CANARY: u64 = 0xF1_0A_17_DE_AD_BE_EF_11;

fn page_size() -> usize {
    // SAFETY: `sysconf` with SC_PAGESIZE never fails on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned coroutine stack: a raw mapping plus the bookkeeping needed
/// to return it to its allocator (or `munmap` it) on drop.
pub struct CoroutineStack {
    base: NonNull<u8>,
    size: usize,
    protected: bool,
    origin: StackOrigin,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StackOrigin {
    Slab,
    Mapped,
}

unsafe impl Send for CoroutineStack {}

impl CoroutineStack {
    /// Highest usable address (stacks grow down on every architecture
    /// this engine targets).
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.size) }
    }

    pub fn bottom(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    fn canary_slot(&self) -> *mut u64 {
        // Sits 8 bytes below the top, inside the guard region reserved
        // by `reserve_sentinel` below.
        unsafe { self.top().sub(8) as *mut u64 }
    }

    fn write_canary(&mut self) {
        unsafe { self.canary_slot().write_volatile(STACK_CANARY) };
    }

    /// Verify the canary; a mismatch is a fatal stack-overflow
    /// condition.
    pub fn check_canary(&self, current_sp_offset_hint: usize) {
        let value = unsafe { self.canary_slot().read_volatile() };
        if value != STACK_CANARY {
            fatal(
                "coroutine::stack",
                &format!("stack canary mismatch, sp offset ~{current_sp_offset_hint} bytes from top"),
            );
        }
    }

    /// Mark the page closest to the stack top read-only ("strong stack
    /// protection"). Idempotent. Must only be called once the initial
    /// register frame has already been written into that page by
    /// `Context::new` — calling it any earlier makes the coroutine's
    /// first resume fault on its own setup write (see
    /// `engine::co_start`, which calls this right after `Context::new`,
    /// never from inside `allocate`).
    pub(super) fn protect_top_page(&mut self) -> FlowrtResult<()> {
        if self.protected {
            return Ok(());
        }
        let ps = page_size();
        let page_start = unsafe { self.top().sub(ps) };
        let rc = unsafe { libc::mprotect(page_start as *mut libc::c_void, ps, libc::PROT_READ) };
        if rc != 0 {
            return Err(FlowrtError::resource_exhausted("mprotect(PROT_READ) on stack guard page failed"));
        }
        self.protected = true;
        Ok(())
    }

    fn unprotect_top_page(&mut self) {
        if !self.protected {
            return;
        }
        let ps = page_size();
        let page_start = unsafe { self.top().sub(ps) };
        unsafe {
            libc::mprotect(page_start as *mut libc::c_void, ps, libc::PROT_READ | libc::PROT_WRITE);
        }
        self.protected = false;
    }
}

impl Drop for CoroutineStack {
    fn drop(&mut self) {
        self.unprotect_top_page();
        match self.origin {
            StackOrigin::Slab => StackSlab::global().release(self.base, self.size),
            StackOrigin::Mapped => unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.size);
            },
        }
    }
}

/// Allocate a stack of `size` bytes, `strong_protect` gating the
/// minimum-size check. `size == 0` requests the process default, served
/// from the slab; any other size maps its own private anonymous region
/// sized up to the nearest page multiple. Does *not* mark the guard page
/// read-only itself — `Context::new` still needs write access to the
/// stack's high end to lay down the initial register frame; the caller
/// protects it afterward (`engine::co_start` does this right after
/// constructing the `Context`).
pub fn allocate(size: usize, default_size: usize, strong_protect: bool) -> FlowrtResult<CoroutineStack> {
    let ps = page_size();
    if strong_protect {
        let effective_size = if size == 0 { default_size } else { size };
        if effective_size < 3 * ps {
            return Err(FlowrtError::resource_exhausted(format!(
                "stack size {effective_size} below 3*page_size ({}) required by strong stack protection",
                3 * ps
            )));
        }
    }

    let mut stack = if size == 0 {
        StackSlab::global().acquire(default_size)?
    } else {
        let rounded = round_up(size, ps);
        map_anonymous(rounded)?
    };

    stack.write_canary();
    Ok(stack)
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn map_anonymous(size: usize) -> FlowrtResult<CoroutineStack> {
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
        return Err(FlowrtError::resource_exhausted("mmap for coroutine stack failed"));
    }
    Ok(CoroutineStack {
        base: NonNull::new(ptr as *mut u8).unwrap(),
        size,
        protected: false,
        origin: StackOrigin::Mapped,
    })
}

/// Slab allocator for default-size stacks: one large mapping carved
/// into fixed-size chunks, handed out and recycled in O(1).
struct StackSlab {
    inner: Mutex<SlabInner>,
}

struct SlabInner {
    chunk_size: usize,
    free_list: Vec<NonNull<u8>>,
    regions: Vec<(NonNull<u8>, usize)>,
}

unsafe impl Send for SlabInner {}

impl StackSlab {
    fn global() -> &'static StackSlab {
        use std::sync::OnceLock;
        static SLAB: OnceLock<StackSlab> = OnceLock::new();
        SLAB.get_or_init(|| StackSlab {
            inner: Mutex::new(SlabInner { chunk_size: 0, free_list: Vec::new(), regions: Vec::new() }),
        })
    }

    fn acquire(&self, default_size: usize) -> FlowrtResult<CoroutineStack> {
        let ps = page_size();
        let chunk_size = round_up(default_size, ps);
        let mut guard = self.inner.lock().map_err(|_| FlowrtError::lock_poisoned("stack slab"))?;

        if guard.chunk_size == 0 {
            guard.chunk_size = chunk_size;
        } else if guard.chunk_size != chunk_size {
            // A differently-sized default was requested after the slab
            // was already sized; fall back to a direct mapping rather
            // than mixing chunk sizes in one pool.
            drop(guard);
            return map_anonymous(chunk_size);
        }

        if let Some(base) = guard.free_list.pop() {
            return Ok(CoroutineStack { base, size: chunk_size, protected: false, origin: StackOrigin::Slab });
        }

        // Grow the pool by one region sized for SLAB_REGION_CHUNKS chunks.
        const SLAB_REGION_CHUNKS: usize = 32;
        let region_size = chunk_size * SLAB_REGION_CHUNKS;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                region_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(FlowrtError::resource_exhausted("mmap for stack slab region failed"));
        }
        let region_base = NonNull::new(ptr as *mut u8).unwrap();
        guard.regions.push((region_base, region_size));
        for i in 1..SLAB_REGION_CHUNKS {
            let chunk = unsafe { NonNull::new_unchecked(region_base.as_ptr().add(i * chunk_size)) };
            guard.free_list.push(chunk);
        }
        Ok(CoroutineStack { base: region_base, size: chunk_size, protected: false, origin: StackOrigin::Slab })
    }

    fn release(&self, base: NonNull<u8>, size: usize) {
        if let Ok(mut guard) = self.inner.lock() {
            if guard.chunk_size == size {
                guard.free_list.push(base);
                return;
            }
        }
        // Chunk size drifted (pool was resized concurrently) or the lock
        // was poisoned: this chunk came from a direct mapping, unmap it.
        unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_allocation_roundtrip() {
        let stack = allocate(0, 128 * 1024, false).expect("alloc");
        assert_eq!(stack.len(), round_up(128 * 1024, page_size()));
        stack.check_canary(0);
    }

    #[test]
    fn mapped_allocation_rounds_to_page() {
        let ps = page_size();
        let stack = allocate(ps + 1, 128 * 1024, false).expect("alloc");
        assert_eq!(stack.len() % ps, 0);
        assert!(stack.len() >= ps + 1);
    }

    #[test]
    fn strong_protect_rejects_undersized_stack() {
        let ps = page_size();
        let err = allocate(ps, 128 * 1024, true);
        assert!(err.is_err());
    }

    #[test]
    fn strong_protect_accepts_sufficient_stack() {
        let ps = page_size();
        let mut stack = allocate(4 * ps, 128 * 1024, true).expect("alloc");
        stack.protect_top_page().expect("protect");
        assert!(stack.protected);
    }

    #[test]
    fn strong_protect_rejects_undersized_default_stack() {
        let ps = page_size();
        // size == 0 requests the slab-pooled default; the 3*page_size
        // floor must still apply to `default_size`, not be skipped.
        let err = allocate(0, ps, true);
        assert!(err.is_err());
    }
}
