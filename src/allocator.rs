//! Memory allocators for tensor buffers.
//!
//! Kernels never allocate tensor storage directly. All buffers are obtained
//! from an [`Allocator`] supplied through [`RunOptions`](crate::RunOptions),
//! so that callers can substitute pooling or budgeted allocators.

use std::alloc::Layout;
use std::error::Error;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use rustc_hash::FxHashMap;

/// Alignment, in bytes, of all allocations.
///
/// This is large enough for aligned loads of the widest vector registers used
/// by the kernels, and matches a typical cache line.
pub const MALLOC_ALIGN: usize = 64;

/// Interface for allocators which provide tensor storage.
pub trait Allocator: Send + Sync {
    /// Allocate `bytes` bytes aligned to [`MALLOC_ALIGN`].
    ///
    /// Returns `None` if the allocation fails. `bytes` is never zero.
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Release memory previously returned by [`allocate`](Allocator::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a call to `allocate` on this
    /// allocator with the same value of `bytes`, and must not be used after
    /// this call.
    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Error returned when an allocator cannot satisfy a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocError {
    /// Size of the failed request in bytes.
    pub bytes: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to allocate {} bytes", self.bytes)
    }
}

impl Error for AllocError {}

fn layout_for(bytes: usize) -> Option<Layout> {
    Layout::from_size_align(bytes, MALLOC_ALIGN).ok()
}

/// Allocator backed by the global Rust allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = layout_for(bytes)?;
        // Safety: `bytes` is non-zero.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        if let Some(layout) = layout_for(bytes) {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Return the shared system allocator, used when options don't specify one.
pub fn system_allocator() -> Arc<dyn Allocator> {
    static SYSTEM: OnceLock<Arc<dyn Allocator>> = OnceLock::new();
    SYSTEM.get_or_init(|| Arc::new(SystemAllocator)).clone()
}

/// A block of memory owned by a [`PoolAllocator`].
struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

// Safety: A block is exclusively owned by the pool's free list.
unsafe impl Send for Block {}

/// An allocator which keeps released buffers for reuse.
///
/// The purpose of this pool is to avoid the overhead of repeatedly allocating
/// and freeing large buffers for the transient tensors created during each
/// forward pass. Requests are satisfied with the smallest free block that is
/// large enough. Requests below a configurable threshold go straight to the
/// system allocator.
///
/// The pool assumes that it manages a small number of buffers at any given
/// time, and isn't optimized for managing a large number of buffers.
pub struct PoolAllocator {
    /// Blocks available for reuse.
    free: Mutex<Vec<Block>>,

    /// Capacity of each block currently handed out, keyed by address.
    in_use: Mutex<FxHashMap<usize, usize>>,

    /// Number of allocation requests received.
    alloc_count: AtomicUsize,

    /// Number of allocation requests fulfilled from the pool.
    hit_count: AtomicUsize,

    /// Minimum size, in bytes, of buffers to store in the pool.
    min_size: usize,
}

impl PoolAllocator {
    pub fn new() -> PoolAllocator {
        PoolAllocator {
            free: Mutex::new(Vec::new()),
            in_use: Mutex::new(FxHashMap::default()),
            alloc_count: AtomicUsize::new(0),
            hit_count: AtomicUsize::new(0),
            min_size: 128,
        }
    }

    /// Configure the minimum size for allocations from the pool.
    ///
    /// Allocations below this size will fall back to the system allocator.
    pub fn with_min_size(mut self, n_bytes: usize) -> Self {
        self.min_size = n_bytes;
        self
    }

    /// Return the total number of allocation requests.
    ///
    /// This excludes allocations below the minimum size threshold.
    pub fn alloc_count(&self) -> usize {
        self.alloc_count.load(Ordering::Acquire)
    }

    /// Return the number of allocation requests that were fulfilled using
    /// blocks in the pool.
    pub fn hit_count(&self) -> usize {
        self.hit_count.load(Ordering::Acquire)
    }

    /// Return the number of free blocks in the pool.
    pub fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return all free blocks to the system allocator.
    ///
    /// Blocks that are currently in use are unaffected.
    pub fn clear(&self) {
        let blocks = std::mem::take(&mut *self.free.lock().unwrap());
        for block in blocks {
            // Safety: Free blocks were allocated by `SystemAllocator` with
            // their recorded size.
            unsafe { SystemAllocator.release(block.ptr, block.size) };
        }
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for PoolAllocator {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes < self.min_size {
            return SystemAllocator.allocate(bytes);
        }

        self.alloc_count.fetch_add(1, Ordering::AcqRel);

        let reused = {
            let mut free = self.free.lock().unwrap();
            let best_fit = free
                .iter()
                .enumerate()
                .filter(|(_, block)| block.size >= bytes)
                .min_by_key(|(_, block)| block.size)
                .map(|(idx, _)| idx);
            best_fit.map(|idx| free.swap_remove(idx))
        };

        let block = match reused {
            Some(block) => {
                self.hit_count.fetch_add(1, Ordering::AcqRel);
                block
            }
            None => Block {
                ptr: SystemAllocator.allocate(bytes)?,
                size: bytes,
            },
        };

        self.in_use
            .lock()
            .unwrap()
            .insert(block.ptr.as_ptr() as usize, block.size);
        Some(block.ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        let size = self.in_use.lock().unwrap().remove(&(ptr.as_ptr() as usize));
        match size {
            Some(size) => self.free.lock().unwrap().push(Block { ptr, size }),
            None => SystemAllocator.release(ptr, bytes),
        }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Allocators used by tests to simulate allocation failure.
#[cfg(test)]
pub(crate) mod testing {
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{Allocator, SystemAllocator};

    /// Allocator which fails once a fixed number of allocations have been
    /// made.
    pub struct LimitedAllocator {
        remaining: AtomicUsize,
    }

    impl LimitedAllocator {
        pub fn new(max_allocations: usize) -> Self {
            LimitedAllocator {
                remaining: AtomicUsize::new(max_allocations),
            }
        }
    }

    impl Allocator for LimitedAllocator {
        fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
            self.remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .ok()?;
            SystemAllocator.allocate(bytes)
        }

        unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
            SystemAllocator.release(ptr, bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::LimitedAllocator;
    use super::{Allocator, PoolAllocator, SystemAllocator, MALLOC_ALIGN};

    #[test]
    fn test_system_allocator_alignment() {
        let alloc = SystemAllocator;
        for size in [1, 3, 64, 1000] {
            let ptr = alloc.allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % MALLOC_ALIGN, 0);
            unsafe { alloc.release(ptr, size) };
        }
    }

    #[test]
    fn test_pool_allocator_reuse() {
        let pool = PoolAllocator::new();

        let a = pool.allocate(1024).unwrap();
        let b = pool.allocate(4096).unwrap();
        assert_eq!(pool.alloc_count(), 2);
        assert_eq!(pool.hit_count(), 0);

        unsafe {
            pool.release(a, 1024);
            pool.release(b, 4096);
        }
        assert_eq!(pool.len(), 2);

        // Best fit should pick the 1024 byte block.
        let c = pool.allocate(512).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.hit_count(), 1);
        assert_eq!(pool.len(), 1);

        // Too large for any free block.
        let d = pool.allocate(8192).unwrap();
        assert_eq!(pool.hit_count(), 1);

        unsafe {
            pool.release(c, 512);
            pool.release(d, 8192);
        }
        assert_eq!(pool.len(), 3);

        pool.clear();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_allocator_small_requests_bypass_pool() {
        let pool = PoolAllocator::new().with_min_size(256);
        let ptr = pool.allocate(16).unwrap();
        unsafe { pool.release(ptr, 16) };
        assert_eq!(pool.alloc_count(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_limited_allocator() {
        let alloc = LimitedAllocator::new(1);
        let ptr = alloc.allocate(32).unwrap();
        assert!(alloc.allocate(32).is_none());
        unsafe { alloc.release(ptr, 32) };
    }
}
