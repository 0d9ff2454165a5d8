//! Hugepage-backed size-class allocator.
//!
//! `HugeAlloc` carves fixed power-of-two size classes out of large,
//! 2 MiB-aligned chunks that are advised into hugepages where the OS
//! supports it. Freed buffers are recycled through per-class free lists,
//! so steady-state allocation is a free-list pop.

use std::ptr::NonNull;

/// Alignment of every allocation handed out (cache line).
pub const ALLOC_ALIGN: usize = 64;

/// Smallest size class in bytes.
pub const MIN_CLASS_SIZE: usize = 64;

/// Largest size class in bytes.
pub const MAX_CLASS_SIZE: usize = 8 * 1024 * 1024;

/// Alignment of backing chunks (hugepage-friendly).
const CHUNK_ALIGN: usize = 2 * 1024 * 1024;

/// Number of size classes (64 B through 8 MiB, doubling).
const NUM_CLASSES: usize =
    (MAX_CLASS_SIZE.trailing_zeros() - MIN_CLASS_SIZE.trailing_zeros() + 1) as usize;

/// A raw allocation handle from [`HugeAlloc`].
///
/// The handle does not free itself on drop; it must be returned through
/// [`HugeAlloc::free`] (or abandoned, in which case the memory is reclaimed
/// when the allocator's chunks are released).
#[derive(Debug)]
pub struct Buffer {
    ptr: NonNull<u8>,
    class_size: usize,
}

impl Buffer {
    /// Pointer to the start of the allocation.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the allocation's size class in bytes.
    #[inline]
    pub fn class_size(&self) -> usize {
        self.class_size
    }
}

// A Buffer is a plain handle into allocator-owned memory.
unsafe impl Send for Buffer {}

/// A backing chunk obtained from the OS.
struct Chunk {
    ptr: NonNull<u8>,
    size: usize,
    used: usize,
}

/// Size-class allocator over hugepage-advised chunks.
pub struct HugeAlloc {
    chunks: Vec<Chunk>,
    free_lists: [Vec<NonNull<u8>>; NUM_CLASSES],
    /// Size of the next chunk to reserve.
    next_chunk_size: usize,
}

// The allocator is shared with background workers behind a mutex.
unsafe impl Send for HugeAlloc {}

impl HugeAlloc {
    /// Create an allocator with an initial reservation of `initial_size`
    /// bytes. Fails if the initial reservation cannot be made.
    pub fn new(initial_size: usize) -> std::io::Result<Self> {
        let initial_size = initial_size.max(MAX_CLASS_SIZE);
        let mut alloc = Self {
            chunks: Vec::new(),
            free_lists: std::array::from_fn(|_| Vec::new()),
            next_chunk_size: initial_size,
        };
        if !alloc.reserve_chunk() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "initial hugepage reservation failed",
            ));
        }
        Ok(alloc)
    }

    /// Round a request up to its size class. `None` if it exceeds the
    /// largest class.
    #[inline]
    pub fn class_size_for(bytes: usize) -> Option<usize> {
        if bytes > MAX_CLASS_SIZE {
            return None;
        }
        Some(bytes.next_power_of_two().max(MIN_CLASS_SIZE))
    }

    #[inline]
    fn class_index(class_size: usize) -> usize {
        (class_size.trailing_zeros() - MIN_CLASS_SIZE.trailing_zeros()) as usize
    }

    /// Allocate at least `bytes` bytes. Returns `None` on out-of-memory or
    /// when the request exceeds the largest size class; neither is fatal.
    pub fn alloc(&mut self, bytes: usize) -> Option<Buffer> {
        let class_size = Self::class_size_for(bytes)?;
        let cls = Self::class_index(class_size);

        if let Some(ptr) = self.free_lists[cls].pop() {
            return Some(Buffer { ptr, class_size });
        }

        // Carve from the most recent chunk, reserving a new one if needed.
        loop {
            if let Some(chunk) = self.chunks.last_mut() {
                if chunk.size - chunk.used >= class_size {
                    let ptr = unsafe { NonNull::new_unchecked(chunk.ptr.as_ptr().add(chunk.used)) };
                    chunk.used += class_size;
                    return Some(Buffer { ptr, class_size });
                }
            }
            if !self.reserve_chunk() {
                return None;
            }
        }
    }

    /// Return a buffer to its size-class free list.
    pub fn free(&mut self, buffer: Buffer) {
        let cls = Self::class_index(buffer.class_size);
        self.free_lists[cls].push(buffer.ptr);
    }

    /// Reserve a new backing chunk from the OS. The pages are not touched
    /// here, so reservation cost is virtual only.
    fn reserve_chunk(&mut self) -> bool {
        let size = self.next_chunk_size;
        let mut raw: *mut libc::c_void = std::ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut raw, CHUNK_ALIGN, size) };
        if rc != 0 || raw.is_null() {
            return false;
        }

        #[cfg(target_os = "linux")]
        unsafe {
            // Best effort; carry on with 4 KiB pages if THP is unavailable.
            libc::madvise(raw, size, libc::MADV_HUGEPAGE);
        }

        self.chunks.push(Chunk {
            ptr: unsafe { NonNull::new_unchecked(raw as *mut u8) },
            size,
            used: 0,
        });
        // Double subsequent reservations, bounded to keep virtual growth sane.
        self.next_chunk_size = (self.next_chunk_size * 2).min(1 << 31);
        true
    }

    /// Total bytes reserved from the OS.
    pub fn reserved_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

impl Drop for HugeAlloc {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            unsafe { libc::free(chunk.ptr.as_ptr() as *mut libc::c_void) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_rounding() {
        assert_eq!(HugeAlloc::class_size_for(1), Some(MIN_CLASS_SIZE));
        assert_eq!(HugeAlloc::class_size_for(64), Some(64));
        assert_eq!(HugeAlloc::class_size_for(65), Some(128));
        assert_eq!(HugeAlloc::class_size_for(4097), Some(8192));
        assert_eq!(HugeAlloc::class_size_for(MAX_CLASS_SIZE), Some(MAX_CLASS_SIZE));
        assert_eq!(HugeAlloc::class_size_for(MAX_CLASS_SIZE + 1), None);
    }

    #[test]
    fn test_alloc_free_recycles() {
        let mut alloc = HugeAlloc::new(16 * 1024 * 1024).unwrap();

        let a = alloc.alloc(1000).unwrap();
        assert_eq!(a.class_size(), 1024);
        let a_ptr = a.as_ptr();
        alloc.free(a);

        // Same class comes back off the free list.
        let b = alloc.alloc(600).unwrap();
        assert_eq!(b.as_ptr(), a_ptr);
        alloc.free(b);
    }

    #[test]
    fn test_alignment() {
        let mut alloc = HugeAlloc::new(16 * 1024 * 1024).unwrap();
        for req in [1usize, 100, 4096, 100_000] {
            let buf = alloc.alloc(req).unwrap();
            assert_eq!(buf.as_ptr() as usize % ALLOC_ALIGN, 0);
            alloc.free(buf);
        }
    }

    #[test]
    fn test_grows_past_initial_chunk() {
        let mut alloc = HugeAlloc::new(MAX_CLASS_SIZE).unwrap();
        let a = alloc.alloc(MAX_CLASS_SIZE).unwrap();
        let b = alloc.alloc(MAX_CLASS_SIZE).unwrap();
        assert!(alloc.reserved_bytes() >= 2 * MAX_CLASS_SIZE);
        alloc.free(a);
        alloc.free(b);
    }

    #[test]
    fn test_oversize_is_none() {
        let mut alloc = HugeAlloc::new(MAX_CLASS_SIZE).unwrap();
        assert!(alloc.alloc(MAX_CLASS_SIZE + 1).is_none());
    }
}
