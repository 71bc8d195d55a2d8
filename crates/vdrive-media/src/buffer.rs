//! I/O buffers handed to storage for the lifetime of a request.
//!
//! Two allocation strategies exist and the allocator never falls back from one to the other:
//!
//! - page-aligned memory rounded up to [`PAGE_SIZE`], for ordinary disks;
//! - locked memory for encrypted disks: pinned with `mlock` so plaintext never reaches swap,
//!   zero-initialized, exposing exactly the requested number of bytes and wiped on release.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use thiserror::Error;
use zeroize::Zeroize;

use crate::{MediaError, Result};

pub const PAGE_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferPolicy {
    PageAligned,
    Locked,
}

/// Raised when the host refuses an I/O buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to allocate a {policy:?} I/O buffer of {size} bytes")]
pub struct AllocError {
    pub policy: BufferPolicy,
    pub size: usize,
}

impl From<AllocError> for MediaError {
    fn from(err: AllocError) -> Self {
        MediaError::OutOfMemory(err.size)
    }
}

/// Owned, page-backed I/O buffer.
///
/// Dereferences to exactly the requested number of bytes. The backing allocation is always at
/// least one page so the pointer is never dangling.
pub struct IoBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    policy: BufferPolicy,
}

// SAFETY: The buffer exclusively owns its allocation; shared access only hands out `&[u8]`.
unsafe impl Send for IoBuffer {}
// SAFETY: No interior mutability without `&mut`.
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    pub fn page_aligned(size: usize) -> std::result::Result<Self, AllocError> {
        Self::allocate(size, BufferPolicy::PageAligned)
    }

    pub fn locked(size: usize) -> std::result::Result<Self, AllocError> {
        let buf = Self::allocate(size, BufferPolicy::Locked)?;
        if let Err(err) = lock_pages(buf.ptr, buf.layout.size()) {
            tracing::warn!(size, error = %err, "failed to lock I/O buffer pages");
            // Dropping unlocks, which is harmless on pages that were never locked.
            return Err(AllocError {
                policy: BufferPolicy::Locked,
                size,
            });
        }
        Ok(buf)
    }

    fn allocate(size: usize, policy: BufferPolicy) -> std::result::Result<Self, AllocError> {
        let err = AllocError { policy, size };
        let capacity = size
            .max(1)
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(err)?;
        let layout = Layout::from_size_align(capacity, PAGE_SIZE).map_err(|_| err)?;

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(err)?;

        Ok(Self {
            ptr,
            len: size,
            layout,
            policy,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing allocation.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for IoBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `layout.size() >= len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for IoBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len)
            .field("capacity", &self.layout.size())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        if self.policy == BufferPolicy::Locked {
            // SAFETY: the whole allocation is initialized and exclusively ours.
            let all = unsafe {
                std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size())
            };
            all.zeroize();
            unlock_pages(self.ptr, self.layout.size());
        }
        // SAFETY: allocated in `allocate` with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(unix)]
fn lock_pages(ptr: NonNull<u8>, len: usize) -> std::io::Result<()> {
    // SAFETY: the range is a live allocation owned by the caller.
    let rc = unsafe { libc::mlock(ptr.as_ptr().cast::<libc::c_void>(), len) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn unlock_pages(ptr: NonNull<u8>, len: usize) {
    // SAFETY: as in `lock_pages`. Failure only means the pages were not locked.
    unsafe {
        libc::munlock(ptr.as_ptr().cast::<libc::c_void>(), len);
    }
}

#[cfg(not(unix))]
fn lock_pages(_ptr: NonNull<u8>, _len: usize) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "page locking is not available on this host",
    ))
}

#[cfg(not(unix))]
fn unlock_pages(_ptr: NonNull<u8>, _len: usize) {}

/// Per-disk buffer allocator. Stateless apart from the chosen policy.
#[derive(Clone, Copy, Debug)]
pub struct IoBufAllocator {
    policy: BufferPolicy,
}

impl IoBufAllocator {
    pub fn new(encrypted: bool) -> Self {
        let policy = if encrypted {
            BufferPolicy::Locked
        } else {
            BufferPolicy::PageAligned
        };
        Self { policy }
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    pub fn alloc(&self, size: usize) -> Result<IoBuffer> {
        let buf = match self.policy {
            BufferPolicy::PageAligned => IoBuffer::page_aligned(size),
            BufferPolicy::Locked => IoBuffer::locked(size),
        };
        buf.map_err(MediaError::from)
    }

    /// Releases `buf`, checking that the caller still agrees on its size.
    ///
    /// The memory is released either way; a mismatch is reported as a contract violation.
    pub fn free(&self, buf: IoBuffer, size: usize) -> Result<()> {
        let allocated = buf.len();
        drop(buf);
        if allocated != size {
            return Err(MediaError::BufferSizeMismatch {
                allocated,
                freed: size,
            });
        }
        Ok(())
    }
}
