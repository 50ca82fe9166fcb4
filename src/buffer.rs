// Copyright 2020 Joyent, Inc.

//! I/O buffers: block-aligned transfer buffers, and the single growing
//! buffer used by the legacy read and write handlers.

use std::alloc::{self, Layout};
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

/// Start alignment of every [`AlignedBuf`]: a page, which satisfies
/// `O_DIRECT` on the usual block devices.
pub const IO_ALIGN: usize = 4096;

fn enomem() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOMEM)
}

/// A zero-filled heap buffer starting on an [`IO_ALIGN`] boundary.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// The buffer is uniquely owned like a `Vec<u8>`.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` bytes. Allocation failure is `ENOMEM`, never an abort.
    pub fn try_new(len: usize) -> io::Result<AlignedBuf> {
        if len == 0 {
            return Ok(AlignedBuf::default());
        }
        let layout = Layout::from_size_align(len, IO_ALIGN).map_err(|_| enomem())?;
        // Safety: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|ptr| AlignedBuf { ptr, len })
            .ok_or_else(enomem)
    }

    fn layout(&self) -> Option<Layout> {
        if self.len == 0 {
            None
        } else {
            Layout::from_size_align(self.len, IO_ALIGN).ok()
        }
    }
}

impl Default for AlignedBuf {
    fn default() -> AlignedBuf {
        AlignedBuf {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: `ptr` is valid for `len` initialized bytes, or dangling
        // with `len == 0`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: as for `deref`, and `&mut self` makes the access unique.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if let Some(layout) = self.layout() {
            // Safety: allocated in `try_new` with this very layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}

/// A byte buffer that only ever grows, one request size at a time.
///
/// Growing the buffer does not touch any socket. Callers that want the
/// socket buffers to follow the I/O buffer adjust them when
/// [`GrowableBuffer::ensure_capacity`] reports a new capacity.
#[derive(Debug, Default)]
pub struct GrowableBuffer {
    buf: AlignedBuf,
}

impl GrowableBuffer {
    pub fn new() -> GrowableBuffer {
        GrowableBuffer::default()
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Make room for at least `n` bytes. Returns the new capacity if the
    /// buffer had to be reallocated, `None` if it was already large enough.
    /// The old contents are not preserved across a reallocation.
    pub fn ensure_capacity(&mut self, n: usize) -> io::Result<Option<usize>> {
        if n <= self.buf.len() {
            return Ok(None);
        }
        self.buf = AlignedBuf::try_new(n)?;
        Ok(Some(n))
    }

    pub fn get(&self, n: usize) -> &[u8] {
        &self.buf[..n]
    }

    pub fn get_mut(&mut self, n: usize) -> &mut [u8] {
        &mut self.buf[..n]
    }
}
