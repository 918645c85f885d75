//! Zeroed, page-aligned memory for ring headers and data areas.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::ring::RingHeader;

/// A run of whole pages, zeroed on allocation and aligned to the page size,
/// so the `n`-th page starts at `addr() + n * page_size`.
pub(crate) struct Pages {
    /// Start of the run; dangling when `layout` is empty.
    ptr: NonNull<u8>,
    /// Size and alignment the run was allocated with.
    layout: Layout,
}

// SAFETY: `Pages` owns its allocation exclusively; shared access only hands
// out `&[u8]` or atomics, mutation requires `&mut self`.
unsafe impl Send for Pages {}
// SAFETY: see above.
unsafe impl Sync for Pages {}

impl Pages {
    /// Allocates `count` zeroed pages of `page_size` bytes.
    pub(crate) fn zeroed(count: usize, page_size: usize) -> Result<Self> {
        if !page_size.is_power_of_two() || page_size < size_of::<RingHeader>() {
            return Err(Error::InvalidArgument("page size"));
        }
        let layout = count
            .checked_mul(page_size)
            .and_then(|len| Layout::from_size_align(len, page_size).ok())
            .ok_or(Error::ResourceExhausted("ring capacity too large"))?;
        if layout.size() == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                layout,
            });
        }
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::ResourceExhausted("ring memory"))?;
        Ok(Self { ptr, layout })
    }

    /// Length in bytes.
    pub(crate) const fn len(&self) -> usize {
        self.layout.size()
    }

    /// Address of the first page.
    pub(crate) fn addr(&self) -> usize {
        self.ptr.as_ptr().addr()
    }

    /// The whole run as bytes.
    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialized bytes (or dangling and
        // aligned with `len == 0`), and only `&mut self` yields a mutable view.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    /// The whole run as mutable bytes.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_slice`, and `&mut self` makes the view unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }

    /// Views the first page as a ring header.
    ///
    /// Only used on runs that are never viewed as bytes, so the atomics are
    /// the sole access path to that memory.
    pub(crate) fn header(&self) -> &RingHeader {
        debug_assert!(self.len() >= size_of::<RingHeader>());
        // SAFETY: the run is at least one page, which `zeroed` checked is at
        // least a header long; pages are aligned far beyond the header's
        // alignment; an all-zero header is a valid value of its atomics; the
        // reference borrows `self`, so it cannot outlive the allocation.
        unsafe { &*self.ptr.as_ptr().cast::<RingHeader>() }
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // SAFETY: allocated in `zeroed` with this exact layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

impl fmt::Debug for Pages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pages")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}
