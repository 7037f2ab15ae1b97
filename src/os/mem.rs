use std::{
    error::Error,
    fmt,
    ops::Range,
    ptr::{self, NonNull},
};

use libc::{
    __errno_location, mmap, mprotect, munmap, EACCES, EAGAIN, EBADF, EINVAL, ENFILE, ENOMEM,
    MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
};
use once_cell::sync::Lazy;

use crate::util::{hint::cold, num::round_up};

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// The size of a virtual memory page on this machine
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// A failed memory-management syscall, and the `errno` it left behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OsError {
    pub call: &'static str,
    pub errno: i32,
}

impl OsError {
    fn last(call: &'static str) -> Self {
        // SAFETY: errno is thread local and always readable
        let errno = unsafe { *__errno_location() };
        Self { call, errno }
    }

    pub fn errno_name(&self) -> &'static str {
        match self.errno {
            ENOMEM => "ENOMEM", // It's basically just this one
            EACCES => "EACCES",
            EAGAIN => "EAGAIN",
            EBADF => "EBADF",
            EINVAL => "EINVAL",
            ENFILE => "ENFILE",
            _ => "unknown",
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}() failed with {} ({})", self.call, self.errno_name(), self.errno)
    }
}

impl Error for OsError {}

/// What a protected range may be used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Any load or store faults
    None,
    ReadWrite,
}

impl Access {
    fn prot(self) -> libc::c_int {
        match self {
            Access::None => PROT_NONE,
            Access::ReadWrite => PROT_READ | PROT_WRITE,
        }
    }
}

/// A private, anonymous, page-aligned mapping.
///
/// This deliberately has no `Drop`: a region outlives the call that mapped
/// it and is owned by whoever records it, so it is released explicitly with
/// [`MmapRegion::unmap()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

impl MmapRegion {
    /// `mmap()` a read/write region of exactly `size` bytes. `size` must be a
    /// non-zero multiple of the page size.
    pub fn map(size: usize) -> Result<MmapRegion, OsError> {
        Self::map_with(size, MAP_ANONYMOUS | MAP_PRIVATE)
    }

    /// `mmap()` a read/write region of at least `size` bytes, without
    /// reserving swap for it. Pages are only backed once they are touched, and
    /// they always read as zero until then.
    pub fn map_noreserve(size: usize) -> Result<MmapRegion, OsError> {
        Self::map_with(round_up(size, page_size()), MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE)
    }

    fn map_with(size: usize, flags: libc::c_int) -> Result<MmapRegion, OsError> {
        debug_assert!(size > 0, "attempted to mmap() 0 bytes");
        debug_assert_eq!(size % page_size(), 0);
        // SAFETY: a fresh anonymous mapping cannot alias anything we own
        let ptr = unsafe { mmap(ptr::null_mut(), size, PROT_READ | PROT_WRITE, flags, -1, 0) };
        if ptr == MAP_FAILED {
            return cold(|| Err(OsError::last("mmap")));
        }
        Ok(MmapRegion {
            ptr: NonNull::new(ptr as *mut u8).ok_or(OsError { call: "mmap", errno: ENOMEM })?,
            size,
        })
    }

    /// Rebuild a region from the parts returned by [`Self::as_ptr()`] and
    /// [`Self::size()`].
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe a region previously returned by
    /// [`Self::map()`] that has not been unmapped.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Change the access rights of `range` (byte offsets into this region).
    /// Both ends must be page aligned.
    ///
    /// # Safety
    ///
    /// Revoking access to bytes that somebody still holds a reference to will
    /// make their next access fault. That is the whole point, but it is the
    /// caller's job to only do it on purpose.
    pub unsafe fn protect(&self, range: Range<usize>, access: Access) -> Result<(), OsError> {
        debug_assert!(range.start <= range.end && range.end <= self.size);
        debug_assert_eq!(range.start % page_size(), 0);
        debug_assert_eq!(range.end % page_size(), 0);
        if range.is_empty() {
            return Ok(());
        }
        let start = self.as_ptr().add(range.start);
        if mprotect(start as _, range.end - range.start, access.prot()) != 0 {
            return cold(|| Err(OsError::last("mprotect")));
        }
        Ok(())
    }

    /// Give the region back to the OS.
    ///
    /// # Safety
    ///
    /// - The address must be a multiple of the page size. This is guaranteed
    ///   because we can only construct this region as page-aligned
    /// - Nothing may touch the region afterwards. This is where the
    ///   `Copy`-ability of [`MmapRegion`] bites.
    pub unsafe fn unmap(self) -> Result<(), OsError> {
        if munmap(self.as_ptr() as _, self.size) != 0 {
            return cold(|| Err(OsError::last("munmap")));
        }
        Ok(())
    }
}

// SAFETY: an `MmapRegion` is an address range, the memory behind it is not
// tied to any thread
unsafe impl Send for MmapRegion {}
