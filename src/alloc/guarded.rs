//! The allocator proper. Every allocation gets its own mapping, fenced by
//! `PROT_NONE` pages, so a stray access faults on the offending instruction
//! instead of quietly scribbling on a neighbour.

use std::{
    alloc::{GlobalAlloc, Layout},
    cmp,
    ffi::c_void,
    mem,
    ptr::{self, NonNull},
};

use libc::{c_int, EINVAL, ENOMEM};

use crate::{
    alloc::{
        config::{BadFreePolicy, Config, REGISTRY_CAPACITY},
        diag::{self, Accounting, Fatal},
        guard,
        placement::{Plan, PlanError, DEFAULT_ALIGN},
        registry::{AllocationRecord, Registry},
    },
    os::mem::{page_size, MmapRegion},
    util::{assert::aligned_to, hint::cold},
};

fn set_errno(errno: c_int) {
    // SAFETY: errno is thread local and always writable
    unsafe { *libc::__errno_location() = errno };
}

/// A guard-page allocator. The process-wide instance lives in
/// [`crate::externc::GUARDHEAP`], but nothing stops you from building your own
/// (tests do exactly that).
pub struct GuardedAlloc {
    config: Config,
    registry: Registry,
}

impl GuardedAlloc {
    /// # Panics
    /// - If `config` fails [`Config::validate()`]. In a `static` this is a
    ///   compile error.
    pub const fn new(config: Config) -> Self {
        Self::with_capacity(config, REGISTRY_CAPACITY)
    }

    pub const fn with_capacity(config: Config, capacity: usize) -> Self {
        assert!(config.validate().is_ok(), "invalid guardheap configuration");
        Self {
            config,
            registry: Registry::new(capacity),
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn accounting(&self) -> Accounting {
        self.registry.accounting()
    }

    /// Print every live allocation and the totals to stdout
    pub fn dump(&self) {
        diag::dump(&self.registry)
    }

    fn fatal(&self, fatal: Fatal) -> ! {
        diag::abort_with(fatal, &self.registry)
    }

    /// Allocate `size` bytes aligned to `align`, with guard pages as
    /// configured.
    ///
    /// Returns null for `size == 0`, and null with `errno = ENOMEM` if the
    /// request cannot possibly be mapped. Everything else that goes wrong
    /// aborts the process.
    pub fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        let plan = match Plan::new(size, cmp::max(align, DEFAULT_ALIGN), &self.config, page_size()) {
            Ok(plan) => plan,
            Err(PlanError::ZeroSize) => return ptr::null_mut(),
            Err(_) => {
                return cold(|| {
                    set_errno(ENOMEM);
                    ptr::null_mut()
                })
            }
        };

        // Nobody else knows about this region until it is registered, so none
        // of the syscalls below need the registry lock.
        let region = MmapRegion::map(plan.region_size()).unwrap_or_else(|e| self.fatal(Fatal::Map(e)));
        let placement = plan.place(region.addr());
        // SAFETY: fresh region, and `placement` was computed for it
        unsafe { guard::install(&region, &placement) }.unwrap_or_else(|e| self.fatal(Fatal::Protect(e)));

        if self.config.zero_fill {
            let accessible = placement.accessible();
            // SAFETY: the accessible span is mapped read/write
            unsafe { region.as_ptr().add(accessible.offset).write_bytes(0, accessible.len) };
        }

        // SAFETY: `user_offset + size <= region_size`
        let user = unsafe { region.as_ptr().add(placement.user_offset) };
        debug_assert!(aligned_to(user, plan.align()));

        let record = AllocationRecord {
            user,
            user_size: size,
            align: plan.align(),
            region: region.as_ptr(),
            region_size: region.size(),
        };
        if let Err(e) = self.registry.insert(record) {
            self.fatal(e.into());
        }
        user
    }

    /// `calloc()`: `count * elem_size` zeroed bytes
    pub fn zero_allocate(&self, count: usize, elem_size: usize) -> *mut u8 {
        let Some(size) = count.checked_mul(elem_size) else {
            set_errno(ENOMEM);
            return ptr::null_mut();
        };
        let data = self.allocate(size, self.config.default_align);
        if !data.is_null() && !self.config.zero_fill {
            // SAFETY: we just allocated `size` bytes there
            unsafe { data.write_bytes(0, size) };
        }
        data
    }

    /// `realloc()`. Always moves: the new size gets a new region with guards
    /// that fit it.
    ///
    /// `resize(null, n)` is `allocate(n)`. `resize(p, 0)` frees `p` and
    /// returns null. If the new allocation is refused, `old` is left alone and
    /// null is returned.
    ///
    /// # Safety
    ///
    /// `old` must be null or a live pointer from this allocator. Passing any
    /// other pointer aborts the process.
    pub unsafe fn resize(&self, old: *mut u8, new_size: usize) -> *mut u8 {
        if old.is_null() {
            return self.allocate(new_size, self.config.default_align);
        }
        let Some(record) = self.registry.lookup(old) else {
            self.fatal(Fatal::BadResize(old));
        };
        let new = self.allocate(new_size, self.config.default_align);
        if new.is_null() && new_size != 0 {
            return new;
        }
        let copy = cmp::min(record.user_size, new_size);
        if copy > 0 {
            // SAFETY: both ranges are live, distinct allocations of at least
            // `copy` bytes
            ptr::copy_nonoverlapping(old, new, copy);
        }
        self.free(old);
        new
    }

    /// `free()`. Null is fine. Pointers we never handed out (or already took
    /// back) are ignored or reported, per [`Config::bad_free`].
    ///
    /// # Safety
    ///
    /// Under [`crate::alloc::config::FreePolicy::Unmap`] the memory behind
    /// `data` is gone after this, so nobody may use it again.
    pub unsafe fn free(&self, data: *mut u8) {
        if data.is_null() {
            return;
        }
        match self.registry.remove(data) {
            Some(record) => guard::retire(record.region(), self.config.free_policy)
                .unwrap_or_else(|e| self.fatal(Fatal::Release(e))),
            None => cold(|| match self.config.bad_free {
                BadFreePolicy::Ignore => {}
                BadFreePolicy::Report => diag::report_bad_free(data),
            }),
        }
    }

    /// `memalign()`. Any non-zero alignment works, not just powers of two.
    pub fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        self.allocate(size, align)
    }

    /// `valloc()`: page-aligned
    pub fn page_allocate(&self, size: usize) -> *mut u8 {
        self.allocate(size, page_size())
    }

    /// `posix_memalign()`. Stores the allocation in `*out` and returns 0, or
    /// returns `EINVAL` for a bad alignment / `ENOMEM` for an impossible size
    /// without touching `*out`.
    ///
    /// # Safety
    ///
    /// `out` must be valid for a pointer-sized write.
    pub unsafe fn aligned_allocate_into(&self, out: *mut *mut c_void, align: usize, size: usize) -> c_int {
        if !align.is_power_of_two() || align % mem::size_of::<*mut c_void>() != 0 {
            return EINVAL;
        }
        let data = self.allocate(size, align);
        if data.is_null() && size != 0 {
            return ENOMEM;
        }
        out.write(data as *mut c_void);
        0
    }

    /// How many bytes the caller asked for when they got `data`, or 0 if we
    /// do not know `data`.
    pub fn usable_size(&self, data: *const u8) -> usize {
        self.registry.lookup(data).map_or(0, |r| r.user_size)
    }
}

unsafe impl GlobalAlloc for GuardedAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout.size(), layout.align())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let data = self.alloc(layout);
        if !data.is_null() && !self.config.zero_fill {
            data.write_bytes(0, layout.size());
        }
        data
    }

    unsafe fn dealloc(&self, data: *mut u8, _: Layout) {
        // SAFETY: caller guarantees `data` came from us and is not used again
        self.free(data)
    }

    unsafe fn realloc(&self, data: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new = self.allocate(new_size, layout.align());
        if let Some(new) = NonNull::new(new) {
            ptr::copy_nonoverlapping(data, new.as_ptr(), cmp::min(layout.size(), new_size));
            self.free(data);
        }
        new
    }
}
