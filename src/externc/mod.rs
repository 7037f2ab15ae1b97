//! The C face of the allocator. The `guard_*` symbols are always exported;
//! with the `interpose` feature the libc names are too, so that linking (or
//! `LD_PRELOAD`ing) the cdylib replaces the process allocator wholesale.

use libc::{c_int, c_void, size_t};

use crate::{
    alloc::{config::Config, guarded::GuardedAlloc},
    trace_call,
    util::print::Hex,
};

/// The process-wide allocator behind every exported entry point
pub static GUARDHEAP: GuardedAlloc = GuardedAlloc::new(Config::BUILD);

#[no_mangle]
pub extern "C" fn guard_malloc(size: size_t) -> *mut c_void {
    let data = GUARDHEAP.allocate(size, GUARDHEAP.config().default_align);
    trace_call!("malloc(", size, ") = ", Hex(data as usize));
    data as _
}

#[no_mangle]
pub extern "C" fn guard_calloc(count: size_t, elem_size: size_t) -> *mut c_void {
    let data = GUARDHEAP.zero_allocate(count, elem_size);
    trace_call!("calloc(", count, ", ", elem_size, ") = ", Hex(data as usize));
    data as _
}

#[no_mangle]
pub unsafe extern "C" fn guard_free(ptr: *mut c_void) {
    trace_call!("free(", Hex(ptr as usize), ")");
    GUARDHEAP.free(ptr as _)
}

#[no_mangle]
pub unsafe extern "C" fn guard_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let data = GUARDHEAP.resize(ptr as _, size);
    trace_call!("realloc(", Hex(ptr as usize), ", ", size, ") = ", Hex(data as usize));
    data as _
}

#[no_mangle]
pub extern "C" fn guard_valloc(size: size_t) -> *mut c_void {
    let data = GUARDHEAP.page_allocate(size);
    trace_call!("valloc(", size, ") = ", Hex(data as usize));
    data as _
}

#[no_mangle]
pub unsafe extern "C" fn guard_posix_memalign(
    memptr: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    let rc = GUARDHEAP.aligned_allocate_into(memptr, align, size);
    trace_call!("posix_memalign(", align, ", ", size, ") = ", rc);
    rc
}

#[no_mangle]
pub extern "C" fn guard_memalign(align: size_t, size: size_t) -> *mut c_void {
    let data = GUARDHEAP.aligned_allocate(align, size);
    trace_call!("memalign(", align, ", ", size, ") = ", Hex(data as usize));
    data as _
}

#[no_mangle]
pub extern "C" fn guard_malloc_usable_size(ptr: *mut c_void) -> size_t {
    let size = GUARDHEAP.usable_size(ptr as _);
    trace_call!("malloc_usable_size(", Hex(ptr as usize), ") = ", size);
    size
}

/// Print every live allocation and the running totals to stdout
#[no_mangle]
pub extern "C" fn guard_dump() {
    GUARDHEAP.dump()
}

#[cfg(feature = "interpose")]
mod interpose {
    use libc::{c_int, c_void, size_t};

    #[no_mangle]
    pub extern "C" fn malloc(size: size_t) -> *mut c_void {
        super::guard_malloc(size)
    }

    #[no_mangle]
    pub extern "C" fn calloc(count: size_t, elem_size: size_t) -> *mut c_void {
        super::guard_calloc(count, elem_size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        super::guard_free(ptr)
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
        super::guard_realloc(ptr, size)
    }

    #[no_mangle]
    pub extern "C" fn valloc(size: size_t) -> *mut c_void {
        super::guard_valloc(size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn posix_memalign(
        memptr: *mut *mut c_void,
        align: size_t,
        size: size_t,
    ) -> c_int {
        super::guard_posix_memalign(memptr, align, size)
    }

    #[no_mangle]
    pub extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
        super::guard_memalign(align, size)
    }

    #[no_mangle]
    pub extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
        super::guard_memalign(align, size)
    }

    #[no_mangle]
    pub extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
        super::guard_malloc_usable_size(ptr)
    }
}
