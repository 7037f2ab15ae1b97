//! The exported `guard_*` entry points, called the way C would.

mod common;

use std::{ptr, slice};

use guardheap::{
    alloc::config::GuardPlacement,
    externc::{
        guard_calloc, guard_free, guard_malloc, guard_malloc_usable_size, guard_memalign,
        guard_posix_memalign, guard_realloc, guard_valloc,
    },
    GUARDHEAP,
};
use libc::c_void;

#[test]
fn malloc_write_free() {
    let data = guard_malloc(10 * 4) as *mut i32;
    assert!(!data.is_null());
    unsafe {
        slice::from_raw_parts_mut(data, 10).fill(3);
        assert!(slice::from_raw_parts(data, 10).iter().all(|&i| i == 3));
        assert_eq!(guard_malloc_usable_size(data as _), 40);
        guard_free(data as _);
    }
    assert_eq!(guard_malloc_usable_size(data as _), 0);
}

#[test]
fn malloc_zero_is_null() {
    assert!(guard_malloc(0).is_null());
    unsafe { guard_free(ptr::null_mut()) };
}

#[test]
fn one_past_the_end_faults() {
    let data = guard_malloc(40) as *mut u8;
    if GUARDHEAP.config().placement == GuardPlacement::After && GUARDHEAP.config().default_align == 1 {
        assert_eq!((data as usize + 40) % page_size::get(), 0);
        assert!(common::faults(|| unsafe { data.add(40).write_volatile(0) }));
    }
    assert!(!common::faults(|| unsafe { data.add(39).write_volatile(0) }));
    unsafe { guard_free(data as _) };
}

#[test]
fn calloc_is_zeroed() {
    let data = guard_calloc(100, 8) as *mut u8;
    assert!(unsafe { slice::from_raw_parts(data, 800) }.iter().all(|&b| b == 0));
    unsafe { guard_free(data as _) };
    assert!(guard_calloc(usize::MAX, 2).is_null());
}

#[test]
fn realloc_moves_and_keeps_contents() {
    unsafe {
        let data = guard_realloc(ptr::null_mut(), 100) as *mut u8;
        assert_eq!(guard_malloc_usable_size(data as _), 100);
        for i in 0..100 {
            data.add(i).write(i as u8);
        }
        let bigger = guard_realloc(data as _, 10_000) as *mut u8;
        assert!((0..100).all(|i| bigger.add(i).read() == i as u8));
        let smaller = guard_realloc(bigger as _, 3) as *mut u8;
        assert_eq!(slice::from_raw_parts(smaller, 3), &[0, 1, 2]);
        assert!(guard_realloc(smaller as _, 0).is_null());
        assert_eq!(guard_malloc_usable_size(smaller as _), 0);
    }
}

#[test]
fn aligned_entry_points() {
    let page = page_size::get();
    let data = guard_valloc(10);
    assert_eq!(data as usize % page, 0);
    unsafe { guard_free(data) };

    let data = guard_memalign(4097, 40);
    assert_eq!(data as usize % 4097, 0);
    unsafe { guard_free(data) };

    let mut out: *mut c_void = ptr::null_mut();
    unsafe {
        assert_eq!(guard_posix_memalign(&mut out, 24, 8), libc::EINVAL);
        assert_eq!(guard_posix_memalign(&mut out, 256, 8), 0);
        assert_eq!(out as usize % 256, 0);
        guard_free(out);
    }
}
