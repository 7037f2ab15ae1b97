//! Drive the allocator through a few canned scenarios. Some of them are
//! supposed to crash; that is the allocator doing its job.
//!
//! ```plaintext
//! guardheap [demo|stats|overflow|underflow|use-after-free|dump]
//! ```

use std::{env, mem, process, slice};

use guardheap::{alloc::diag::Accounting, AllocationRecord, GUARDHEAP};
use log::{info, warn};
use serde::Serialize;

#[derive(Serialize)]
struct Report {
    accounting: Accounting,
    records: Vec<AllocationRecord>,
}

fn alloc_ints(count: usize) -> &'static mut [i32] {
    let data = GUARDHEAP.allocate(count * mem::size_of::<i32>(), mem::align_of::<i32>()) as *mut i32;
    assert!(!data.is_null());
    // SAFETY: freshly allocated, large enough and aligned for `count` ints
    unsafe { slice::from_raw_parts_mut(data, count) }
}

fn demo() {
    let mut tab: Vec<&'static mut [i32]> = (0..10).map(|_| alloc_ints(10)).collect();
    for ints in tab.iter_mut() {
        ints.fill(3);
    }
    info!("{} blocks live: {:?}", tab.len(), GUARDHEAP.accounting());
    for ints in tab {
        // SAFETY: every block came from `alloc_ints()` and is dropped here
        unsafe { GUARDHEAP.free(ints.as_mut_ptr() as *mut u8) };
    }
    info!("all blocks freed: {:?}", GUARDHEAP.accounting());
}

fn stats() {
    let blocks = [1usize, 40, 4096, 10_000].map(|size| GUARDHEAP.allocate(size, 1));
    let report = Report {
        accounting: GUARDHEAP.accounting(),
        records: GUARDHEAP.registry().snapshot(),
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("could not serialize report: {e}"),
    }
    for data in blocks {
        // SAFETY: allocated above, not used again
        unsafe { GUARDHEAP.free(data) };
    }
}

fn overflow() {
    let ints = alloc_ints(10);
    info!("writing ints[10] of a 10 int block at {:p}", ints.as_ptr());
    // SAFETY: it isn't, on purpose
    unsafe { ints.as_mut_ptr().add(10).write_volatile(3) };
    warn!("overflow went unnoticed; is the tail guard configured?");
}

fn underflow() {
    let ints = alloc_ints(10);
    info!("writing ints[-1] of a 10 int block at {:p}", ints.as_ptr());
    // SAFETY: it isn't, on purpose
    unsafe { ints.as_mut_ptr().sub(1).write_volatile(3) };
    warn!("underflow went unnoticed; is the front guard configured?");
}

fn use_after_free() {
    let ints = alloc_ints(10);
    let data = ints.as_mut_ptr();
    // SAFETY: not used again... except on purpose, below
    unsafe { GUARDHEAP.free(data as *mut u8) };
    info!("reading a freed block at {data:p}");
    // SAFETY: it isn't, on purpose
    let value = unsafe { data.read_volatile() };
    warn!("read {value} from a freed block");
}

fn dump() {
    let blocks = [16usize, 100].map(|size| GUARDHEAP.allocate(size, 16));
    GUARDHEAP.dump();
    for data in blocks {
        // SAFETY: allocated above, not used again
        unsafe { GUARDHEAP.free(data) };
    }
}

fn main() {
    env_logger::init();
    let scenario = env::args().nth(1).unwrap_or_else(|| "demo".to_owned());
    info!("running {scenario} with {:?}", GUARDHEAP.config());
    match scenario.as_str() {
        "demo" => demo(),
        "stats" => stats(),
        "overflow" => overflow(),
        "underflow" => underflow(),
        "use-after-free" => use_after_free(),
        "dump" => dump(),
        other => {
            eprintln!("unknown scenario {other:?}");
            eprintln!("usage: guardheap [demo|stats|overflow|underflow|use-after-free|dump]");
            process::exit(2);
        }
    }
}
