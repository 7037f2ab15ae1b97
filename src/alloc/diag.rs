//! Reporting, and the one-way door out of the process.
//!
//! Everything in here prints through [`putln!()`], which never allocates:
//! by the time we get here the heap may be the thing that is broken.

use std::fmt;

use serde::Serialize;

use crate::{
    alloc::registry::{AllocationRecord, Registry, RegistryError},
    os::mem::OsError,
    put, putln,
    util::print::Hex,
};

/// Aggregate bookkeeping across every live allocation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Accounting {
    pub live: usize,
    /// Bytes callers asked for
    pub user_bytes: usize,
    /// Bytes actually mapped, guards and slack included
    pub region_bytes: usize,
}

/// Why we are about to abort
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fatal {
    Map(OsError),
    Release(OsError),
    Protect(OsError),
    Registry(RegistryError),
    /// `resize()` of a pointer this allocator never handed out
    BadResize(*const u8),
}

impl From<RegistryError> for Fatal {
    fn from(e: RegistryError) -> Self {
        Fatal::Registry(e)
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::Map(e) => write!(f, "could not map a region: {e}"),
            Fatal::Release(e) => write!(f, "could not release a region: {e}"),
            Fatal::Protect(e) => write!(f, "could not protect a region: {e}"),
            Fatal::Registry(e) => write!(f, "{e}"),
            Fatal::BadResize(ptr) => write!(f, "bad realloc of {ptr:?}"),
        }
    }
}

fn put_os_error(what: &str, e: &OsError) {
    putln!(what, e.call, "() failed with ", e.errno_name(), " (", e.errno, ")");
}

impl Fatal {
    /// [`fmt::Display`] without the allocation
    pub fn report(&self) {
        match self {
            Fatal::Map(e) => put_os_error("guardheap: could not map a region: ", e),
            Fatal::Release(e) => put_os_error("guardheap: could not release a region: ", e),
            Fatal::Protect(e) => put_os_error("guardheap: could not protect a region: ", e),
            Fatal::Registry(RegistryError::Full { capacity }) => {
                putln!("guardheap: too many allocations (", *capacity, " records)")
            }
            Fatal::Registry(RegistryError::Unavailable(e)) => {
                put_os_error("guardheap: allocation registry unavailable: ", e)
            }
            Fatal::BadResize(ptr) => putln!("guardheap: bad realloc of ", Hex(*ptr as usize)),
        }
    }
}

pub fn report_accounting(accounting: &Accounting) {
    putln!("Live allocations is ", accounting.live);
    putln!("User size is ", accounting.user_bytes);
    putln!("Total size is ", accounting.region_bytes);
}

/// Print what went wrong and how much we were holding, then `abort()`.
#[cold]
pub fn abort_with(fatal: Fatal, registry: &Registry) -> ! {
    fatal.report();
    report_accounting(&registry.accounting());
    std::process::abort()
}

pub fn report_bad_free(ptr: *const u8) {
    putln!("guardheap: bad free: ", Hex(ptr as usize));
}

pub fn dump_record(record: &AllocationRecord) {
    putln!("real address     = ", Hex(record.region as usize));
    putln!("real size        = ", record.region_size);
    putln!("real end address = ", Hex(record.region as usize + record.region_size));
    putln!("user address     = ", Hex(record.user as usize));
    putln!("user size        = ", record.user_size);
    putln!("user end address = ", Hex(record.user_end() as usize));
    putln!("align            = ", record.align);
}

/// Print every live record. If another thread holds the table (or we do,
/// further up the stack) only the totals are printed.
pub fn dump(registry: &Registry) {
    putln!("Dumping allocs ...");
    if !registry.try_for_each(dump_record) {
        put!("(registry busy, records skipped)\n");
    }
    report_accounting(&registry.accounting());
    putln!("Dumping allocs done");
}
