//! A debugging replacement for `malloc()` and friends. Every allocation lives
//! in its own mapping with `PROT_NONE` guard pages beside it, so overruns (and
//! optionally use-after-free) fault on the spot instead of corrupting the
//! heap.

/// One line of output per exported entry point, with the `trace` feature.
macro_rules! trace_call {
    ($($arg:expr),* $(,)?) => {
        if cfg!(feature = "trace") {
            $crate::putln!($($arg),*)
        }
    };
}
pub(crate) use trace_call;

pub mod alloc;
pub mod externc;
pub mod os;
mod serialize;
pub mod util;

pub use alloc::{
    config::Config,
    guarded::GuardedAlloc,
    registry::{AllocationRecord, Registry},
};
pub use externc::GUARDHEAP;
