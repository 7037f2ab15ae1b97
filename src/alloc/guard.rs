//! Installing and tearing down the inaccessible pages around an allocation.

use crate::{
    alloc::{config::FreePolicy, placement::{Placement, Span}},
    os::mem::{Access, MmapRegion, OsError},
};

/// Revoke all access to `span` of `region`.
///
/// # Safety
///
/// Nothing may still be using the bytes in `span`.
pub unsafe fn protect(region: &MmapRegion, span: Span) -> Result<(), OsError> {
    region.protect(span.range(), Access::None)
}

/// Make `span` of `region` readable and writable again.
///
/// # Safety
///
/// `span` must lie inside `region`.
pub unsafe fn unprotect(region: &MmapRegion, span: Span) -> Result<(), OsError> {
    region.protect(span.range(), Access::ReadWrite)
}

/// Put up the guards described by `placement` on a freshly mapped region.
///
/// # Safety
///
/// `region` must be the mapping `placement` was computed for, and nobody else
/// may have seen it yet.
pub unsafe fn install(region: &MmapRegion, placement: &Placement) -> Result<(), OsError> {
    debug_assert_eq!(region.size(), placement.region_size);
    protect(region, placement.before_guard)?;
    protect(region, placement.after_guard)
}

/// Tear a region down according to `policy`. Under
/// [`FreePolicy::RetainProtected`] the whole region stays mapped and
/// faults on every access from now on.
///
/// # Safety
///
/// The region must no longer be reachable through any live allocation.
pub unsafe fn retire(region: MmapRegion, policy: FreePolicy) -> Result<(), OsError> {
    match policy {
        FreePolicy::Unmap => region.unmap(),
        FreePolicy::RetainProtected => protect(
            &region,
            Span {
                offset: 0,
                len: region.size(),
            },
        ),
    }
}
