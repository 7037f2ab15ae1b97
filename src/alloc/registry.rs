//! The table of live allocations.
//!
//! The table itself lives in its own `mmap()`ed region rather than on the
//! heap, since the heap might be us. Slots are found by linear scan, bounded
//! by a high-water mark of slots that have ever been used.

use std::{
    error::Error,
    fmt, mem,
    ptr::{self, NonNull},
    slice,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError, TryLockError,
    },
};

use bytemuck::Zeroable;
use serde::Serialize;

use crate::{
    alloc::diag::Accounting,
    os::mem::{MmapRegion, OsError},
    serialize::serde_usize,
};

/// Everything we know about one live allocation. Records are never mutated
/// once they are in the table, only erased.
///
/// An all-zero record (null `user`) marks a vacant slot, which is what makes
/// a freshly mapped table valid without initializing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Zeroable, Serialize)]
#[repr(C)]
pub struct AllocationRecord {
    /// The pointer we handed out
    #[serde(with = "serde_usize")]
    pub user: *mut u8,
    /// How many bytes were asked for
    pub user_size: usize,
    pub align: usize,
    /// Base of the mapping backing `user`
    #[serde(with = "serde_usize")]
    pub region: *mut u8,
    /// Page-aligned size of that mapping, guards included
    pub region_size: usize,
}

// SAFETY: a record only describes memory, it does not grant access to it
unsafe impl Send for AllocationRecord {}

impl AllocationRecord {
    pub fn is_vacant(&self) -> bool {
        self.user.is_null()
    }

    /// The mapping this record owns
    pub fn region(&self) -> MmapRegion {
        debug_assert!(!self.region.is_null());
        // SAFETY: only constructed by the allocator from a real mapping, and
        // the record is erased before that mapping goes away
        unsafe { MmapRegion::from_raw_parts(NonNull::new_unchecked(self.region), self.region_size) }
    }

    pub fn user_end(&self) -> *mut u8 {
        self.user.wrapping_add(self.user_size)
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Every slot is taken
    Full { capacity: usize },
    /// The table itself could not be mapped
    Unavailable(OsError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Full { capacity } => {
                write!(f, "allocation registry is full ({capacity} records)")
            }
            RegistryError::Unavailable(e) => write!(f, "allocation registry unavailable: {e}"),
        }
    }
}

impl Error for RegistryError {}

struct Table {
    slots: MmapRegion,
    /// Slots at or past this index have never been used
    high_water: usize,
    live: usize,
}

impl Table {
    fn map(capacity: usize) -> Result<Self, OsError> {
        let bytes = capacity
            .checked_mul(mem::size_of::<AllocationRecord>())
            .ok_or(OsError { call: "mmap", errno: libc::ENOMEM })?;
        Ok(Self {
            slots: MmapRegion::map_noreserve(bytes)?,
            high_water: 0,
            live: 0,
        })
    }

    /// The part of the table that has ever held a record
    fn used(&mut self) -> &mut [AllocationRecord] {
        // SAFETY:
        // - the mapping holds at least `capacity` records, and `high_water`
        //   never exceeds `capacity`
        // - fresh pages read as zero, and an all-zero `AllocationRecord` is
        //   valid (`Zeroable`)
        // - we have `&mut self`, so nobody else is looking
        unsafe { slice::from_raw_parts_mut(self.slots.as_ptr() as *mut AllocationRecord, self.high_water) }
    }

    fn position(&mut self, user: *const u8) -> Option<usize> {
        self.used().iter().position(|r| ptr::eq(r.user, user))
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // SAFETY: the table is the only user of its mapping
        let unmapped = unsafe { self.slots.unmap() };
        debug_assert!(unmapped.is_ok(), "registry table: {unmapped:?}");
    }
}

/// A fixed-capacity table of [`AllocationRecord`]s behind a single mutex.
///
/// The mutex only ever covers table bookkeeping, never a syscall on a user
/// region. Running totals are kept in atomics as well, so the abort path can
/// read them even while the table is locked.
pub struct Registry {
    capacity: usize,
    table: Mutex<Option<Table>>,
    live: AtomicUsize,
    user_bytes: AtomicUsize,
    region_bytes: AtomicUsize,
}

impl Registry {
    /// A registry with room for `capacity` records. The table is not mapped
    /// until the first time it is needed.
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            table: Mutex::new(None),
            live: AtomicUsize::new(0),
            user_bytes: AtomicUsize::new(0),
            region_bytes: AtomicUsize::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Option<Table>> {
        // Nothing panics while holding the lock, so a poisoned table is still
        // consistent
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the table, mapping it first if this is the first use.
    fn with_table<R>(&self, f: impl FnOnce(&mut Table) -> R) -> Result<R, RegistryError> {
        let mut guard = self.lock();
        let table = match &mut *guard {
            Some(table) => table,
            empty => empty.insert(Table::map(self.capacity).map_err(RegistryError::Unavailable)?),
        };
        Ok(f(table))
    }

    /// Lock the table only if it already exists; a registry that never
    /// stored anything has nothing to look up.
    fn with_existing<R>(&self, f: impl FnOnce(&mut Table) -> R) -> Option<R> {
        self.lock().as_mut().map(f)
    }

    /// Store `record` in the first vacant slot.
    pub fn insert(&self, record: AllocationRecord) -> Result<(), RegistryError> {
        debug_assert!(!record.is_vacant());
        let capacity = self.capacity;
        self.with_table(|table| {
            let hole = if table.live < table.high_water {
                table.used().iter().position(AllocationRecord::is_vacant)
            } else {
                None
            };
            let index = match hole {
                Some(index) => index,
                None if table.high_water < capacity => {
                    table.high_water += 1;
                    table.high_water - 1
                }
                None => return Err(RegistryError::Full { capacity }),
            };
            table.used()[index] = record;
            table.live += 1;
            Ok(())
        })??;
        self.live.fetch_add(1, Ordering::Relaxed);
        self.user_bytes.fetch_add(record.user_size, Ordering::Relaxed);
        self.region_bytes.fetch_add(record.region_size, Ordering::Relaxed);
        Ok(())
    }

    /// Find the record for a pointer we handed out, if we did.
    pub fn lookup(&self, user: *const u8) -> Option<AllocationRecord> {
        if user.is_null() {
            return None;
        }
        self.with_existing(|table| {
            let index = table.position(user)?;
            Some(table.used()[index])
        })
        .flatten()
    }

    /// Vacate the slot holding `user`. Returns `false` if there was none.
    pub fn erase(&self, user: *const u8) -> bool {
        self.remove(user).is_some()
    }

    /// [`Self::lookup()`] and [`Self::erase()`] under one lock, so two
    /// threads freeing the same pointer cannot both win.
    pub fn remove(&self, user: *const u8) -> Option<AllocationRecord> {
        if user.is_null() {
            return None;
        }
        let record = self
            .with_existing(|table| {
                let index = table.position(user)?;
                let slot = &mut table.used()[index];
                let record = mem::replace(slot, AllocationRecord::zeroed());
                table.live -= 1;
                Some(record)
            })
            .flatten()?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.user_bytes.fetch_sub(record.user_size, Ordering::Relaxed);
        self.region_bytes.fetch_sub(record.region_size, Ordering::Relaxed);
        Some(record)
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.with_existing(|table| table.live).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Running totals. Never blocks.
    pub fn accounting(&self) -> Accounting {
        Accounting {
            live: self.live.load(Ordering::Relaxed),
            user_bytes: self.user_bytes.load(Ordering::Relaxed),
            region_bytes: self.region_bytes.load(Ordering::Relaxed),
        }
    }

    /// Visit every live record with the table locked. `f` must not call back
    /// into this registry (or allocate, if this registry backs the global
    /// allocator).
    pub fn for_each(&self, mut f: impl FnMut(&AllocationRecord)) {
        self.with_existing(|table| {
            table.used().iter().filter(|r| !r.is_vacant()).for_each(&mut f)
        });
    }

    /// [`Self::for_each()`], but gives up instead of blocking if the table is
    /// locked. Returns `false` if it gave up.
    pub fn try_for_each(&self, mut f: impl FnMut(&AllocationRecord)) -> bool {
        let mut guard = match self.table.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if let Some(table) = guard.as_mut() {
            table.used().iter().filter(|r| !r.is_vacant()).for_each(&mut f);
        }
        true
    }

    /// Copy out every live record. This allocates, so it must not be called
    /// while this registry is the one backing the global allocator and a
    /// lock on it is held.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        loop {
            // Allocate outside the lock, then retry if we raced with inserts
            let mut out = Vec::with_capacity(self.len() + 16);
            let fits = self.with_existing(|table| {
                if table.live > out.capacity() {
                    return false;
                }
                out.extend(table.used().iter().filter(|r| !r.is_vacant()));
                true
            });
            if fits.unwrap_or(true) {
                return out;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use hashbrown::HashSet;

    use super::*;

    fn record(user: usize, user_size: usize) -> AllocationRecord {
        AllocationRecord {
            user: user as *mut u8,
            user_size,
            align: 1,
            region: (user & !0xfff) as *mut u8,
            region_size: 0x2000,
        }
    }

    #[test]
    fn lookup_finds_what_was_inserted() {
        let registry = Registry::new(8);
        assert_eq!(registry.lookup(0x1000 as *const u8), None);
        registry.insert(record(0x1010, 16)).unwrap();
        registry.insert(record(0x5000, 32)).unwrap();
        assert_eq!(registry.lookup(0x5000 as *const u8), Some(record(0x5000, 32)));
        assert_eq!(registry.lookup(0x1010 as *const u8), Some(record(0x1010, 16)));
        // interior pointers are not allocations
        assert_eq!(registry.lookup(0x1011 as *const u8), None);
        assert_eq!(registry.lookup(ptr::null()), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn erase_frees_the_slot_for_reuse() {
        let registry = Registry::new(2);
        registry.insert(record(0x1000, 1)).unwrap();
        registry.insert(record(0x3000, 1)).unwrap();
        assert_eq!(
            registry.insert(record(0x5000, 1)),
            Err(RegistryError::Full { capacity: 2 })
        );
        assert!(registry.erase(0x1000 as *const u8));
        assert!(!registry.erase(0x1000 as *const u8));
        registry.insert(record(0x5000, 1)).unwrap();
        assert_eq!(registry.lookup(0x5000 as *const u8), Some(record(0x5000, 1)));
        assert_eq!(registry.lookup(0x1000 as *const u8), None);
    }

    #[test]
    fn accounting_tracks_live_records() {
        let registry = Registry::new(4);
        registry.insert(record(0x1000, 40)).unwrap();
        registry.insert(record(0x3000, 2)).unwrap();
        assert_eq!(
            registry.accounting(),
            Accounting {
                live: 2,
                user_bytes: 42,
                region_bytes: 0x4000
            }
        );
        assert_eq!(registry.remove(0x1000 as *const u8), Some(record(0x1000, 40)));
        assert_eq!(registry.accounting().user_bytes, 2);
        assert_eq!(registry.accounting().live, 1);
    }

    #[test]
    fn dropping_a_registry_unmaps_its_table() {
        let registry = Registry::new(64 * 1024);
        registry.insert(record(0x1000, 1)).unwrap();
        drop(registry);
        // an untouched registry never mapped a table at all
        drop(Registry::new(4));
    }

    #[test]
    fn snapshot_skips_holes() {
        let registry = Registry::new(16);
        assert!(registry.snapshot().is_empty());
        for i in 1..=5 {
            registry.insert(record(i * 0x10000, i)).unwrap();
        }
        registry.erase(0x20000 as *const u8);
        registry.erase(0x40000 as *const u8);
        let users: Vec<usize> = registry.snapshot().iter().map(|r| r.user as usize).collect();
        assert_eq!(users, vec![0x10000, 0x30000, 0x50000]);

        let mut seen = 0;
        assert!(registry.try_for_each(|_| seen += 1));
        assert_eq!(seen, 3);
    }

    #[test]
    fn concurrent_inserts_never_share_a_slot() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        let registry = Registry::new(THREADS * PER_THREAD);
        let barrier = Barrier::new(THREADS);
        crossbeam::scope(|s| {
            for t in 0..THREADS {
                let registry = &registry;
                let barrier = &barrier;
                s.spawn(move |_| {
                    let base = (t + 1) << 32;
                    for round in 0..3 {
                        for i in 0..PER_THREAD {
                            registry.insert(record(base + i * 0x10, round + i)).unwrap();
                        }
                        barrier.wait();
                        for i in 0..PER_THREAD {
                            let user = (base + i * 0x10) as *const u8;
                            assert_eq!(registry.remove(user).map(|r| r.user_size), Some(round + i));
                        }
                    }
                });
            }
        })
        .unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.accounting(), Accounting::default());

        let registry = Registry::new(THREADS * PER_THREAD);
        crossbeam::scope(|s| {
            for t in 0..THREADS {
                let registry = &registry;
                s.spawn(move |_| {
                    for i in 0..PER_THREAD {
                        registry.insert(record(((t + 1) << 32) + i * 0x10, 1)).unwrap();
                    }
                });
            }
        })
        .unwrap();
        let snapshot = registry.snapshot();
        let unique: HashSet<usize> = snapshot.iter().map(|r| r.user as usize).collect();
        assert_eq!(snapshot.len(), THREADS * PER_THREAD);
        assert_eq!(unique.len(), snapshot.len());
    }
}
