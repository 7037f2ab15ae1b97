//! Where does the user's pointer go inside its region, and which pages around
//! it get revoked? All of it is plain arithmetic, so none of it needs a real
//! mapping to test.
//!
//! A region always looks like this (guard-after-only shown):
//!
//! ```plaintext
//! +-------------------+  region base (page aligned)
//! | slack             |  alignment padding + page rounding
//! +-------------------+  user_offset
//! | user range        |  user_size bytes, aligned to `align`
//! +-------------------+  page boundary (for align == 1)
//! | guard page(s)     |  PROT_NONE
//! +-------------------+  region base + region_size
//! ```
//!
//! With a guard before, the user range is pushed up against the front guard
//! instead, and the slack ends up behind it.

use std::{error::Error, fmt, ops::Range};

use crate::{
    alloc::config::{Config, GuardPlacement},
    util::num::{checked_round_up, round_down, round_up},
};

/// Alignment that needs no padding at all
pub const DEFAULT_ALIGN: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanError {
    /// Nothing to allocate, callers hand out null
    ZeroSize,
    ZeroAlignment,
    /// The region size overflows (or is too big for any mapping to exist)
    TooLarge,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::ZeroSize => write!(f, "zero-sized allocation"),
            PlanError::ZeroAlignment => write!(f, "alignment must be non-zero"),
            PlanError::TooLarge => write!(f, "allocation size overflows the address space"),
        }
    }
}

impl Error for PlanError {}

/// A page-aligned span of byte offsets into a region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub const EMPTY: Span = Span { offset: 0, len: 0 };

    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

/// The size half of the layout, which is all we need to know before asking
/// the OS for a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plan {
    user_size: usize,
    align: usize,
    page: usize,
    placement: GuardPlacement,
    guard_before: usize,
    data_size: usize,
    region_size: usize,
}

/// The address half of the layout, once the region base is known. All fields
/// are byte offsets from the region base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub region_size: usize,
    pub user_offset: usize,
    pub user_size: usize,
    pub before_guard: Span,
    pub after_guard: Span,
}

impl Placement {
    /// Every page that stays readable and writable
    pub const fn accessible(&self) -> Span {
        let offset = self.before_guard.end();
        let end = if self.after_guard.is_empty() {
            self.region_size
        } else {
            self.after_guard.offset
        };
        Span {
            offset,
            len: end - offset,
        }
    }
}

impl Plan {
    pub fn new(
        user_size: usize,
        align: usize,
        config: &Config,
        page: usize,
    ) -> Result<Plan, PlanError> {
        if user_size == 0 {
            return Err(PlanError::ZeroSize);
        }
        if align == 0 {
            return Err(PlanError::ZeroAlignment);
        }
        let guard = config
            .guard_pages
            .checked_mul(page)
            .ok_or(PlanError::TooLarge)?;
        let guard_before = if config.placement.guards_before() { guard } else { 0 };
        let guard_after = if config.placement.guards_after() { guard } else { 0 };

        // The mapping is only page aligned, so an arbitrary alignment can cost
        // up to `align` extra bytes to satisfy.
        let padding = if align != DEFAULT_ALIGN { align } else { 0 };
        let raw = user_size.checked_add(padding).ok_or(PlanError::TooLarge)?;
        let data_size = checked_round_up(raw, page).ok_or(PlanError::TooLarge)?;
        let region_size = guard_before
            .checked_add(data_size)
            .and_then(|n| n.checked_add(guard_after))
            .filter(|&n| n <= isize::MAX as usize)
            .ok_or(PlanError::TooLarge)?;

        Ok(Plan {
            user_size,
            align,
            page,
            placement: config.placement,
            guard_before,
            data_size,
            region_size,
        })
    }

    pub const fn region_size(&self) -> usize {
        self.region_size
    }

    pub const fn user_size(&self) -> usize {
        self.user_size
    }

    pub const fn align(&self) -> usize {
        self.align
    }

    /// Lay the plan out over a region mapped at `base`.
    pub fn place(&self, base: usize) -> Placement {
        debug_assert_eq!(base % self.page, 0);
        let data_start = base + self.guard_before;
        let user = if self.placement == GuardPlacement::After {
            // Slide the user range up against the tail guard. Aligning down
            // keeps the gap to the guard below `align`.
            round_down(data_start + self.data_size - self.user_size, self.align)
        } else {
            round_up(data_start, self.align)
        };
        let user_offset = user - base;
        debug_assert!(user_offset >= self.guard_before);
        debug_assert!(user_offset + self.user_size <= self.guard_before + self.data_size);

        let before_guard = if self.placement.guards_before() {
            Span {
                offset: 0,
                len: round_down(user_offset, self.page),
            }
        } else {
            Span::EMPTY
        };
        let after_guard = if self.placement.guards_after() {
            let offset = round_up(user_offset + self.user_size, self.page);
            Span {
                offset,
                len: self.region_size - offset,
            }
        } else {
            Span::EMPTY
        };

        Placement {
            region_size: self.region_size,
            user_offset,
            user_size: self.user_size,
            before_guard,
            after_guard,
        }
    }
}
