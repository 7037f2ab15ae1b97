//! Compile-time policy knobs. [`Config::BUILD`] is what the process-wide
//! allocator runs with; cargo features pick the enums and `build.rs` bakes the
//! numeric knobs from `GUARDHEAP_*` environment variables.

use std::{error::Error, fmt};

mod build {
    include!(concat!(env!("OUT_DIR"), "/build_config.rs"));
}

/// Registry capacity baked in at build time
pub const REGISTRY_CAPACITY: usize = build::REGISTRY_CAPACITY;

/// Which side(s) of an allocation get guard pages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardPlacement {
    /// Catches underflows. The user range starts right after the guard.
    Before,
    /// Catches overflows. The user range ends right before the guard.
    After,
    /// Guards both sides, but the user range is placed against the front
    /// guard, so small overflows land in slack before the back guard.
    Both,
}

impl GuardPlacement {
    pub const fn guards_before(self) -> bool {
        matches!(self, GuardPlacement::Before | GuardPlacement::Both)
    }

    pub const fn guards_after(self) -> bool {
        matches!(self, GuardPlacement::After | GuardPlacement::Both)
    }
}

/// What happens to a region once its allocation is freed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreePolicy {
    /// Give the region back to the OS
    Unmap,
    /// Keep the region mapped but inaccessible forever, so every
    /// use-after-free faults. Leaks address space; debugging builds only.
    RetainProtected,
}

/// What to do when `free()` is handed a pointer we never returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BadFreePolicy {
    Ignore,
    Report,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub placement: GuardPlacement,
    /// Guard pages on each protected side
    pub guard_pages: usize,
    pub free_policy: FreePolicy,
    pub bad_free: BadFreePolicy,
    /// Explicitly zero every accessible page of a new region
    pub zero_fill: bool,
    /// Alignment used by the malloc-style entry points
    pub default_align: usize,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    NoGuardPages,
    ZeroAlignment,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoGuardPages => write!(f, "at least one guard page per side is required"),
            ConfigError::ZeroAlignment => write!(f, "the default alignment must be non-zero"),
        }
    }
}

impl Error for ConfigError {}

impl Config {
    pub const BUILD: Config = Config {
        placement: if cfg!(feature = "guard-both") {
            GuardPlacement::Both
        } else if cfg!(feature = "guard-before") {
            GuardPlacement::Before
        } else {
            GuardPlacement::After
        },
        guard_pages: build::GUARD_PAGES,
        free_policy: if cfg!(feature = "retain-freed") {
            FreePolicy::RetainProtected
        } else {
            FreePolicy::Unmap
        },
        bad_free: if cfg!(feature = "quiet-bad-free") {
            BadFreePolicy::Ignore
        } else {
            BadFreePolicy::Report
        },
        zero_fill: cfg!(feature = "zero-fill"),
        default_align: build::DEFAULT_ALIGN,
    };

    pub const fn with_placement(mut self, placement: GuardPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub const fn with_guard_pages(mut self, guard_pages: usize) -> Self {
        self.guard_pages = guard_pages;
        self
    }

    pub const fn with_free_policy(mut self, free_policy: FreePolicy) -> Self {
        self.free_policy = free_policy;
        self
    }

    pub const fn with_bad_free(mut self, bad_free: BadFreePolicy) -> Self {
        self.bad_free = bad_free;
        self
    }

    pub const fn with_zero_fill(mut self, zero_fill: bool) -> Self {
        self.zero_fill = zero_fill;
        self
    }

    pub const fn with_default_align(mut self, default_align: usize) -> Self {
        self.default_align = default_align;
        self
    }

    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.guard_pages == 0 {
            return Err(ConfigError::NoGuardPages);
        }
        if self.default_align == 0 {
            return Err(ConfigError::ZeroAlignment);
        }
        Ok(())
    }
}

const _: () = assert!(Config::BUILD.validate().is_ok(), "invalid build configuration");

/// What C code expects from `malloc()`, `alignof(max_align_t)`
pub const MAX_ALIGN_T: usize = 16;

const _: () = assert!(
    !cfg!(feature = "interpose") || Config::BUILD.default_align >= MAX_ALIGN_T,
    "interposed malloc() must be max_align_t aligned"
);
