pub mod config;
pub mod diag;
pub mod guard;
pub mod guarded;
pub mod placement;
pub mod registry;
