//! # Utilities Module
//!
//! Internal utility modules for the drop-core crate.
//! These modules are marked as `pub(crate)` to enforce API boundaries.

pub(crate) mod logger;
pub(crate) mod retry;

pub use logger::{setup_logger, MINT_RESULT_TARGET};
