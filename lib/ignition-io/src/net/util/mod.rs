//! Network utilities.

/// Hyper integration helpers.
pub mod hyper;
