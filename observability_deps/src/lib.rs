//! This crate exists to coordinate versions of `tracing` and friends so that
//! every crate in the workspace logs through the same facade.

pub use tracing;
