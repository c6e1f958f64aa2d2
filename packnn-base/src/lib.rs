//! Common utilities used by other packnn crates.
//!
//! This is an internal crate which contains the reduced-precision float types
//! and byte casting helpers shared by the runtime and its tests.

pub mod elem;
pub mod half;

pub use elem::Element;
pub use half::{Bf16, F16};
