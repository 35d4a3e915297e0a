//! Memory management
//!
//! Fallible, aligned allocations backing column pages and deltas.

mod buffer;

pub use buffer::{Buffer, Pod};
