//! Index implementations
//!
//! Only a primary key hash index is needed: rows are located by key hash,
//! candidates are confirmed against the key column.

mod hash_index;

pub use hash_index::{Entry, HashIndex, HashIndexStats, CHUNK_CAPACITY, NOSLOT};
