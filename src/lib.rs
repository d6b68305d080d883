#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

/// The block hash and key-hashing adapters used by the map by default.
pub mod hash;

/// A keyed hash map over the SIMD-probed hash table.
///
/// This module provides a `HashMap` that wraps the `HashTable` and offers
/// a standard key-value interface with configurable hashers.
pub mod hash_map;

pub mod hash_table;

pub use hash::DefaultHashBuilder;
pub use hash_map::Entry;
pub use hash_map::HashMap;
pub use hash_table::HashTable;
