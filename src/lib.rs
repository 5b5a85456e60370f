//! Capacity-bounded concurrent containers.
//!
//! # capmap::CacheMap
//! [`CacheMap`] is a concurrent hash map that keeps the number of resident
//! entries within a caller-specified bound by delegating recency bookkeeping
//! to a pluggable eviction policy: unbounded, LRU, or LIRS.

mod cache_map;
pub use cache_map::{Builder, CacheMap, ConfigError, Iter};

mod eviction;
pub use eviction::{EntrySizeCalculator, EvictionListener, EvictionPolicy};

mod counter;
mod deque;
mod exit_guard;
mod hash_table;
mod wait_queue;

#[cfg(feature = "equivalent")]
pub use equivalent::{Comparable, Equivalent};

#[cfg(not(feature = "equivalent"))]
mod equivalent;
#[cfg(not(feature = "equivalent"))]
pub use equivalent::{Comparable, Equivalent};

#[cfg(feature = "serde")]
mod serde;

/// Re-exports the epoch-based memory reclamation scheme the map is built upon.
///
/// A [`Guard`](sdd::Guard) is required for iteration; see [`CacheMap::iter`].
pub mod epoch {
    pub use sdd::Guard;
}

#[cfg(test)]
mod tests;
