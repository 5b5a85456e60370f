//! A striped counter for tracking the number of resident entries.
//!
//! A single hot atomic becomes the bottleneck of an otherwise lock-striped table under write
//! contention, so additions first try the base cell and fall back to a per-thread-hashed
//! stripe; the total is only materialized on demand.

use std::cell::Cell;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicI64, AtomicU64};

use sdd::{AtomicShared, Guard, Shared, Tag};

/// A cache-line-padded accumulator cell.
#[derive(Default)]
#[repr(align(128))]
struct Stripe(AtomicI64);

/// The striped counter.
pub(crate) struct Counter {
    base: AtomicI64,
    stripes: AtomicShared<Box<[Stripe]>>,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Self {
            base: AtomicI64::new(0),
            stripes: AtomicShared::null(),
        }
    }

    /// Adds `delta` to the counter.
    #[inline]
    pub(crate) fn add(&self, delta: i64) {
        let base = self.base.load(Relaxed);
        if self
            .base
            .compare_exchange(base, base + delta, Relaxed, Relaxed)
            .is_ok()
        {
            return;
        }
        self.add_slow(delta);
    }

    fn add_slow(&self, delta: i64) {
        let guard = Guard::new();
        let stripes_ptr = self.stripes.load(Acquire, &guard);
        let stripes = if let Some(stripes) = stripes_ptr.as_ref() {
            stripes
        } else {
            let num_stripes = std::thread::available_parallelism()
                .map_or(4, std::num::NonZeroUsize::get)
                .next_power_of_two()
                .clamp(4, 128);
            let new_stripes: Box<[Stripe]> = (0..num_stripes).map(|_| Stripe::default()).collect();
            match self.stripes.compare_exchange(
                stripes_ptr,
                (Some(Shared::new(new_stripes)), Tag::None),
                AcqRel,
                Acquire,
                &guard,
            ) {
                Ok((_, ptr)) | Err((_, ptr)) => unsafe { ptr.as_ref().unwrap_unchecked() },
            }
        };
        let index = thread_probe() as usize & (stripes.len() - 1);
        stripes[index].0.fetch_add(delta, Relaxed);
    }

    /// Returns the current total.
    ///
    /// The sum is not an atomic snapshot; concurrent updates may or may not be reflected.
    pub(crate) fn sum(&self) -> i64 {
        let guard = Guard::new();
        let mut total = self.base.load(Relaxed);
        if let Some(stripes) = self.stripes.load(Acquire, &guard).as_ref() {
            for stripe in stripes.iter() {
                total = total.wrapping_add(stripe.0.load(Relaxed));
            }
        }
        total
    }
}

/// Returns a per-thread probe value used to pick a stripe.
fn thread_probe() -> u64 {
    static SEED: AtomicU64 = AtomicU64::new(0);
    thread_local! {
        static PROBE: Cell<u64> = const { Cell::new(0) };
    }
    PROBE.with(|probe| {
        let mut value = probe.get();
        if value == 0 {
            // SplitMix64 over a global sequence number.
            let mut z = SEED.fetch_add(0x9E37_79B9_7F4A_7C15, Relaxed).wrapping_add(1);
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            value = (z ^ (z >> 31)) | 1;
            probe.set(value);
        }
        value
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_and_sum() {
        let counter = Counter::new();
        for _ in 0..128 {
            counter.add(1);
        }
        counter.add(-28);
        assert_eq!(counter.sum(), 100);
    }

    #[test]
    fn concurrent_add() {
        let counter = Arc::new(Counter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter_clone = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..4096 {
                    counter_clone.add(1);
                }
                for _ in 0..4096 {
                    counter_clone.add(-1);
                }
            }));
        }
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(counter.sum(), 0);
    }
}
