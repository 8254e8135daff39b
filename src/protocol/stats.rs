use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{Category, CATEGORY_COUNT};

/// Lock-free per-category event counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EventStats {
    counts: [AtomicU64; CATEGORY_COUNT],
}

impl EventStats {
    /// Create a new zeroed EventStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given category by one.
    pub fn record(&self, category: Category) {
        if let Some(counter) = self.counts.get(category.index()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(Category, u64)> {
        let mut result = Vec::new();

        for category in Category::all() {
            if let Some(counter) = self.counts.get(category.index()) {
                let v = counter.swap(0, Ordering::Relaxed);
                if v > 0 {
                    result.push((*category, v));
                }
            }
        }

        result
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}
