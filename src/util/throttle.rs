// =============================================================================
// Per-key minimum-interval throttle
// =============================================================================
//
// Used for the Tick Consumer's per-(venue, symbol) throttle, the Order
// Service's per-strategy failure cooldown, and the Telegram Dispatcher's
// per-chat pacing. All three are the same shape: "has at least `min_gap`
// elapsed since the last time this key was allowed through?"
// =============================================================================

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub struct Throttle<K> {
    last_seen: DashMap<K, Instant>,
}

impl<K> Throttle<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            last_seen: DashMap::new(),
        }
    }

    /// Returns `true` if at least `min_gap` has elapsed since the last call
    /// that returned `true` for this key (or if this is the first call for
    /// the key). Records the current instant as the new baseline when it
    /// returns `true`.
    pub fn try_pass(&self, key: K, min_gap: Duration) -> bool {
        let now = Instant::now();
        match self.last_seen.get(&key) {
            Some(last) if now.duration_since(*last) < min_gap => false,
            _ => {
                self.last_seen.insert(key, now);
                true
            }
        }
    }

    /// Time remaining until `key` would next pass, or `Duration::ZERO` if it
    /// would pass right now.
    pub fn remaining(&self, key: &K, min_gap: Duration) -> Duration {
        match self.last_seen.get(key) {
            Some(last) => min_gap.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Drop bookkeeping for keys whose last pass is older than `idle_after`.
    /// Used to reap idle per-chat/per-queue trackers.
    pub fn reap_idle(&self, idle_after: Duration) -> usize {
        let before = self.last_seen.len();
        self.last_seen.retain(|_, last| last.elapsed() <= idle_after);
        before - self.last_seen.len()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

impl<K> Default for Throttle<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
