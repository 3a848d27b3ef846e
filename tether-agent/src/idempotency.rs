//! Idempotency cache: replayed commands return their recorded outcome.
//!
//! The queue gives at-least-once delivery, so the same logical command can
//! arrive more than once. The cache maps idempotency keys to finished
//! results, bounded to the most recent 1000 entries with a 24-hour expiry,
//! and marks keys whose execution is still underway so a redelivered copy
//! cannot run concurrently with the original.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tether_contract::CommandResult;

pub const MAX_ENTRIES: usize = 1000;
pub const ENTRY_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: CommandResult,
    stored_at: DateTime<Utc>,
}

/// Outcome of the atomic check-and-claim at the start of command handling.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyState {
    /// Never seen: the caller now owns execution for this key.
    Fresh,
    /// A previous execution finished; its result should be replayed.
    Cached(CommandResult),
    /// Another execution of the same key is still running.
    Running,
}

#[derive(Default)]
pub struct IdempotencyCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    running: HashSet<String>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically classify the key and, when fresh, claim it for execution.
    pub fn begin(&mut self, key: &str, now: DateTime<Utc>) -> KeyState {
        self.expire(now);

        if let Some(entry) = self.entries.get(key) {
            return KeyState::Cached(entry.result.clone());
        }
        if !self.running.insert(key.to_string()) {
            return KeyState::Running;
        }
        KeyState::Fresh
    }

    /// Record the outcome of an execution claimed with [`begin`].
    pub fn finish(&mut self, key: &str, result: CommandResult, now: DateTime<Utc>) {
        self.running.remove(key);
        if self.entries.contains_key(key) {
            return;
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                result,
                stored_at: now,
            },
        );
        self.order.push_back(key.to_string());
        while self.order.len() > MAX_ENTRIES {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    /// Drop the running claim without recording a result (shutdown unwind).
    pub fn abandon(&mut self, key: &str) {
        self.running.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let ttl = Duration::hours(ENTRY_TTL_HOURS);
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map(|entry| now - entry.stored_at > ttl)
                .unwrap_or(true);
            if !expired {
                break;
            }
            let key = self.order.pop_front().unwrap_or_default();
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str) -> CommandResult {
        CommandResult::success(id, format!("done {id}"))
    }

    #[test]
    fn replay_returns_cached_result() {
        let mut cache = IdempotencyCache::new();
        let now = Utc::now();

        assert_eq!(cache.begin("k1", now), KeyState::Fresh);
        cache.finish("k1", result("cmd-1"), now);

        match cache.begin("k1", now) {
            KeyState::Cached(cached) => assert_eq!(cached.summary, "done cmd-1"),
            other => panic!("expected cached, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_execution_of_same_key_blocked() {
        let mut cache = IdempotencyCache::new();
        let now = Utc::now();

        assert_eq!(cache.begin("k1", now), KeyState::Fresh);
        assert_eq!(cache.begin("k1", now), KeyState::Running);

        cache.finish("k1", result("cmd-1"), now);
        assert!(matches!(cache.begin("k1", now), KeyState::Cached(_)));
    }

    #[test]
    fn distinct_keys_execute_independently() {
        let mut cache = IdempotencyCache::new();
        let now = Utc::now();
        assert_eq!(cache.begin("k1", now), KeyState::Fresh);
        assert_eq!(cache.begin("k2", now), KeyState::Fresh);
    }

    #[test]
    fn entries_expire_after_24_hours() {
        let mut cache = IdempotencyCache::new();
        let t0 = Utc::now();

        assert_eq!(cache.begin("k1", t0), KeyState::Fresh);
        cache.finish("k1", result("cmd-1"), t0);

        let later = t0 + Duration::hours(ENTRY_TTL_HOURS) + Duration::seconds(1);
        assert_eq!(cache.begin("k1", later), KeyState::Fresh);
    }

    #[test]
    fn cache_bounded_to_most_recent_1000() {
        let mut cache = IdempotencyCache::new();
        let now = Utc::now();

        for i in 0..(MAX_ENTRIES + 10) {
            let key = format!("k{i}");
            assert_eq!(cache.begin(&key, now), KeyState::Fresh);
            cache.finish(&key, result(&format!("cmd-{i}")), now);
        }

        assert_eq!(cache.len(), MAX_ENTRIES);
        // Oldest evicted, newest retained.
        assert_eq!(cache.begin("k0", now), KeyState::Fresh);
        cache.abandon("k0");
        let newest = format!("k{}", MAX_ENTRIES + 9);
        assert!(matches!(cache.begin(&newest, now), KeyState::Cached(_)));
    }

    #[test]
    fn abandon_releases_claim_without_result() {
        let mut cache = IdempotencyCache::new();
        let now = Utc::now();
        assert_eq!(cache.begin("k1", now), KeyState::Fresh);
        cache.abandon("k1");
        assert_eq!(cache.begin("k1", now), KeyState::Fresh);
        assert!(cache.is_empty());
    }
}
