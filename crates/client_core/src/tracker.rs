//! Memory of what has already been delivered, per event category.
//!
//! Each category is a least-recently-observed cache. With a capacity bound the
//! tracker trades perfect duplicate suppression for bounded memory: an id that
//! was evicted and later reappears in a snapshot is treated as new again.
//! Re-observing an id refreshes it, so as long as a snapshot fits within the
//! capacity nothing the server keeps returning is ever evicted. Every eviction
//! is counted and the first one per category is logged at warn level.

use std::{fmt, hash::Hash, num::NonZeroUsize};

use lru::LruCache;
use shared::domain::EventId;
use tracing::{debug, warn};

use crate::types::InviteKey;

pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Message,
    Invite,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => f.write_str("message"),
            Self::Invite => f.write_str("invite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SeenKey {
    Message(EventId),
    Invite(InviteKey),
}

impl SeenKey {
    pub fn category(&self) -> Category {
        match self {
            Self::Message(_) => Category::Message,
            Self::Invite(_) => Category::Invite,
        }
    }
}

struct SeenSet<K: Hash + Eq> {
    category: Category,
    entries: LruCache<K, ()>,
    evicted: u64,
}

impl<K: Hash + Eq> SeenSet<K> {
    fn new(category: Category, capacity: Option<NonZeroUsize>) -> Self {
        let entries = match capacity {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            category,
            entries,
            evicted: 0,
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Returns whether the key was unseen. Seen keys are refreshed instead.
    fn observe(&mut self, key: K) -> bool {
        if self.entries.contains(&key) {
            self.entries.promote(&key);
            return false;
        }
        // Only absent keys are pushed, so anything handed back was evicted.
        if self.entries.push(key, ()).is_some() {
            self.evicted += 1;
            if self.evicted == 1 {
                warn!(
                    category = %self.category,
                    capacity = self.entries.cap().get(),
                    "seen-event capacity reached; oldest ids are being evicted and may be redelivered if they reappear"
                );
            } else {
                debug!(category = %self.category, evicted = self.evicted, "evicted seen id");
            }
        }
        true
    }
}

pub struct SeenTracker {
    capacity: Option<NonZeroUsize>,
    messages: SeenSet<EventId>,
    invites: SeenSet<InviteKey>,
}

impl SeenTracker {
    /// `None` keeps every id for the lifetime of the process.
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            capacity,
            messages: SeenSet::new(Category::Message, capacity),
            invites: SeenSet::new(Category::Invite, capacity),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn is_new(&self, key: &SeenKey) -> bool {
        match key {
            SeenKey::Message(event_id) => !self.messages.contains(event_id),
            SeenKey::Invite(invite) => !self.invites.contains(invite),
        }
    }

    /// Records the key, returning `true` if it had not been seen before.
    pub fn mark_seen(&mut self, key: SeenKey) -> bool {
        match key {
            SeenKey::Message(event_id) => self.messages.observe(event_id),
            SeenKey::Invite(invite) => self.invites.observe(invite),
        }
    }

    pub fn len(&self, category: Category) -> usize {
        match category {
            Category::Message => self.messages.entries.len(),
            Category::Invite => self.invites.entries.len(),
        }
    }

    pub fn evicted(&self, category: Category) -> u64 {
        match category {
            Category::Message => self.messages.evicted,
            Category::Invite => self.invites.evicted,
        }
    }

    pub fn total_evicted(&self) -> u64 {
        self.messages.evicted + self.invites.evicted
    }

    pub fn capacity(&self) -> Option<NonZeroUsize> {
        self.capacity
    }
}

impl Default for SeenTracker {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_SEEN_CAPACITY))
    }
}

#[cfg(test)]
#[path = "tests/tracker_tests.rs"]
mod tests;
