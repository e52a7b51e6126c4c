// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Admission history.
//!
//! Remembers the identity of every message a receiver admitted so that a second delivery of the
//! same identity is caught. The history is bounded by a capacity and a time-to-live; identities
//! still in flight are pinned and never evicted.
//!

use crate::envelope::MessageId;

use tokio::time::Instant;

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

/// Bounded set of admitted message identities, oldest first.
#[derive(Debug)]
pub struct AdmissionLog {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<MessageId, Instant>,
    order: VecDeque<MessageId>,
}

impl AdmissionLog {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Whether `id` was admitted and has not been evicted yet.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|admitted| admitted.elapsed() < self.ttl)
    }

    /// Records `id`. `pinned` tells which identities must survive eviction.
    pub fn insert<F>(&mut self, id: MessageId, pinned: F)
    where
        F: Fn(&MessageId) -> bool,
    {
        let now = Instant::now();
        if self.entries.insert(id.clone(), now).is_some() {
            self.order.retain(|other| other != &id);
        }
        self.order.push_back(id);
        self.evict(now, pinned);
    }

    /// Forgets `id`, so a later delivery of it is admitted again.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        if self.entries.remove(id).is_none() {
            return false;
        }
        self.order.retain(|other| other != id);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict<F>(&mut self, now: Instant, pinned: F)
    where
        F: Fn(&MessageId) -> bool,
    {
        while let Some(oldest) = self.order.front() {
            let expired = self
                .entries
                .get(oldest)
                .map_or(true, |admitted| now.duration_since(*admitted) >= self.ttl);
            if !expired || pinned(oldest) {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.entries.remove(&id);
            }
        }
        while self.entries.len() > self.capacity {
            let Some(index) = self.order.iter().position(|id| !pinned(id)) else {
                break;
            };
            if let Some(id) = self.order.remove(index) {
                self.entries.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn id(value: &str) -> MessageId {
        MessageId::new(value)
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut log = AdmissionLog::new(2, Duration::from_secs(60));
        log.insert(id("a"), |_| false);
        log.insert(id("b"), |_| false);
        log.insert(id("c"), |_| false);
        assert_eq!(log.len(), 2);
        assert!(!log.contains(&id("a")));
        assert!(log.contains(&id("b")));
        assert!(log.contains(&id("c")));
    }

    #[test]
    fn test_pinned_entries_survive() {
        let mut log = AdmissionLog::new(1, Duration::from_secs(60));
        log.insert(id("a"), |_| false);
        log.insert(id("b"), |other| other == &id("a"));
        assert!(log.contains(&id("a")));
        assert!(!log.contains(&id("b")));

        log.insert(id("c"), |other| other == &id("a") || other == &id("c"));
        assert!(log.contains(&id("a")));
        assert!(log.contains(&id("c")));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_remove_forgets() {
        let mut log = AdmissionLog::new(4, Duration::from_secs(60));
        log.insert(id("a"), |_| false);
        assert!(log.remove(&id("a")));
        assert!(!log.contains(&id("a")));
        assert!(!log.remove(&id("a")));
        assert!(log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let mut log = AdmissionLog::new(10, Duration::from_secs(5));
        log.insert(id("a"), |_| false);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!log.contains(&id("a")));
        log.insert(id("b"), |_| false);
        assert_eq!(log.len(), 1);
    }
}
