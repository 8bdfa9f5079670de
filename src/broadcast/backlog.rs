//! Bounded, time-limited history of recent broadcasts.
//!
//! Eviction is opportunistic: expired and over-capacity entries are dropped
//! when a new event is pushed. Replay filters by age as well, so an entry that
//! expired since the last push is never handed to a client.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;

use tokio::time::Instant;

use super::event::{BroadcastEvent, EventKind};
use crate::domain::entities::ContentItem;

#[derive(Debug)]
pub struct Backlog {
    capacity: NonZeroUsize,
    ttl: Duration,
    events: VecDeque<BroadcastEvent>,
}

impl Backlog {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            events: VecDeque::with_capacity(capacity.get()),
        }
    }

    /// Append an event, evicting expired entries and then the oldest entries
    /// beyond capacity. Returns how many entries were evicted.
    pub fn push(&mut self, event: BroadcastEvent, now: Instant) -> usize {
        let before = self.events.len();
        while self
            .events
            .front()
            .is_some_and(|oldest| self.is_expired(oldest, now))
        {
            self.events.pop_front();
        }

        self.events.push_back(event);
        while self.events.len() > self.capacity.get() {
            self.events.pop_front();
        }
        before + 1 - self.events.len()
    }

    /// Items of live `created` events, oldest first.
    pub fn replay(&self, now: Instant) -> Vec<ContentItem> {
        self.events
            .iter()
            .filter(|event| event.kind == EventKind::Created && !self.is_expired(event, now))
            .map(|event| event.item.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn is_expired(&self, event: &BroadcastEvent, now: Instant) -> bool {
        now.saturating_duration_since(event.recorded_at) >= self.ttl
    }
}
