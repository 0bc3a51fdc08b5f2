//! Per-domain dispatch bookkeeping.
//!
//! A `DomainQueue` is the unit of mutual exclusion: its FIFO of pending
//! message ids, the holder campaign, and the throttle / daily-cap counters are
//! only touched while the owning mutex is held.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use super::types::MessageId;

#[derive(Debug, Default)]
pub struct DomainQueue {
    fifo: VecDeque<MessageId>,
    holder: Option<String>,
    last_dispatch_at: Option<DateTime<Utc>>,
    dispatched_today: Option<(NaiveDate, u32)>,
}

impl DomainQueue {
    pub fn holder(&self) -> Option<&str> {
        self.holder.as_deref()
    }

    /// Claim the domain for `campaign_id`.
    ///
    /// Returns the current holder when another campaign already has it.
    pub fn claim(&mut self, campaign_id: &str) -> Result<(), String> {
        match &self.holder {
            Some(holder) if holder != campaign_id => Err(holder.clone()),
            _ => {
                self.holder = Some(campaign_id.to_string());
                Ok(())
            }
        }
    }

    /// Release the domain if `campaign_id` holds it. Returns whether it did.
    pub fn release(&mut self, campaign_id: &str) -> bool {
        if self.holder.as_deref() == Some(campaign_id) {
            self.holder = None;
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &MessageId> {
        self.fifo.iter()
    }

    pub fn extend(&mut self, ids: impl IntoIterator<Item = MessageId>) {
        self.fifo.extend(ids);
    }

    /// Insert `id` ahead of the first entry for which `later` holds, or at the
    /// back when none does.
    pub fn insert_before(&mut self, id: MessageId, later: impl FnMut(&MessageId) -> bool) {
        let index = self.fifo.iter().position(later).unwrap_or(self.fifo.len());
        self.fifo.insert(index, id);
    }

    pub fn front(&self) -> Option<MessageId> {
        self.fifo.front().copied()
    }

    pub fn pop_front(&mut self) -> Option<MessageId> {
        self.fifo.pop_front()
    }

    /// Keep only the ids for which `keep` returns true.
    pub fn retain(&mut self, keep: impl FnMut(&MessageId) -> bool) {
        self.fifo.retain(keep);
    }

    /// Release FIFO storage once nothing is pending. Throttle state stays so
    /// the next campaign on the domain still respects the slot interval.
    pub fn shrink_if_idle(&mut self) {
        if self.fifo.is_empty() && self.holder.is_none() {
            self.fifo = VecDeque::new();
        }
    }

    pub fn last_dispatch_at(&self) -> Option<DateTime<Utc>> {
        self.last_dispatch_at
    }

    /// True while less than one slot interval has passed since the last
    /// release.
    pub fn is_throttled(&self, now: DateTime<Utc>, interval: TimeDelta) -> bool {
        self.last_dispatch_at
            .is_some_and(|last| now.signed_duration_since(last) < interval)
    }

    pub fn dispatched_on(&self, date: NaiveDate) -> u32 {
        match self.dispatched_today {
            Some((day, count)) if day == date => count,
            _ => 0,
        }
    }

    pub fn record_dispatch(&mut self, now: DateTime<Utc>, local_date: NaiveDate) {
        self.last_dispatch_at = Some(now);
        let count = self.dispatched_on(local_date);
        self.dispatched_today = Some((local_date, count + 1));
    }
}
