//! Releasing due messages, one per slot per domain.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::Engine;
use crate::lifecycle::CampaignStatus;
use crate::queue::{DomainQueue, MessageStatus, ScheduledMessage};

impl Engine {
    /// Release at most one due message for `domain`.
    ///
    /// Checks run in order: past the grace period the same-day remainder rolls
    /// over to the next valid day; outside sending hours, at the daily cap, or
    /// within one slot interval of the previous release nothing is returned.
    /// Otherwise the head of the FIFO is released if it is due. Entries that
    /// were already settled are dropped, and entries of stopped or completed
    /// campaigns are canceled and dropped, without counting against the
    /// throttle. A paused holder freezes the queue.
    pub fn get_ready_messages(&self, domain: &str, now: DateTime<Utc>) -> Vec<ScheduledMessage> {
        let Some(slot) = self.existing_slot(domain) else {
            return Vec::new();
        };
        let mut queue = slot.lock();
        if queue.is_empty() {
            return Vec::new();
        }

        if !self.policy.is_within_grace(now) {
            let moved = self.roll_over(&mut queue, domain, now);
            drop(queue);
            self.emit_messages(&moved);
            return Vec::new();
        }

        if !self.policy.is_sending_hours(now) {
            return Vec::new();
        }

        let today = self.policy.local_date(now);
        let cap = self.policy.effective_daily_cap();
        if queue.dispatched_on(today) >= cap {
            debug!(domain = %domain, cap = cap, "domain_daily_cap_reached");
            return Vec::new();
        }

        if queue.is_throttled(now, self.policy.slot_interval()) {
            return Vec::new();
        }

        let mut canceled = Vec::new();
        let released = loop {
            let Some(id) = queue.front() else {
                break None;
            };
            let Some(mut message) = self.messages.get_mut(&id) else {
                queue.pop_front();
                continue;
            };
            if !message.is_pending() {
                drop(message);
                queue.pop_front();
                continue;
            }

            // Campaign status is re-read here so a stop that committed before
            // this call can never be overtaken.
            let status = self.campaigns.get(&message.campaign_id).map(|c| c.status);
            match status {
                Some(CampaignStatus::Running) => {}
                Some(CampaignStatus::Paused) => break None,
                _ => {
                    message.status = MessageStatus::Canceled;
                    canceled.push(message.clone());
                    drop(message);
                    queue.pop_front();
                    continue;
                }
            }

            if message.scheduled_at > now {
                break None;
            }

            message.dispatched_at = Some(now);
            let released = message.clone();
            drop(message);
            queue.pop_front();
            queue.record_dispatch(now, today);
            break Some(released);
        };
        let remaining = queue.len();
        drop(queue);

        self.emit_messages(&canceled);

        match released {
            Some(message) => {
                info!(
                    domain = %domain,
                    campaign_id = %message.campaign_id,
                    message_id = %message.id,
                    lead_id = %message.lead_id,
                    step = message.step_index,
                    scheduled_at = %message.scheduled_at,
                    remaining = remaining,
                    "message_dispatched"
                );
                self.sink.message_updated(&message);
                vec![message]
            }
            None => Vec::new(),
        }
    }

    /// Run [`get_ready_messages`](Self::get_ready_messages) over every domain
    /// with bookkeeping.
    pub fn dispatch_tick(&self, now: DateTime<Utc>) -> Vec<ScheduledMessage> {
        let domains: Vec<String> = self.domains.iter().map(|e| e.key().clone()).collect();
        domains
            .iter()
            .flat_map(|domain| self.get_ready_messages(domain, now))
            .collect()
    }

    /// Move every pending entry due on or before today to the next valid
    /// day's window start. FIFO positions are kept.
    fn roll_over(
        &self,
        queue: &mut DomainQueue,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Vec<ScheduledMessage> {
        let today = self.policy.local_date(now);
        let opening = self.policy.next_day_opening(now);

        let mut moved = Vec::new();
        for id in queue.ids() {
            let Some(mut message) = self.messages.get_mut(id) else {
                continue;
            };
            if message.is_pending() && self.policy.local_date(message.scheduled_at) <= today {
                message.scheduled_at = opening;
                moved.push(message.clone());
            }
        }

        if !moved.is_empty() {
            info!(
                domain = %domain,
                count = moved.len(),
                next_opening = %opening,
                "domain_rollover"
            );
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::*;
    use super::*;
    use crate::flow::FlowRegistry;
    use crate::leads::StoppedLeads;
    use crate::policy::{PolicySettings, SendingPolicy};

    fn lead_of(messages: &[ScheduledMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.lead_id.as_str()).collect()
    }

    #[test]
    fn test_one_release_per_slot_interval() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(3), monday_open()).unwrap();

        let first = engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 0));
        assert_eq!(lead_of(&first), ["lead-1"]);
        assert!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 10)).is_empty());
        assert_eq!(
            lead_of(&engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 20))),
            ["lead-2"]
        );
        assert_eq!(
            lead_of(&engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 40))),
            ["lead-3"]
        );
        // Step 2 is not due until Thursday.
        assert!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 9, 0)).is_empty());
    }

    #[test]
    fn test_released_message_is_stamped_but_queued() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();

        let now = at(2025, 9, 29, 8, 5);
        let released = engine.get_ready_messages(DOMAIN, now);
        let stored = engine.message(&released[0].id).unwrap();
        assert_eq!(stored.status, MessageStatus::Queued);
        assert_eq!(stored.dispatched_at, Some(now));
        assert!(!engine.is_campaign_settled(&id));
    }

    #[test]
    fn test_rollover_past_grace() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(3), monday_open()).unwrap();
        engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 0));

        assert!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 18, 30)).is_empty());

        let tuesday_open = at(2025, 9, 30, 8, 0);
        let messages = engine.messages_for_campaign(&id);
        assert_eq!(messages[0].scheduled_at, monday_open());
        assert_eq!(messages[1].scheduled_at, tuesday_open);
        assert_eq!(messages[2].scheduled_at, tuesday_open);
        // Later steps keep their own dates.
        assert_eq!(messages[3].scheduled_at, at(2025, 10, 2, 8, 0));

        assert_eq!(
            lead_of(&engine.get_ready_messages(DOMAIN, tuesday_open)),
            ["lead-2"]
        );
    }

    #[test]
    fn test_grace_period_still_releases() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();

        let released = engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 17, 45));
        assert_eq!(lead_of(&released), ["lead-1"]);
    }

    #[test]
    fn test_nothing_before_window_or_on_weekend() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();

        assert!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 7, 59)).is_empty());
        assert!(engine.get_ready_messages(DOMAIN, at(2025, 10, 4, 10, 0)).is_empty());
        assert_eq!(
            engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 0)).len(),
            1
        );
    }

    #[test]
    fn test_daily_cap() {
        let settings = PolicySettings {
            daily_cap_per_domain: 2,
            ..PolicySettings::default()
        };
        let policy = SendingPolicy::from_settings(&settings).unwrap();
        let engine = Engine::new(policy, FlowRegistry::builtin(), Arc::new(StoppedLeads::new()));
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(3), monday_open()).unwrap();

        assert_eq!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 0)).len(), 1);
        assert_eq!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 20)).len(), 1);
        assert!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 40)).is_empty());
        assert_eq!(
            lead_of(&engine.get_ready_messages(DOMAIN, at(2025, 9, 30, 8, 0))),
            ["lead-3"]
        );
    }

    #[test]
    fn test_paused_campaign_is_withheld() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(2), monday_open()).unwrap();
        engine.pause(&id, monday_open()).unwrap();

        assert!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 0)).is_empty());
        assert!(engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 20)).is_empty());

        engine.resume(&id, at(2025, 9, 29, 8, 30)).unwrap();
        assert_eq!(
            lead_of(&engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 40))),
            ["lead-1"]
        );
    }

    #[test]
    fn test_stopped_campaign_is_never_released() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(2), monday_open()).unwrap();
        engine.stop(&id, monday_open()).unwrap();

        for hour in 8..17 {
            assert!(engine
                .get_ready_messages(DOMAIN, at(2025, 9, 29, hour, 0))
                .is_empty());
        }
        assert!(engine
            .messages_for_campaign(&id)
            .iter()
            .all(|m| m.status == MessageStatus::Canceled));
    }

    #[test]
    fn test_dispatch_tick_covers_every_domain() {
        let engine = engine();
        let first = draft(&engine, "c-1", DOMAIN);
        let second = draft(&engine, "c-2", "punthelder-seo.nl");
        engine.schedule_campaign(&first, &leads(1), monday_open()).unwrap();
        engine.schedule_campaign(&second, &leads(1), monday_open()).unwrap();

        let mut released: Vec<String> = engine
            .dispatch_tick(at(2025, 9, 29, 8, 0))
            .into_iter()
            .map(|m| m.campaign_id)
            .collect();
        released.sort();
        assert_eq!(released, ["c-1", "c-2"]);
        assert!(engine.dispatch_tick(at(2025, 9, 29, 8, 10)).is_empty());
    }

    #[test]
    fn test_unknown_domain_is_empty() {
        let engine = engine();
        assert!(engine
            .get_ready_messages("nonexistent.com", monday_open())
            .is_empty());
    }
}
