//! Lifecycle control: pause, resume, stop, complete, and lead-level cancel.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::Engine;
use crate::error::{EngineError, Result};
use crate::lifecycle::{Campaign, LifecycleAction};
use crate::queue::{DomainQueue, MessageId, MessageStatus, ScheduledMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub campaign_id: String,
    /// Pending messages moved to `canceled`.
    pub canceled: usize,
}

impl Engine {
    /// Freeze a running campaign. Queued messages stay where they are.
    pub fn pause(&self, campaign_id: &str, now: DateTime<Utc>) -> Result<Campaign> {
        let campaign = self.transition(campaign_id, LifecycleAction::Pause, now)?;
        info!(campaign_id = %campaign_id, domain = %campaign.domain, "campaign_paused");
        Ok(campaign)
    }

    pub fn resume(&self, campaign_id: &str, now: DateTime<Utc>) -> Result<Campaign> {
        let campaign = self.transition(campaign_id, LifecycleAction::Resume, now)?;
        info!(campaign_id = %campaign_id, domain = %campaign.domain, "campaign_resumed");
        Ok(campaign)
    }

    /// Stop a campaign for good: every pending message is canceled and the
    /// domain is released. Messages already handed to the sender are left to
    /// report their outcome.
    pub fn stop(&self, campaign_id: &str, now: DateTime<Utc>) -> Result<StopReport> {
        let domain = self
            .campaign_domain(campaign_id)
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))?;
        let slot = self.domain_slot(&domain);
        let mut queue = slot.lock();

        let campaign = self.apply_locked(campaign_id, LifecycleAction::Stop, now)?;
        let canceled = self.cancel_pending(&mut queue, |m| m.campaign_id == campaign_id);
        queue.release(campaign_id);
        queue.shrink_if_idle();
        drop(queue);

        info!(
            campaign_id = %campaign_id,
            domain = %domain,
            canceled = canceled.len(),
            "campaign_stopped"
        );
        self.emit_messages(&canceled);
        self.sink.campaign_updated(&campaign);

        Ok(StopReport {
            campaign_id: campaign_id.to_string(),
            canceled: canceled.len(),
        })
    }

    /// Mark a campaign completed and release `domain` if the campaign holds it.
    ///
    /// Returns `Ok(false)` without touching anything when the campaign does not
    /// hold the domain, so repeated calls are harmless.
    pub fn complete_campaign(
        &self,
        campaign_id: &str,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(slot) = self.existing_slot(domain) else {
            return Ok(false);
        };
        let mut queue = slot.lock();
        if queue.holder() != Some(campaign_id) {
            return Ok(false);
        }

        let campaign = self.apply_locked(campaign_id, LifecycleAction::Complete, now)?;
        let canceled = self.cancel_pending(&mut queue, |m| m.campaign_id == campaign_id);
        queue.release(campaign_id);
        queue.shrink_if_idle();
        drop(queue);

        info!(
            campaign_id = %campaign_id,
            domain = %domain,
            canceled = canceled.len(),
            "campaign_completed"
        );
        self.emit_messages(&canceled);
        self.sink.campaign_updated(&campaign);
        Ok(true)
    }

    /// Cancel every pending message of a lead on every domain. Returns how
    /// many were canceled.
    pub fn cancel_lead(&self, lead_id: &str, now: DateTime<Utc>) -> usize {
        let domains: Vec<String> = self.domains.iter().map(|e| e.key().clone()).collect();

        let mut canceled = Vec::new();
        for domain in &domains {
            let Some(slot) = self.existing_slot(domain) else {
                continue;
            };
            let mut queue = slot.lock();
            canceled.extend(self.cancel_pending(&mut queue, |m| m.lead_id == lead_id));
        }

        if !canceled.is_empty() {
            info!(
                lead_id = %lead_id,
                canceled = canceled.len(),
                at = %now,
                "lead_messages_canceled"
            );
        }
        self.emit_messages(&canceled);
        canceled.len()
    }

    /// Evict the message records of a stopped or completed campaign once
    /// none of them is still in flight. The campaign record stays so its id
    /// keeps resolving. Returns how many messages were evicted.
    pub fn forget_campaign(&self, campaign_id: &str) -> usize {
        let Some(domain) = self.campaign_domain(campaign_id) else {
            return 0;
        };
        let slot = self.domain_slot(&domain);
        let queue = slot.lock();

        let terminal = self
            .campaigns
            .get(campaign_id)
            .is_some_and(|c| c.status.is_terminal());
        if !terminal || !self.is_campaign_settled(campaign_id) {
            return 0;
        }
        let Some((_, ids)) = self.by_campaign.remove(campaign_id) else {
            return 0;
        };
        for id in &ids {
            self.messages.remove(id);
        }
        drop(queue);

        debug!(campaign_id = %campaign_id, evicted = ids.len(), "campaign_forgotten");
        ids.len()
    }

    fn transition(
        &self,
        campaign_id: &str,
        action: LifecycleAction,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let domain = self
            .campaign_domain(campaign_id)
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))?;
        let slot = self.domain_slot(&domain);
        let queue = slot.lock();
        let campaign = self.apply_locked(campaign_id, action, now)?;
        drop(queue);

        self.sink.campaign_updated(&campaign);
        Ok(campaign)
    }

    /// Apply a lifecycle action. The caller holds the campaign's domain lock.
    fn apply_locked(
        &self,
        campaign_id: &str,
        action: LifecycleAction,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))?;
        entry.apply(action, now)?;
        Ok(entry.clone())
    }

    /// Cancel pending messages in `queue` that match and drop them from the
    /// FIFO. Released messages are not touched.
    fn cancel_pending(
        &self,
        queue: &mut DomainQueue,
        mut pick: impl FnMut(&ScheduledMessage) -> bool,
    ) -> Vec<ScheduledMessage> {
        let mut canceled = Vec::new();
        for id in queue.ids() {
            let Some(mut message) = self.messages.get_mut(id) else {
                continue;
            };
            if message.is_pending() && pick(&*message) {
                message.status = MessageStatus::Canceled;
                canceled.push(message.clone());
            }
        }

        if !canceled.is_empty() {
            let dropped: HashSet<MessageId> = canceled.iter().map(|m| m.id).collect();
            queue.retain(|id| !dropped.contains(id));
        }
        canceled
    }
}
