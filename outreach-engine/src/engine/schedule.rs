//! Campaign creation and schedule expansion.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::Engine;
use crate::error::{EngineError, Result};
use crate::flow::{calculate_schedule, StepTime};
use crate::lifecycle::{Campaign, LifecycleAction, NewCampaign};
use crate::queue::{MessageId, MessageStatus, ScheduledMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Scheduled,
    /// Every candidate lead was stopped; nothing was enqueued and the domain
    /// was not claimed.
    EmptyAudience,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    pub campaign_id: String,
    pub domain: String,
    pub flow_version: u32,
    pub outcome: ScheduleOutcome,
    pub total_messages: usize,
    pub steps: Vec<StepTime>,
}

impl Engine {
    /// Register a draft campaign for a configured domain.
    pub fn create_campaign(&self, new: NewCampaign, now: DateTime<Utc>) -> Result<Campaign> {
        self.flows.require(&new.domain)?;

        let id = new
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let campaign = match self.campaigns.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::CampaignExists(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Campaign::draft(id, new, now)).clone()
            }
        };

        info!(
            campaign_id = %campaign.id,
            domain = %campaign.domain,
            start_at = ?campaign.start_at,
            "campaign_created"
        );
        self.sink.campaign_updated(&campaign);
        Ok(campaign)
    }

    /// Expand a draft campaign into per-lead, per-step messages and claim its
    /// domain.
    ///
    /// All-or-nothing: on any rejection no message is enqueued, the domain is
    /// not claimed and the campaign stays a draft.
    pub fn schedule_campaign(
        &self,
        campaign_id: &str,
        lead_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<ScheduleReport> {
        let campaign = self
            .campaign(campaign_id)
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))?;
        let flow = self.flows.require(&campaign.domain)?;
        campaign.check(LifecycleAction::Activate)?;

        // Fail fast on a held domain before looking at the audience. The
        // authoritative claim is repeated under the lock below.
        if let Some(slot) = self.existing_slot(&campaign.domain) {
            let holder = slot.lock().holder().map(str::to_string);
            if let Some(holder) = holder.filter(|h| h != campaign_id) {
                return Err(self.domain_busy(campaign_id, &campaign.domain, holder));
            }
        }

        let mut seen = HashSet::new();
        let active: Vec<&String> = lead_ids
            .iter()
            .filter(|lead| seen.insert(lead.as_str()))
            .filter(|lead| !self.leads.is_stopped(lead))
            .collect();

        if active.is_empty() {
            warn!(
                campaign_id = %campaign.id,
                domain = %campaign.domain,
                candidates = lead_ids.len(),
                "campaign_empty_audience"
            );
            return Ok(ScheduleReport {
                campaign_id: campaign.id,
                domain: campaign.domain,
                flow_version: flow.version,
                outcome: ScheduleOutcome::EmptyAudience,
                total_messages: 0,
                steps: Vec::new(),
            });
        }

        let start = campaign.start_at.unwrap_or(now);
        let steps = calculate_schedule(&self.policy, start, flow);
        let messages = expand(&campaign, &steps, &active, now);
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();

        let slot = self.domain_slot(&campaign.domain);
        let mut queue = slot.lock();

        // Re-check under the domain lock: status and holder are a single
        // check-and-set.
        let activated = {
            let mut entry = self
                .campaigns
                .get_mut(campaign_id)
                .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.to_string()))?;
            entry.check(LifecycleAction::Activate)?;
            if let Err(holder) = queue.claim(campaign_id) {
                return Err(self.domain_busy(campaign_id, &campaign.domain, holder));
            }
            entry.apply(LifecycleAction::Activate, now)?;
            entry.flow_version = Some(flow.version);
            entry.clone()
        };

        for message in &messages {
            self.messages.insert(message.id, message.clone());
        }
        self.by_campaign.insert(campaign_id.to_string(), ids.clone());
        queue.extend(ids);
        let queue_size = queue.len();
        drop(queue);

        info!(
            campaign_id = %campaign_id,
            domain = %campaign.domain,
            flow_version = flow.version,
            leads = active.len(),
            messages = messages.len(),
            queue_size = queue_size,
            "campaign_scheduled"
        );

        self.sink.messages_created(&messages);
        self.sink.campaign_updated(&activated);

        Ok(ScheduleReport {
            campaign_id: campaign_id.to_string(),
            domain: campaign.domain,
            flow_version: flow.version,
            outcome: ScheduleOutcome::Scheduled,
            total_messages: messages.len(),
            steps,
        })
    }

    fn domain_busy(&self, campaign_id: &str, domain: &str, holder: String) -> EngineError {
        warn!(
            campaign_id = %campaign_id,
            domain = %domain,
            holder = %holder,
            "campaign_domain_busy"
        );
        EngineError::DomainBusy {
            domain: domain.to_string(),
            holder,
        }
    }
}

/// Step-major expansion: every lead for step 1, then every lead for step 2.
/// Follow-ups link to the same lead's previous step.
fn expand(
    campaign: &Campaign,
    steps: &[StepTime],
    leads: &[&String],
    now: DateTime<Utc>,
) -> Vec<ScheduledMessage> {
    let mut previous: HashMap<&str, MessageId> = HashMap::new();
    let mut messages = Vec::with_capacity(steps.len() * leads.len());

    for step in steps {
        for lead in leads {
            let id = MessageId::new();
            let parent = previous.insert(lead.as_str(), id);
            messages.push(ScheduledMessage {
                id,
                campaign_id: campaign.id.clone(),
                lead_id: lead.to_string(),
                domain: campaign.domain.clone(),
                step_index: step.step_index,
                alias: step.alias.clone(),
                scheduled_at: step.scheduled_at,
                status: MessageStatus::Queued,
                retry_count: 0,
                parent_message_id: parent,
                dispatched_at: None,
                sent_at: None,
                opened_at: None,
                last_error: None,
                created_at: now,
            });
        }
    }

    messages
}
