//! The campaign engine: one explicitly constructed object that owns every
//! domain queue, campaign, and message record.
//!
//! State is partitioned by sending domain. Each domain's FIFO, holder and
//! throttle counters sit behind their own mutex, so different domains never
//! contend, while every mutation inside one domain is serialized:
//!
//! ```text
//! domains:   "punthelder-seo.nl"  ─▶ Mutex<DomainQueue>
//!            "punthelder-marketing.nl" ─▶ Mutex<DomainQueue>
//! campaigns: id ─▶ Campaign            (status written under its domain lock)
//! messages:  MessageId ─▶ ScheduledMessage
//! ```
//!
//! Lock order is always domain mutex first, then map entries. Map guards are
//! dropped before the record sink is called.
//!
//! The engine never reads the clock: every operation takes `now`.

mod control;
mod dispatch;
mod outcome;
mod schedule;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;
use crate::flow::{FlowRegistry, SenderIdentity};
use crate::leads::LeadStatus;
use crate::lifecycle::Campaign;
use crate::planning::{self, DryRunPlan};
use crate::policy::SendingPolicy;
use crate::queue::{DomainQueue, MessageId, MessageStatus, ScheduledMessage, SendJob};
use crate::records::{LogSink, RecordSink};

pub use control::StopReport;
pub use outcome::OutcomeReport;
pub use schedule::{ScheduleOutcome, ScheduleReport};

/// Default bound on manual retries of a failed message.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Snapshot of one domain's dispatch state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainStatus {
    pub domain: String,
    pub holder: Option<String>,
    pub queue_size: usize,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub is_busy: bool,
}

pub struct Engine {
    policy: SendingPolicy,
    flows: FlowRegistry,
    leads: Arc<dyn LeadStatus>,
    sink: Arc<dyn RecordSink>,
    max_retries: u32,
    domains: DashMap<String, Arc<Mutex<DomainQueue>>>,
    campaigns: DashMap<String, Campaign>,
    messages: DashMap<MessageId, ScheduledMessage>,
    /// Message ids per campaign in expansion order.
    by_campaign: DashMap<String, Vec<MessageId>>,
}

impl Engine {
    pub fn new(policy: SendingPolicy, flows: FlowRegistry, leads: Arc<dyn LeadStatus>) -> Self {
        Self {
            policy,
            flows,
            leads,
            sink: Arc::new(LogSink),
            max_retries: DEFAULT_MAX_RETRIES,
            domains: DashMap::new(),
            campaigns: DashMap::new(),
            messages: DashMap::new(),
            by_campaign: DashMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn policy(&self) -> &SendingPolicy {
        &self.policy
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    pub fn campaign(&self, campaign_id: &str) -> Option<Campaign> {
        self.campaigns.get(campaign_id).map(|c| c.clone())
    }

    pub fn message(&self, message_id: &MessageId) -> Option<ScheduledMessage> {
        self.messages.get(message_id).map(|m| m.clone())
    }

    /// All messages of a campaign, step-major.
    pub fn messages_for_campaign(&self, campaign_id: &str) -> Vec<ScheduledMessage> {
        let ids = self
            .by_campaign
            .get(campaign_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.message(id)).collect()
    }

    /// True once none of the campaign's messages is still queued.
    pub fn is_campaign_settled(&self, campaign_id: &str) -> bool {
        let ids = self
            .by_campaign
            .get(campaign_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter().all(|id| {
            self.messages
                .get(id)
                .map_or(true, |m| m.status != MessageStatus::Queued)
        })
    }

    /// Status of every configured domain plus any domain with bookkeeping.
    pub fn domain_status(&self) -> Vec<DomainStatus> {
        let mut domains: Vec<String> = self.flows.domains().map(str::to_string).collect();
        for entry in self.domains.iter() {
            if !domains.contains(entry.key()) {
                domains.push(entry.key().clone());
            }
        }

        domains
            .into_iter()
            .map(|domain| {
                let slot = self.domains.get(&domain).map(|e| Arc::clone(e.value()));
                match slot {
                    Some(slot) => {
                        let queue = slot.lock();
                        DomainStatus {
                            holder: queue.holder().map(str::to_string),
                            queue_size: queue.len(),
                            last_dispatch_at: queue.last_dispatch_at(),
                            is_busy: queue.holder().is_some(),
                            domain,
                        }
                    }
                    None => DomainStatus {
                        domain,
                        holder: None,
                        queue_size: 0,
                        last_dispatch_at: None,
                        is_busy: false,
                    },
                }
            })
            .collect()
    }

    /// Build the payload handed to the sender for a released message.
    pub fn send_job(&self, message: &ScheduledMessage) -> SendJob {
        let sender = match self.flows.get(&message.domain) {
            Some(flow) => flow.sender_for_step(message.step_index),
            None => SenderIdentity {
                from: format!("{}@{}", message.alias, message.domain),
                reply_to: format!("{}@{}", message.alias, message.domain),
            },
        };

        SendJob {
            message_id: message.id,
            campaign_id: message.campaign_id.clone(),
            lead_id: message.lead_id.clone(),
            domain: message.domain.clone(),
            step_index: message.step_index,
            alias: message.alias.clone(),
            sender,
            is_follow_up: message.is_follow_up(),
            parent_message_id: message.parent_message_id,
            retry_count: message.retry_count,
            scheduled_at: message.scheduled_at,
            dispatched_at: message.dispatched_at.unwrap_or(message.scheduled_at),
        }
    }

    /// Side-effect-free capacity preview using the live policy and flows.
    pub fn dry_run(
        &self,
        lead_count: usize,
        domains: &[String],
        start: DateTime<Utc>,
    ) -> Result<DryRunPlan> {
        planning::dry_run(&self.policy, &self.flows, lead_count, domains, start)
    }

    /// Shared handle to a domain's queue, created on first use.
    fn domain_slot(&self, domain: &str) -> Arc<Mutex<DomainQueue>> {
        Arc::clone(self.domains.entry(domain.to_string()).or_default().value())
    }

    fn existing_slot(&self, domain: &str) -> Option<Arc<Mutex<DomainQueue>>> {
        self.domains.get(domain).map(|e| Arc::clone(e.value()))
    }

    fn campaign_domain(&self, campaign_id: &str) -> Option<String> {
        self.campaigns.get(campaign_id).map(|c| c.domain.clone())
    }

    fn emit_messages(&self, updated: &[ScheduledMessage]) {
        for message in updated {
            self.sink.message_updated(message);
        }
    }
}
