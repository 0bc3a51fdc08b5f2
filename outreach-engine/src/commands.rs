//! Campaign commands delivered over the `campaign_commands` queue.
//!
//! ```json
//! {"action": "schedule", "campaign_id": "c-1", "lead_ids": ["lead-1", "lead-2"]}
//! {"action": "stop_lead", "lead_id": "lead-2"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, ScheduleReport, StopReport};
use crate::error::Result;
use crate::leads::StoppedLeads;
use crate::lifecycle::{Campaign, NewCampaign};
use crate::queue::{MessageId, ScheduledMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CampaignCommand {
    Create(NewCampaign),
    Schedule {
        campaign_id: String,
        lead_ids: Vec<String>,
    },
    Pause {
        campaign_id: String,
    },
    Resume {
        campaign_id: String,
    },
    Stop {
        campaign_id: String,
    },
    Complete {
        campaign_id: String,
    },
    Retry {
        message_id: MessageId,
    },
    StopLead {
        lead_id: String,
    },
}

impl CampaignCommand {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Schedule { .. } => "schedule",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Stop { .. } => "stop",
            Self::Complete { .. } => "complete",
            Self::Retry { .. } => "retry",
            Self::StopLead { .. } => "stop_lead",
        }
    }
}

/// What a command did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    Created(Campaign),
    Scheduled(ScheduleReport),
    Updated(Campaign),
    Stopped(StopReport),
    Completed { campaign_id: String, released: bool },
    Retried(ScheduledMessage),
    LeadStopped { lead_id: String, canceled: usize },
}

/// Apply one command to the engine.
///
/// `stop_lead` marks the lead stopped in `leads` so later schedules skip it,
/// then cancels whatever is still pending for it.
pub fn apply(
    engine: &Engine,
    leads: &StoppedLeads,
    command: CampaignCommand,
    now: DateTime<Utc>,
) -> Result<CommandOutcome> {
    let outcome = match command {
        CampaignCommand::Create(new) => CommandOutcome::Created(engine.create_campaign(new, now)?),
        CampaignCommand::Schedule {
            campaign_id,
            lead_ids,
        } => CommandOutcome::Scheduled(engine.schedule_campaign(&campaign_id, &lead_ids, now)?),
        CampaignCommand::Pause { campaign_id } => {
            CommandOutcome::Updated(engine.pause(&campaign_id, now)?)
        }
        CampaignCommand::Resume { campaign_id } => {
            CommandOutcome::Updated(engine.resume(&campaign_id, now)?)
        }
        CampaignCommand::Stop { campaign_id } => {
            CommandOutcome::Stopped(engine.stop(&campaign_id, now)?)
        }
        CampaignCommand::Complete { campaign_id } => {
            let released = match engine.campaign(&campaign_id) {
                Some(campaign) => engine.complete_campaign(&campaign_id, &campaign.domain, now)?,
                None => false,
            };
            CommandOutcome::Completed {
                campaign_id,
                released,
            }
        }
        CampaignCommand::Retry { message_id } => {
            CommandOutcome::Retried(engine.retry_message(&message_id, now)?)
        }
        CampaignCommand::StopLead { lead_id } => {
            leads.stop(&lead_id);
            let canceled = engine.cancel_lead(&lead_id, now);
            CommandOutcome::LeadStopped { lead_id, canceled }
        }
    };
    Ok(outcome)
}
