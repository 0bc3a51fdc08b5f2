//! Message records and the wire types around the dispatcher.
//!
//! This module defines:
//! - `ScheduledMessage`: one (lead, step) send owned by a campaign
//! - `outbound_sends` queue: `SendJob` handed to the transport worker
//! - `delivery_results` queue: `DeliveryReport` coming back from it

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::SenderIdentity;

/// Queue name for campaign control commands.
pub const COMMANDS_QUEUE: &str = "campaign_commands";

/// Queue name for delivery outcomes reported by the sender.
pub const RESULTS_QUEUE: &str = "delivery_results";

/// Queue name for messages released to the sender.
pub const OUTBOUND_QUEUE: &str = "outbound_sends";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Opened,
    Bounced,
    Failed,
    Canceled,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Opened => "opened",
            Self::Bounced => "bounced",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Allowed per-message transitions.
    ///
    /// `failed → queued` is the manual retry path; its bound is enforced by
    /// the engine, not here.
    pub fn can_become(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Queued, Sent | Bounced | Failed | Canceled)
                | (Sent, Opened | Bounced | Failed)
                | (Opened, Opened)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled send for a lead at a flow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: MessageId,
    pub campaign_id: String,
    pub lead_id: String,
    pub domain: String,
    pub step_index: u32,
    pub alias: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub retry_count: u32,
    /// Previous step's message for the same lead.
    pub parent_message_id: Option<MessageId>,
    /// Set when the dispatcher released the message to the sender.
    pub dispatched_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn is_follow_up(&self) -> bool {
        self.step_index > 1
    }

    /// Queued and not yet handed to the sender.
    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Queued && self.dispatched_at.is_none()
    }
}

/// Outcome the sender reports for a released message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Opened,
    Bounced { reason: String },
    Failed { reason: String },
}

impl DeliveryOutcome {
    pub fn status(&self) -> MessageStatus {
        match self {
            Self::Sent => MessageStatus::Sent,
            Self::Opened => MessageStatus::Opened,
            Self::Bounced { .. } => MessageStatus::Bounced,
            Self::Failed { .. } => MessageStatus::Failed,
        }
    }
}

/// Payload of the `delivery_results` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub message_id: MessageId,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

/// Payload of the `outbound_sends` queue: everything the rendering and
/// transport worker needs to send one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendJob {
    pub message_id: MessageId,
    pub campaign_id: String,
    pub lead_id: String,
    pub domain: String,
    pub step_index: u32,
    pub alias: String,
    pub sender: SenderIdentity,
    pub is_follow_up: bool,
    pub parent_message_id: Option<MessageId>,
    pub retry_count: u32,
    pub scheduled_at: DateTime<Utc>,
    pub dispatched_at: DateTime<Utc>,
}
