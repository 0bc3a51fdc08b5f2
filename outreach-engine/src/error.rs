//! Typed failures returned by the engine.
//!
//! Every rejection is an explicit variant so callers have to decide what to do
//! with each kind. An empty audience is not an error; see
//! [`ScheduleOutcome::EmptyAudience`](crate::engine::ScheduleOutcome).

use thiserror::Error;

use crate::lifecycle::CampaignStatus;
use crate::queue::{MessageId, MessageStatus};

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No flow exists for the target domain.
    #[error("no flow configured for domain {domain}")]
    DomainNotConfigured { domain: String },

    /// The domain is held by another active campaign.
    #[error("domain {domain} is busy with campaign {holder}")]
    DomainBusy { domain: String, holder: String },

    /// A lifecycle action was requested from a status that forbids it.
    #[error("cannot {action} campaign {campaign_id} while it is {from}")]
    InvalidTransition {
        campaign_id: String,
        from: CampaignStatus,
        action: &'static str,
    },

    /// A delivery outcome does not fit the message's current status.
    #[error("message {message_id} cannot move from {from} to {to}")]
    InvalidMessageTransition {
        message_id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// Manual retry requested beyond the configured bound.
    #[error("message {message_id} already retried {attempts} times")]
    RetryExhausted { message_id: MessageId, attempts: u32 },

    #[error("campaign {0} already exists")]
    CampaignExists(String),

    #[error("campaign {0} not found")]
    CampaignNotFound(String),

    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    #[error("invalid sending policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid flow for {domain}: {reason}")]
    InvalidFlow { domain: String, reason: String },

    #[error("failed to load flow table: {0}")]
    FlowLoad(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_busy_message_names_holder() {
        let err = EngineError::DomainBusy {
            domain: "punthelder-seo.nl".to_string(),
            holder: "c-1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "domain punthelder-seo.nl is busy with campaign c-1"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = EngineError::InvalidTransition {
            campaign_id: "c-9".to_string(),
            from: CampaignStatus::Stopped,
            action: "resume",
        };
        assert_eq!(err.to_string(), "cannot resume campaign c-9 while it is stopped");
    }
}
