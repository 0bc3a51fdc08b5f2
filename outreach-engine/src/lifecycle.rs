//! Campaign records and the campaign state machine.
//!
//! ```text
//! draft ──activate──▶ running ◀──resume── paused
//!                        │ ──pause──────────▲
//!                        ▼
//!              stopped | completed   (terminal)
//! ```
//!
//! Only the engine holds `&mut Campaign`; every status change goes through
//! [`Campaign::apply`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    /// Running or paused: the campaign holds its domain.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle actions the engine can apply to a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Activate,
    Pause,
    Resume,
    Stop,
    Complete,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Complete => "complete",
        }
    }

    /// Target status, or `None` when the action is not allowed from `from`.
    pub fn target(&self, from: CampaignStatus) -> Option<CampaignStatus> {
        use CampaignStatus::*;
        match (self, from) {
            (Self::Activate, Draft) => Some(Running),
            (Self::Pause, Running) => Some(Paused),
            (Self::Resume, Paused) => Some(Running),
            (Self::Stop, Draft | Running | Paused) => Some(Stopped),
            (Self::Complete, Running | Paused) => Some(Completed),
            _ => None,
        }
    }
}

/// A campaign bound to one sending domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub domain: String,
    /// Version of the flow the campaign was scheduled with.
    pub flow_version: Option<u32>,
    pub status: CampaignStatus,
    /// Explicit start; `None` means start when scheduled.
    pub start_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a draft campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCampaign {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub domain: String,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn draft(id: String, new: NewCampaign, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: new.name,
            domain: new.domain,
            flow_version: None,
            status: CampaignStatus::Draft,
            start_at: new.start_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check an action without applying it.
    pub fn check(&self, action: LifecycleAction) -> Result<CampaignStatus> {
        action
            .target(self.status)
            .ok_or_else(|| EngineError::InvalidTransition {
                campaign_id: self.id.clone(),
                from: self.status,
                action: action.as_str(),
            })
    }

    /// Apply an action; the status is unchanged on rejection.
    pub fn apply(&mut self, action: LifecycleAction, now: DateTime<Utc>) -> Result<CampaignStatus> {
        let next = self.check(action)?;
        self.status = next;
        self.updated_at = now;
        Ok(next)
    }
}
