//! Outreach - campaign scheduling and per-domain sending policy engine.
//!
//! This library backs two binaries:
//! - `outreach-dispatcher`: applies campaign commands, releases due messages
//!   to the sender, and records delivery outcomes
//! - `outreach-plan`: dry-run capacity preview
//!
//! ## Architecture
//!
//! ```text
//! campaign (domain, leads) → Flow Registry → Schedule Calculator
//!     → lead × step expansion → domain FIFO (holder = campaign)
//!     → dispatch tick (grace / hours / cap / throttle) → outbound_sends
//!     → delivery_results → message status → complete_campaign
//! ```

pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod leads;
pub mod lifecycle;
pub mod planning;
pub mod policy;
pub mod queue;
pub mod records;

// Re-export commonly used types
pub use commands::{CampaignCommand, CommandOutcome};
pub use config::Config;
pub use engine::{
    DomainStatus, Engine, OutcomeReport, ScheduleOutcome, ScheduleReport, StopReport,
};
pub use error::{EngineError, Result};
pub use flow::{calculate_schedule, CampaignFlow, FlowRegistry, FlowStep, StepTime};
pub use leads::{LeadStatus, StoppedLeads};
pub use lifecycle::{Campaign, CampaignStatus, NewCampaign};
pub use planning::{DryRunDay, DryRunPlan};
pub use policy::{PolicySettings, SendingPolicy};
pub use queue::{
    DeliveryOutcome, DeliveryReport, MessageId, MessageStatus, Publisher, ScheduledMessage,
    SendJob, COMMANDS_QUEUE, OUTBOUND_QUEUE, RESULTS_QUEUE,
};
pub use records::{LogSink, RecordSink};
