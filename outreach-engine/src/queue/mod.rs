//! Queue module: message records, per-domain FIFOs, and the AMQP publisher.
//!
//! ## Architecture
//!
//! ```text
//! campaign_commands ─┐                        ┌─▶ outbound_sends ─▶ sender
//!                    ├─▶ Engine (DomainQueue) ┤
//! delivery_results ──┘                        └── tick (one per slot per domain)
//! ```

pub mod domain;
pub mod publisher;
pub mod types;

pub use domain::DomainQueue;
pub use publisher::Publisher;
pub use types::{
    DeliveryOutcome, DeliveryReport, MessageId, MessageStatus, ScheduledMessage, SendJob,
    COMMANDS_QUEUE, OUTBOUND_QUEUE, RESULTS_QUEUE,
};
