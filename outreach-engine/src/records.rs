//! Record emission: the engine reports every committed create/update so a
//! storage collaborator can persist it. The engine itself never persists.

use tracing::debug;

use crate::lifecycle::Campaign;
use crate::queue::ScheduledMessage;

pub trait RecordSink: Send + Sync {
    fn messages_created(&self, messages: &[ScheduledMessage]);
    fn message_updated(&self, message: &ScheduledMessage);
    fn campaign_updated(&self, campaign: &Campaign);
}

/// Sink that only logs. Used when no storage is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl RecordSink for LogSink {
    fn messages_created(&self, messages: &[ScheduledMessage]) {
        debug!(count = messages.len(), "records_messages_created");
    }

    fn message_updated(&self, message: &ScheduledMessage) {
        debug!(
            message_id = %message.id,
            status = %message.status,
            scheduled_at = %message.scheduled_at,
            "records_message_updated"
        );
    }

    fn campaign_updated(&self, campaign: &Campaign) {
        debug!(
            campaign_id = %campaign.id,
            status = %campaign.status,
            "records_campaign_updated"
        );
    }
}
