//! Sender outcomes and manual retry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::Engine;
use crate::error::{EngineError, Result};
use crate::queue::{DeliveryOutcome, MessageId, MessageStatus, ScheduledMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeReport {
    pub message: ScheduledMessage,
    /// No message of the campaign is still queued; the caller may complete it.
    pub campaign_settled: bool,
}

impl Engine {
    /// Record what the sender did with a message.
    pub fn report_outcome(
        &self,
        message_id: &MessageId,
        outcome: DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<OutcomeReport> {
        let domain = self
            .messages
            .get(message_id)
            .map(|m| m.domain.clone())
            .ok_or(EngineError::MessageNotFound(*message_id))?;
        let slot = self.domain_slot(&domain);
        let mut queue = slot.lock();

        let (message, was_pending) = {
            let mut entry = self
                .messages
                .get_mut(message_id)
                .ok_or(EngineError::MessageNotFound(*message_id))?;
            let next = outcome.status();
            if !entry.status.can_become(next) {
                return Err(EngineError::InvalidMessageTransition {
                    message_id: *message_id,
                    from: entry.status,
                    to: next,
                });
            }

            let was_pending = entry.is_pending();
            entry.status = next;
            match &outcome {
                DeliveryOutcome::Sent => entry.sent_at = Some(now),
                DeliveryOutcome::Opened => {
                    entry.opened_at.get_or_insert(now);
                }
                DeliveryOutcome::Bounced { reason } | DeliveryOutcome::Failed { reason } => {
                    entry.last_error = Some(reason.clone());
                }
            }
            (entry.clone(), was_pending)
        };

        if was_pending {
            queue.retain(|id| id != message_id);
        }
        drop(queue);

        let campaign_settled = self.is_campaign_settled(&message.campaign_id);
        match &outcome {
            DeliveryOutcome::Bounced { reason } | DeliveryOutcome::Failed { reason } => warn!(
                message_id = %message_id,
                campaign_id = %message.campaign_id,
                status = %message.status,
                reason = %reason,
                "message_outcome"
            ),
            _ => info!(
                message_id = %message_id,
                campaign_id = %message.campaign_id,
                status = %message.status,
                settled = campaign_settled,
                "message_outcome"
            ),
        }
        self.sink.message_updated(&message);

        Ok(OutcomeReport {
            message,
            campaign_settled,
        })
    }

    /// Put a failed message back in its domain queue at the next valid slot.
    ///
    /// Allowed while the campaign still holds its domain and the message has
    /// been retried fewer than `max_retries` times.
    pub fn retry_message(&self, message_id: &MessageId, now: DateTime<Utc>) -> Result<ScheduledMessage> {
        let (domain, campaign_id) = self
            .messages
            .get(message_id)
            .map(|m| (m.domain.clone(), m.campaign_id.clone()))
            .ok_or(EngineError::MessageNotFound(*message_id))?;
        let slot = self.domain_slot(&domain);
        let mut queue = slot.lock();

        let campaign_status = self
            .campaigns
            .get(&campaign_id)
            .map(|c| c.status)
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.clone()))?;
        if !campaign_status.is_active() {
            return Err(EngineError::InvalidTransition {
                campaign_id,
                from: campaign_status,
                action: "retry",
            });
        }

        let scheduled_at = self.policy.next_valid_slot(now);
        let message = {
            let mut entry = self
                .messages
                .get_mut(message_id)
                .ok_or(EngineError::MessageNotFound(*message_id))?;
            if !entry.status.can_become(MessageStatus::Queued) {
                return Err(EngineError::InvalidMessageTransition {
                    message_id: *message_id,
                    from: entry.status,
                    to: MessageStatus::Queued,
                });
            }
            if entry.retry_count >= self.max_retries {
                return Err(EngineError::RetryExhausted {
                    message_id: *message_id,
                    attempts: entry.retry_count,
                });
            }

            entry.status = MessageStatus::Queued;
            entry.retry_count += 1;
            entry.scheduled_at = scheduled_at;
            entry.dispatched_at = None;
            entry.sent_at = None;
            entry.clone()
        };

        // Keep the FIFO ordered by due time so the retry does not wait behind
        // later steps.
        queue.insert_before(*message_id, |id| {
            self.messages
                .get(id)
                .is_some_and(|m| m.scheduled_at > scheduled_at)
        });
        drop(queue);

        info!(
            message_id = %message_id,
            campaign_id = %message.campaign_id,
            retry_count = message.retry_count,
            scheduled_at = %scheduled_at,
            "message_retry_queued"
        );
        self.sink.message_updated(&message);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn failed() -> DeliveryOutcome {
        DeliveryOutcome::Failed {
            reason: "smtp 451".to_string(),
        }
    }

    #[test]
    fn test_sent_then_opened() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();
        let released = engine.get_ready_messages(DOMAIN, monday_open());
        let message_id = released[0].id;

        let sent_at = at(2025, 9, 29, 8, 1);
        let report = engine
            .report_outcome(&message_id, DeliveryOutcome::Sent, sent_at)
            .unwrap();
        assert_eq!(report.message.status, MessageStatus::Sent);
        assert_eq!(report.message.sent_at, Some(sent_at));
        assert!(!report.campaign_settled);

        let first_open = at(2025, 9, 29, 9, 0);
        engine
            .report_outcome(&message_id, DeliveryOutcome::Opened, first_open)
            .unwrap();
        let again = engine
            .report_outcome(&message_id, DeliveryOutcome::Opened, at(2025, 9, 29, 10, 0))
            .unwrap();
        assert_eq!(again.message.opened_at, Some(first_open));
    }

    #[test]
    fn test_invalid_outcome_transition() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();
        let message_id = engine.messages_for_campaign(&id)[0].id;

        let err = engine
            .report_outcome(&message_id, DeliveryOutcome::Opened, monday_open())
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidMessageTransition {
                message_id,
                from: MessageStatus::Queued,
                to: MessageStatus::Opened,
            }
        );
    }

    #[test]
    fn test_unknown_message() {
        let engine = engine();
        let missing = MessageId::new();
        assert_eq!(
            engine
                .report_outcome(&missing, DeliveryOutcome::Sent, monday_open())
                .unwrap_err(),
            EngineError::MessageNotFound(missing)
        );
    }

    #[test]
    fn test_settled_after_last_outcome() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();

        let messages = engine.messages_for_campaign(&id);
        let mut last = None;
        for message in &messages {
            last = Some(
                engine
                    .report_outcome(&message.id, DeliveryOutcome::Sent, monday_open())
                    .unwrap(),
            );
        }
        assert!(last.unwrap().campaign_settled);
        assert!(engine.is_campaign_settled(&id));
        // Settled outcomes left the FIFO.
        assert_eq!(
            engine
                .domain_status()
                .iter()
                .find(|s| s.domain == DOMAIN)
                .unwrap()
                .queue_size,
            0
        );
    }

    #[test]
    fn test_retry_is_bounded() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();
        let message_id = engine.get_ready_messages(DOMAIN, monday_open())[0].id;

        for attempt in 1..=2 {
            engine
                .report_outcome(&message_id, failed(), monday_open())
                .unwrap();
            let retried = engine
                .retry_message(&message_id, at(2025, 9, 29, 9, 5))
                .unwrap();
            assert_eq!(retried.retry_count, attempt);
            assert_eq!(retried.status, MessageStatus::Queued);
            assert_eq!(retried.scheduled_at, at(2025, 9, 29, 9, 20));
            assert!(retried.dispatched_at.is_none());
        }

        engine
            .report_outcome(&message_id, failed(), monday_open())
            .unwrap();
        let err = engine
            .retry_message(&message_id, at(2025, 9, 29, 9, 5))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::RetryExhausted {
                message_id,
                attempts: 2
            }
        );
        assert_eq!(engine.message(&message_id).unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn test_retry_requires_failed_message() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();
        let message_id = engine.messages_for_campaign(&id)[0].id;

        assert!(matches!(
            engine.retry_message(&message_id, monday_open()),
            Err(EngineError::InvalidMessageTransition { from: MessageStatus::Queued, .. })
        ));
    }

    #[test]
    fn test_retry_rejected_after_stop() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();
        let message_id = engine.get_ready_messages(DOMAIN, monday_open())[0].id;
        engine
            .report_outcome(&message_id, failed(), monday_open())
            .unwrap();
        engine.stop(&id, monday_open()).unwrap();

        assert!(matches!(
            engine.retry_message(&message_id, monday_open()),
            Err(EngineError::InvalidTransition { action: "retry", .. })
        ));
    }

    #[test]
    fn test_retry_is_released_ahead_of_later_steps() {
        let engine = engine();
        let id = draft(&engine, "c-1", DOMAIN);
        engine.schedule_campaign(&id, &leads(1), monday_open()).unwrap();
        let message_id = engine.get_ready_messages(DOMAIN, monday_open())[0].id;
        engine
            .report_outcome(&message_id, failed(), at(2025, 9, 29, 8, 1))
            .unwrap();
        engine
            .retry_message(&message_id, at(2025, 9, 29, 8, 2))
            .unwrap();

        let released = engine.get_ready_messages(DOMAIN, at(2025, 9, 29, 8, 20));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, message_id);
        assert_eq!(released[0].retry_count, 1);
    }
}
