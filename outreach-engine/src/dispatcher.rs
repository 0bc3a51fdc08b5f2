//! RabbitMQ side of the dispatcher.
//!
//! One `select!` loop owns everything: shutdown signals, the dispatch tick,
//! campaign commands, and delivery results. Engine calls are synchronous and
//! short, so deliveries are handled inline and acknowledged in order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use outreach::{
    commands, CampaignCommand, CommandOutcome, Config, DeliveryOutcome, DeliveryReport, Engine,
    Publisher, StopReport, StoppedLeads, COMMANDS_QUEUE, RESULTS_QUEUE,
};

/// Run the dispatcher until SIGINT/SIGTERM or a consumer closes.
pub async fn run(config: Config, engine: Arc<Engine>, leads: Arc<StoppedLeads>) -> Result<()> {
    info!(url_length = config.amqp_url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(&config.amqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let channel = conn.create_channel().await.context("Failed to create channel")?;

    channel
        .basic_qos(config.consumer_prefetch, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = config.consumer_prefetch, "rabbitmq_qos_set");

    let mut commands_consumer = consume(&channel, COMMANDS_QUEUE, "outreach-commands").await?;
    let mut results_consumer = consume(&channel, RESULTS_QUEUE, "outreach-results").await?;

    let publisher = Publisher::new(config.amqp_url.clone());

    let mut ticker = tokio::time::interval(Duration::from_secs(config.dispatch_tick_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(tick_secs = config.dispatch_tick_secs, "dispatcher_ready");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("dispatcher_stopping");
                break;
            }
            _ = ticker.tick() => {
                dispatch(&engine, &publisher).await;
            }
            delivery = commands_consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => handle_command(&engine, &leads, &channel, delivery).await,
                    Some(Err(e)) => error!(queue = COMMANDS_QUEUE, error = %e, "rabbitmq_delivery_error"),
                    None => {
                        warn!(queue = COMMANDS_QUEUE, "rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
            delivery = results_consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => handle_result(&engine, &channel, delivery).await,
                    Some(Err(e)) => error!(queue = RESULTS_QUEUE, error = %e, "rabbitmq_delivery_error"),
                    None => {
                        warn!(queue = RESULTS_QUEUE, "rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    publisher.close().await;
    if let Err(e) = conn.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }

    info!("dispatcher_shutdown_complete");
    Ok(())
}

/// Declare a durable queue and start consuming it.
async fn consume(channel: &Channel, queue: &str, tag: &str) -> Result<Consumer> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("Failed to declare queue {queue}"))?;

    let consumer = channel
        .basic_consume(queue, tag, BasicConsumeOptions::default(), FieldTable::default())
        .await
        .with_context(|| format!("Failed to start consumer on {queue}"))?;

    info!(queue = queue, "rabbitmq_consumer_started");
    Ok(consumer)
}

/// Release every due message and hand it to the sender. A message that cannot
/// be published is reported back as failed so it can be retried.
async fn dispatch(engine: &Engine, publisher: &Publisher) {
    let released = engine.dispatch_tick(Utc::now());
    for message in released {
        let job = engine.send_job(&message);
        if let Err(e) = publisher.publish_send(&job).await {
            error!(
                message_id = %message.id,
                domain = %message.domain,
                error = %e,
                "send_publish_failed"
            );
            let outcome = DeliveryOutcome::Failed {
                reason: format!("publish failed: {e}"),
            };
            if let Err(e) = engine.report_outcome(&message.id, outcome, Utc::now()) {
                warn!(message_id = %message.id, error = %e, "send_failure_not_recorded");
            }
        }
    }
}

async fn handle_command(
    engine: &Engine,
    leads: &StoppedLeads,
    channel: &Channel,
    delivery: Delivery,
) {
    let delivery_tag = delivery.delivery_tag;
    let command: CampaignCommand = match serde_json::from_slice(&delivery.data) {
        Ok(command) => command,
        Err(e) => {
            error!(queue = COMMANDS_QUEUE, error = %e, "campaign_command_parse_failed");
            reject(channel, delivery_tag).await;
            return;
        }
    };

    let action = command.action();
    match commands::apply(engine, leads, command, Utc::now()) {
        Ok(outcome) => {
            match serde_json::to_string(&outcome) {
                Ok(result) => info!(action = action, result = %result, "campaign_command_applied"),
                Err(_) => info!(action = action, "campaign_command_applied"),
            }
            match &outcome {
                CommandOutcome::Stopped(StopReport { campaign_id, .. })
                | CommandOutcome::Completed { campaign_id, .. } => {
                    engine.forget_campaign(campaign_id);
                }
                _ => {}
            }
        }
        // Rejections are final; redelivery would be rejected the same way.
        Err(e) => warn!(action = action, error = %e, "campaign_command_rejected"),
    }

    ack(channel, delivery_tag).await;
}

async fn handle_result(engine: &Engine, channel: &Channel, delivery: Delivery) {
    let delivery_tag = delivery.delivery_tag;
    let report: DeliveryReport = match serde_json::from_slice(&delivery.data) {
        Ok(report) => report,
        Err(e) => {
            error!(queue = RESULTS_QUEUE, error = %e, "delivery_result_parse_failed");
            reject(channel, delivery_tag).await;
            return;
        }
    };

    let now = Utc::now();
    match engine.report_outcome(&report.message_id, report.outcome, now) {
        Ok(outcome) if outcome.campaign_settled => {
            let message = outcome.message;
            match engine.complete_campaign(&message.campaign_id, &message.domain, now) {
                Ok(true) => info!(campaign_id = %message.campaign_id, "campaign_settled"),
                Ok(false) => {}
                Err(e) => warn!(
                    campaign_id = %message.campaign_id,
                    error = %e,
                    "campaign_complete_failed"
                ),
            }
            // Also covers a stopped campaign whose last in-flight send just
            // reported back.
            engine.forget_campaign(&message.campaign_id);
        }
        Ok(_) => {}
        Err(e) => warn!(message_id = %report.message_id, error = %e, "delivery_result_rejected"),
    }

    ack(channel, delivery_tag).await;
}

async fn ack(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_ack(delivery_tag, BasicAckOptions::default())
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed");
    }
}

/// Drop a malformed delivery without requeueing it.
async fn reject(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue: false,
                ..Default::default()
            },
        )
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
