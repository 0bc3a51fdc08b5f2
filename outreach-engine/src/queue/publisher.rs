//! Async RabbitMQ publisher for released messages.
//!
//! The publisher keeps one connection and channel, reconnecting lazily when
//! the channel drops, and can be shared across tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::{SendJob, OUTBOUND_QUEUE};

/// Shared handle for publishing send jobs.
///
/// Cloning is cheap; every clone uses the same connection and channel, which
/// are opened on first publish and reopened after the broker drops them.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl Publisher {
    /// Create a publisher for `url`. No connection is made until the first
    /// publish.
    pub fn new(url: String) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Return a live channel, connecting and declaring the outbound queue
    /// first when there is none.
    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Another task may have reconnected while we waited for the lock.
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        ch.queue_declare(
            OUTBOUND_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare outbound queue")?;

        info!(outbound_queue = OUTBOUND_QUEUE, "rabbitmq_publisher_connected");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Publish a released message to the outbound_sends queue.
    pub async fn publish_send(&self, job: &SendJob) -> Result<()> {
        let channel = self.ensure_connected().await?;

        let body = serde_json::to_vec(job).context("Failed to serialize send job")?;

        channel
            .basic_publish(
                "",
                OUTBOUND_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(job.message_id.to_string().into()),
            )
            .await
            .context("Failed to publish to outbound queue")?
            .await
            .context("Failed to confirm publish")?;

        info!(
            queue = OUTBOUND_QUEUE,
            message_id = %job.message_id,
            campaign_id = %job.campaign_id,
            domain = %job.domain,
            step = job.step_index,
            "rabbitmq_send_published"
        );

        Ok(())
    }

    /// Close the channel and connection, logging rather than failing on
    /// errors. Used on dispatcher shutdown.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_is_lazy() {
        let publisher = Publisher::new("amqp://localhost:5672".to_string());
        let clone = publisher.clone();
        assert_eq!(Arc::strong_count(&clone.inner), 2);
    }
}
