//! Outreach Dispatcher - releases campaign mail one slot at a time per domain.
//!
//! Consumes campaign commands and delivery results from RabbitMQ, runs the
//! dispatch tick, and publishes released messages to the outbound_sends queue.

mod dispatcher;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use outreach::{Config, Engine, StoppedLeads};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("dispatcher_starting");

    let config = Config::from_env();
    let policy = config
        .sending_policy()
        .context("Invalid sending policy")?;
    let flows = config.flow_registry().context("Failed to load flow table")?;

    tracing::info!(
        amqp_url_set = !config.amqp_url.is_empty(),
        timezone = %config.policy.timezone,
        slot_minutes = config.policy.slot_every_minutes,
        daily_cap = policy.effective_daily_cap(),
        domains = flows.domains().count(),
        max_retries = config.max_retries,
        "config_loaded"
    );

    let leads = Arc::new(StoppedLeads::new());
    let engine = Engine::new(policy, flows, leads.clone()).with_max_retries(config.max_retries);

    dispatcher::run(config, Arc::new(engine), leads).await?;

    Ok(())
}
