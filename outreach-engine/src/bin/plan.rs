//! Outreach Plan - dry-run capacity preview.
//!
//! Prints, as JSON, how many messages a campaign of `--leads` leads would
//! send per day on the given domains under the configured sending policy.
//! Nothing is scheduled and no broker is contacted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use outreach::{planning, Config};

/// Preview per-day send volume for a campaign
#[derive(Parser, Debug)]
#[command(name = "outreach-plan")]
#[command(about = "Dry-run capacity preview for campaign sending", long_about = None)]
#[command(version)]
struct Cli {
    /// Number of leads in the audience
    #[arg(short, long, default_value_t = 0)]
    leads: usize,

    /// Sending domain; repeat to split leads over several domains.
    /// Defaults to every configured domain.
    #[arg(short, long = "domain")]
    domains: Vec<String>,

    /// Campaign start (RFC 3339); defaults to now
    #[arg(short, long)]
    start: Option<DateTime<Utc>>,

    /// Print the configured flows instead of a plan
    #[arg(long)]
    flows: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let flows = config.flow_registry().context("Failed to load flow table")?;

    if cli.flows {
        let summaries = flows.summaries();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    let policy = config
        .sending_policy()
        .context("Invalid sending policy")?;
    let domains = if cli.domains.is_empty() {
        flows.domains().map(str::to_string).collect()
    } else {
        cli.domains
    };
    let start = cli.start.unwrap_or_else(Utc::now);

    tracing::info!(
        leads = cli.leads,
        domains = domains.len(),
        start = %start,
        "dry_run_started"
    );

    let plan = planning::dry_run(&policy, &flows, cli.leads, &domains, start)
        .context("Dry run failed")?;
    println!("{}", serde_json::to_string_pretty(&plan)?);

    Ok(())
}
