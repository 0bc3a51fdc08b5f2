//! Dry-run capacity planner.
//!
//! Simulates scheduling plus dispatch without touching any engine state: each
//! candidate domain gets its share of the leads and is played forward slot by
//! slot with the same rounding, weekend skipping, throttle and daily cap the
//! live path uses.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::flow::{calculate_schedule, CampaignFlow, FlowRegistry};
use crate::policy::SendingPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunDay {
    pub date: NaiveDate,
    pub planned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DryRunPlan {
    pub by_day: Vec<DryRunDay>,
    pub total_planned: usize,
    pub last_send_at: Option<DateTime<Utc>>,
}

/// Preview how `lead_count` leads spread over `domains` would be sent,
/// starting at `start`.
///
/// Repeated domains count once, since they share one queue and one cap.
/// Leads are split in order; the first `lead_count % n` distinct domains take
/// one extra.
pub fn dry_run(
    policy: &SendingPolicy,
    flows: &FlowRegistry,
    lead_count: usize,
    domains: &[String],
    start: DateTime<Utc>,
) -> Result<DryRunPlan> {
    if lead_count == 0 || domains.is_empty() {
        return Ok(DryRunPlan::default());
    }

    let mut seen = HashSet::new();
    let flows = domains
        .iter()
        .filter(|domain| seen.insert(domain.as_str()))
        .map(|domain| flows.require(domain))
        .collect::<Result<Vec<_>>>()?;

    let base = lead_count / flows.len();
    let extra = lead_count % flows.len();

    let mut by_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    let mut last_send_at = None;
    for (i, flow) in flows.iter().enumerate() {
        let leads = base + usize::from(i < extra);
        for send in simulate_domain(policy, flow, leads, start) {
            *by_day.entry(policy.local_date(send)).or_default() += 1;
            last_send_at = last_send_at.max(Some(send));
        }
    }

    let total_planned = by_day.values().sum();
    Ok(DryRunPlan {
        by_day: by_day
            .into_iter()
            .map(|(date, planned)| DryRunDay { date, planned })
            .collect(),
        total_planned,
        last_send_at,
    })
}

/// Release instants for one domain, in send order.
fn simulate_domain(
    policy: &SendingPolicy,
    flow: &CampaignFlow,
    leads: usize,
    start: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let steps = calculate_schedule(policy, start, flow);
    let cap = policy.effective_daily_cap() as usize;
    let interval = policy.slot_interval();

    let mut used: HashMap<NaiveDate, usize> = HashMap::new();
    let mut previous: Option<DateTime<Utc>> = None;
    let mut sends = Vec::with_capacity(steps.len() * leads);

    for step in &steps {
        for _ in 0..leads {
            let earliest = match previous {
                Some(prev) => step.scheduled_at.max(prev + interval),
                None => step.scheduled_at,
            };
            let mut at = policy.next_valid_slot(earliest);
            let mut date = policy.local_date(at);
            while used.get(&date).copied().unwrap_or(0) >= cap {
                date = policy.next_valid_day_after(date);
                at = policy.window_open(date);
            }

            *used.entry(date).or_default() += 1;
            previous = Some(at);
            sends.push(at);
        }
    }

    sends
}
