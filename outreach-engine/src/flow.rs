//! Per-domain campaign flows and the schedule calculator.
//!
//! A flow is the fixed sequence of sends a domain runs for every lead: which
//! alias sends step N and how many business days after campaign start it is
//! due. Flows are data, loaded once at start-up from the built-in table or a
//! JSON file with the same shape.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::policy::SendingPolicy;

/// One send in a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStep {
    /// 1-based position in the flow.
    pub index: u32,
    /// Sender alias, e.g. `christian`.
    pub alias: String,
    /// Valid sending days after campaign start.
    pub business_day_offset: u32,
}

/// The ordered steps assigned to one sending domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignFlow {
    pub version: u32,
    pub domain: String,
    pub steps: Vec<FlowStep>,
}

/// From / Reply-To pair for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub from: String,
    pub reply_to: String,
}

/// One computed step instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTime {
    pub step_index: u32,
    pub alias: String,
    pub scheduled_at: DateTime<Utc>,
}

/// UI-facing description of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSummary {
    pub domain: String,
    pub version: u32,
    pub total_mails: usize,
    pub aliases: Vec<String>,
    pub duration_business_days: u32,
    pub steps: Vec<FlowStep>,
}

impl CampaignFlow {
    pub fn step(&self, index: u32) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.index == index)
    }

    /// Alias for a step, falling back to the flow's first alias.
    pub fn alias_for_step(&self, index: u32) -> &str {
        self.step(index)
            .or_else(|| self.steps.first())
            .map(|s| s.alias.as_str())
            .unwrap_or_default()
    }

    /// Later aliases send from their own mailbox but replies go to the first
    /// alias.
    pub fn sender_for_step(&self, index: u32) -> SenderIdentity {
        let first = self.steps.first().map(|s| s.alias.as_str()).unwrap_or_default();
        SenderIdentity {
            from: format!("{}@{}", self.alias_for_step(index), self.domain),
            reply_to: format!("{}@{}", first, self.domain),
        }
    }

    pub fn summary(&self) -> FlowSummary {
        let aliases: BTreeSet<String> = self.steps.iter().map(|s| s.alias.clone()).collect();
        FlowSummary {
            domain: self.domain.clone(),
            version: self.version,
            total_mails: self.steps.len(),
            aliases: aliases.into_iter().collect(),
            duration_business_days: self
                .steps
                .iter()
                .map(|s| s.business_day_offset)
                .max()
                .unwrap_or(0),
            steps: self.steps.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| EngineError::InvalidFlow {
            domain: self.domain.clone(),
            reason: reason.to_string(),
        };

        if self.steps.is_empty() {
            return Err(invalid("flow has no steps"));
        }
        for (position, step) in self.steps.iter().enumerate() {
            if step.index as usize != position + 1 {
                return Err(invalid("step indices must be 1-based and consecutive"));
            }
            if step.alias.trim().is_empty() {
                return Err(invalid("step alias is empty"));
            }
        }
        if self
            .steps
            .windows(2)
            .any(|w| w[1].business_day_offset <= w[0].business_day_offset)
        {
            return Err(invalid("business-day offsets must strictly increase"));
        }
        Ok(())
    }
}

/// Domain → flow table.
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, CampaignFlow>,
}

impl FlowRegistry {
    /// Build a registry, validating every flow.
    pub fn new(flows: impl IntoIterator<Item = CampaignFlow>) -> Result<Self> {
        let mut table = BTreeMap::new();
        for flow in flows {
            flow.validate()?;
            if table.insert(flow.domain.clone(), flow.clone()).is_some() {
                return Err(EngineError::InvalidFlow {
                    domain: flow.domain,
                    reason: "domain listed twice".to_string(),
                });
            }
        }
        Ok(Self { flows: table })
    }

    /// The four production domains: two initial mails from `christian`, two
    /// follow-ups from `victor`, three business days apart.
    pub fn builtin() -> Self {
        let domains = [
            ("punthelder-vindbaarheid.nl", 1),
            ("punthelder-marketing.nl", 2),
            ("punthelder-seo.nl", 3),
            ("punthelder-zoekmachine.nl", 4),
        ];
        let flows = domains
            .into_iter()
            .map(|(domain, version)| CampaignFlow {
                version,
                domain: domain.to_string(),
                steps: [("christian", 0), ("christian", 3), ("victor", 6), ("victor", 9)]
                    .into_iter()
                    .enumerate()
                    .map(|(i, (alias, offset))| FlowStep {
                        index: i as u32 + 1,
                        alias: alias.to_string(),
                        business_day_offset: offset,
                    })
                    .collect(),
            })
            .map(|flow| (flow.domain.clone(), flow))
            .collect();
        Self { flows }
    }

    /// Parse a JSON array of flows.
    pub fn from_json(raw: &str) -> Result<Self> {
        let flows: Vec<CampaignFlow> =
            serde_json::from_str(raw).map_err(|e| EngineError::FlowLoad(e.to_string()))?;
        Self::new(flows)
    }

    /// Read the flow table from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::FlowLoad(format!("{}: {e}", path.display())))?;
        let registry = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            domains = registry.flows.len(),
            "flow_table_loaded"
        );
        Ok(registry)
    }

    pub fn get(&self, domain: &str) -> Option<&CampaignFlow> {
        self.flows.get(domain)
    }

    /// Lookup that treats a missing flow as a configuration error.
    pub fn require(&self, domain: &str) -> Result<&CampaignFlow> {
        self.get(domain).ok_or_else(|| EngineError::DomainNotConfigured {
            domain: domain.to_string(),
        })
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    pub fn summaries(&self) -> Vec<FlowSummary> {
        self.flows.values().map(CampaignFlow::summary).collect()
    }
}

/// One canonical instant per flow step.
///
/// Each step walks forward from the start date one calendar day at a time,
/// counting only valid days until its offset is reached, keeps the start's
/// time of day, and snaps the result with [`SendingPolicy::next_valid_slot`].
pub fn calculate_schedule(
    policy: &SendingPolicy,
    start: DateTime<Utc>,
    flow: &CampaignFlow,
) -> Vec<StepTime> {
    let tz = policy.timezone();
    let local_start = start.with_timezone(&tz);
    let start_date = local_start.date_naive();
    let start_time = local_start.time();

    flow.steps
        .iter()
        .map(|step| {
            let mut date = start_date;
            let mut counted = 0;
            while counted < step.business_day_offset {
                date = date.succ_opt().unwrap_or(date);
                if policy.is_valid_day(date) {
                    counted += 1;
                }
            }

            let target = date
                .and_time(start_time)
                .and_local_timezone(tz)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| policy.window_open(date));

            StepTime {
                step_index: step.index,
                alias: step.alias.clone(),
                scheduled_at: policy.next_valid_slot(target),
            }
        })
        .collect()
}
