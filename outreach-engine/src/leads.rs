//! Lead status lookup used to filter audiences before expansion.

use dashmap::DashSet;

/// Answers whether a lead has been stopped (unsubscribed, replied, or
/// manually halted). Implemented by the lead store.
pub trait LeadStatus: Send + Sync {
    fn is_stopped(&self, lead_id: &str) -> bool;
}

/// In-memory set of stopped leads, fed by `stop_lead` commands.
#[derive(Debug, Default)]
pub struct StoppedLeads {
    stopped: DashSet<String>,
}

impl StoppedLeads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a lead stopped. Returns false if it already was.
    pub fn stop(&self, lead_id: &str) -> bool {
        self.stopped.insert(lead_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.stopped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for StoppedLeads {
    fn from_iter<I: IntoIterator<Item = S>>(ids: I) -> Self {
        Self {
            stopped: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl LeadStatus for StoppedLeads {
    fn is_stopped(&self, lead_id: &str) -> bool {
        self.stopped.contains(lead_id)
    }
}
