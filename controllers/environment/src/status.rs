//! Status Reporter
//!
//! Writes `status` after every reconcile attempt and emits the matching
//! transition metrics. Writes are ordered by `lastReconciledAt`: a status
//! older than the stored one is dropped, so a late or repeated delivery can
//! never move an environment backwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crds::{DevelopmentEnvironment, DevelopmentEnvironmentStatus};
use resource_store::ResourceStore;
use tracing::{debug, info};

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::bounded;
use crate::reconciler::lifecycle::transition_label;

/// Outcome of a status report
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Written(Box<DevelopmentEnvironment>),
    /// The stored status is newer than the one reported
    Stale,
    /// The stored status is already identical
    Unchanged,
    /// The environment no longer exists
    Gone,
}

pub struct StatusReporter {
    store: Arc<dyn ResourceStore>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn ResourceStore>, metrics: Arc<Metrics>, timeout: Duration) -> Self {
        Self { store, metrics, timeout }
    }

    /// Write `status` for environment `name`
    pub async fn report(&self, name: &str, status: DevelopmentEnvironmentStatus) -> Result<ReportOutcome, ControllerError> {
        let Some(current) = bounded(self.timeout, self.store.get_environment(name)).await? else {
            return Ok(ReportOutcome::Gone);
        };
        let stored = current.status.as_ref();

        if let (Some(stored_at), Some(new_at)) = (
            stored.and_then(|s| s.last_reconciled_at),
            status.last_reconciled_at,
        ) && stored_at > new_at
        {
            debug!(
                "Dropping stale status for {} ({} older than stored {})",
                name, new_at, stored_at
            );
            return Ok(ReportOutcome::Stale);
        }
        if stored == Some(&status) {
            return Ok(ReportOutcome::Unchanged);
        }

        let updated = bounded(self.timeout, self.store.patch_environment_status(name, &status)).await?;

        let from = stored.map(|s| s.state);
        let to = status.state;
        if from != Some(to) {
            info!(
                environment = name,
                from = from.map_or("None", |s| s.as_str()),
                to = to.as_str(),
                "Environment {} is now {}",
                name,
                to
            );
            self.metrics.move_state(from, to);
            if let Some(label) = transition_label(from.unwrap_or_default(), to) {
                self.metrics.record_transition(label);
            }
            if to.is_terminal()
                && let Some(created) = status.created_at
            {
                let age = (Utc::now() - created).num_seconds();
                self.metrics.observe_age(&current.spec.team, age as f64);
            }
        }

        Ok(ReportOutcome::Written(Box::new(updated)))
    }
}
