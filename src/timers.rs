//! Reply-timeout timers.
//!
//! Timers are rows keyed by (lead id, step), armed and cancelled inside the
//! transition that causes them. The ticker here only fires due rows as
//! `timed_out` events; the state machine discards any that lost a race with
//! a reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::ingest::IngestRouter;
use crate::orchestrator::Outcome;
use crate::store::LeadStore;

pub struct TimerService {
    store: Arc<dyn LeadStore>,
    router: Arc<IngestRouter>,
}

impl TimerService {
    pub fn new(store: Arc<dyn LeadStore>, router: Arc<IngestRouter>) -> Self {
        Self { store, router }
    }

    /// Fire every timer due at `now`. Returns how many advanced a lead.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let due = self.store.due_timers(now).await?;
        let mut advanced = 0;

        for timer in due {
            match self.router.timed_out(&timer).await {
                Ok(Outcome::Applied { from, to }) => {
                    debug!(lead_id = %timer.lead_id, step = timer.step, %from, %to, "Reply timer fired");
                    advanced += 1;
                }
                Ok(outcome) => {
                    debug!(lead_id = %timer.lead_id, step = timer.step, ?outcome, "Stale reply timer dropped");
                }
                Err(e) if e.is_systemic() => {
                    // Keep the row; the next tick retries it.
                    error!(lead_id = %timer.lead_id, step = timer.step, error = %e, "Reply timer failed");
                    continue;
                }
                Err(e) => {
                    warn!(lead_id = %timer.lead_id, step = timer.step, error = %e, "Reply timer rejected");
                }
            }
            self.store.delete_timer(&timer.lead_id, timer.step).await?;
        }
        Ok(advanced)
    }
}

/// Spawn the timer ticker.
pub fn spawn_timer_ticker(
    service: Arc<TimerService>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = service.fire_due(Utc::now()).await {
                error!(error = %e, "Timer tick failed");
            }
        }
    })
}
