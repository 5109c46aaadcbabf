//! Scoring engine: observes transitions and keeps lead scores.
//!
//! Scores go up only on engagement (delivery, positive reply) and down only
//! through time decay, applied lazily when a lead is read. Nothing here feeds
//! back into the state machine.
//!
//! Increments are keyed by transition row id, so a record seen twice (live
//! feed and catch-up after a lag) is scored once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ScoringPolicy;
use crate::error::DatabaseError;
use crate::lead::{ConversationState, Lead, ReplyClassification, TransitionRecord};
use crate::store::{LeadStore, ScoreChangeKind};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// History rows read per page while catching up.
const CATCH_UP_PAGE: usize = 500;

pub struct ScoringEngine {
    store: Arc<dyn LeadStore>,
    policy: ScoringPolicy,
}

impl ScoringEngine {
    pub fn new(store: Arc<dyn LeadStore>, policy: ScoringPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Score increment a transition earns, if any.
    pub fn increment_for(&self, record: &TransitionRecord) -> Option<(f64, ScoreChangeKind)> {
        if record.trigger == "delivered" && record.to == ConversationState::AwaitingReply {
            return Some((self.policy.delivered_increment, ScoreChangeKind::Delivered));
        }
        if record.classification == Some(ReplyClassification::Positive)
            && record.to == ConversationState::Converted
        {
            let base = self.policy.positive_reply_base;
            let bonus = record
                .reply_latency_secs
                .map(|latency| base * self.speed_factor(latency))
                .unwrap_or(0.0);
            return Some((base + bonus, ScoreChangeKind::PositiveReply));
        }
        None
    }

    /// 1.0 for an instant reply, falling linearly to 0.0 at the fast-reply window.
    fn speed_factor(&self, latency_secs: i64) -> f64 {
        if self.policy.fast_reply_window_secs == 0 {
            return 0.0;
        }
        let ratio = latency_secs.max(0) as f64 / self.policy.fast_reply_window_secs as f64;
        (1.0 - ratio).max(0.0)
    }

    /// Apply the increment for one transition. Returns the new score.
    pub async fn observe(&self, record: &TransitionRecord) -> Result<Option<f64>, DatabaseError> {
        let Some((delta, kind)) = self.increment_for(record) else {
            return Ok(None);
        };
        let score = self
            .store
            .add_score(&record.lead_id, delta, kind, record.occurred_at, record.id)
            .await?;
        if let Some(score) = score {
            debug!(
                lead_id = %record.lead_id,
                kind = kind.as_str(),
                delta,
                score,
                "Score increased"
            );
        }
        Ok(score)
    }

    /// Score every persisted transition after `after_id`. Returns the last
    /// row id seen.
    pub async fn catch_up(&self, after_id: i64) -> Result<i64, DatabaseError> {
        let mut cursor = after_id;
        loop {
            let page = self.store.transitions_after(cursor, CATCH_UP_PAGE).await?;
            let Some(last) = page.last().and_then(|r| r.id) else {
                return Ok(cursor);
            };
            for record in &page {
                self.observe(record).await?;
            }
            cursor = last;
            if page.len() < CATCH_UP_PAGE {
                return Ok(cursor);
            }
        }
    }

    /// Decay owed by a lead at `now`, or `None` if nothing is owed.
    pub fn decay_penalty(&self, lead: &Lead, now: DateTime<Utc>) -> Option<f64> {
        let last_action = lead.last_action_at?;
        if lead.score <= 0.0 || self.policy.decay_per_day <= 0.0 {
            return None;
        }
        let threshold = chrono::Duration::seconds(self.policy.decay_threshold_secs as i64);
        let mut start = last_action + threshold;
        if let Some(decayed_at) = lead.score_decayed_at {
            start = start.max(decayed_at);
        }
        if now <= start {
            return None;
        }

        let days = (now - start).num_milliseconds() as f64 / MILLIS_PER_DAY;
        let penalty = self.policy.decay_per_day * days;
        (penalty > 0.0).then_some(penalty)
    }

    /// Apply any owed decay to a lead being read, persisting it. The returned
    /// lead carries the stored score, including increments that landed after
    /// `lead` was loaded.
    pub async fn read_lead(&self, mut lead: Lead, now: DateTime<Utc>) -> Result<Lead, DatabaseError> {
        let Some(penalty) = self.decay_penalty(&lead, now) else {
            return Ok(lead);
        };
        match self
            .store
            .apply_decay(&lead.id, penalty, lead.score_decayed_at, now)
            .await?
        {
            Some(score) => {
                debug!(lead_id = %lead.id, penalty, score, "Score decayed");
                lead.score = score;
                lead.score_decayed_at = Some(now);
                Ok(lead)
            }
            // Another reader moved the anchor first.
            None => Ok(self.store.get_lead(&lead.id).await?.unwrap_or(lead)),
        }
    }
}

/// Spawn the task that scores every broadcast transition.
///
/// `resume_from` is the history row id up to which scores are already
/// applied. When the feed lags, the missed records are replayed from the
/// store.
pub fn spawn_scoring_subscriber(
    engine: Arc<ScoringEngine>,
    mut rx: broadcast::Receiver<TransitionRecord>,
    mut resume_from: i64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    if let Err(e) = engine.observe(&record).await {
                        warn!(lead_id = %record.lead_id, error = %e, "Failed to update score");
                    } else if record.id == Some(resume_from + 1) {
                        resume_from += 1;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, resume_from, "Scoring subscriber lagged, replaying history");
                    match engine.catch_up(resume_from).await {
                        Ok(cursor) => resume_from = cursor,
                        Err(e) => warn!(error = %e, "Score catch-up failed"),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Transition feed closed, scoring subscriber exiting");
                    break;
                }
            }
        }
    })
}
