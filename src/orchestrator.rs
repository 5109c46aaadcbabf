//! Orchestrator: serializes events per lead and applies state machine decisions.
//!
//! Each event runs under its lead's lock: load lead, campaign and unresolved
//! action, call [`transition`], write the result in one store transaction,
//! release. Enqueueing the resulting send and broadcasting the transition to
//! the scoring engine happen after the lock is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::campaign::CampaignCatalog;
use crate::channels::normalize_address;
use crate::config::RetryPolicy;
use crate::dispatch::{Dispatcher, ReconcileReport};
use crate::error::{Error, EventError};
use crate::lead::{
    ActionStatus, ConversationState, Event, EventKind, Lead, LeadLocks, NewLead, OutboundAction,
    TimerCommand, TransitionContext, TransitionRecord, transition,
};
use crate::store::{LeadStore, ReplyTimer, TransitionWrite};

const TRANSITION_FEED_CAPACITY: usize = 1024;
const PUMP_RETRIES: u32 = 3;
const PUMP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Applied {
        from: ConversationState,
        to: ConversationState,
    },
    /// Redelivered or already-resolved event.
    Duplicate,
    /// Not valid for the lead's current state.
    Discarded,
    /// Nothing to route (intermediate receipt, unknown lead or attempt).
    Ignored,
}

/// Orchestrator counters.
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    pub transitions: AtomicUsize,
    pub duplicates: AtomicUsize,
    pub invalid_transitions: AtomicUsize,
    /// Events whose lead could not be resolved.
    pub unresolved: AtomicUsize,
    pub surfaced_failures: AtomicUsize,
    pub retries_scheduled: AtomicUsize,
    pub actions_created: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OrchestratorStatsSnapshot {
    pub transitions: usize,
    pub duplicates: usize,
    pub invalid_transitions: usize,
    pub unresolved: usize,
    pub surfaced_failures: usize,
    pub retries_scheduled: usize,
    pub actions_created: usize,
}

impl OrchestratorStats {
    pub fn snapshot(&self) -> OrchestratorStatsSnapshot {
        OrchestratorStatsSnapshot {
            transitions: self.transitions.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            invalid_transitions: self.invalid_transitions.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            surfaced_failures: self.surfaced_failures.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            actions_created: self.actions_created.load(Ordering::Relaxed),
        }
    }
}

/// Startup recovery summary.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RecoveryReport {
    pub reconcile: ReconcileReport,
    /// `New` leads whose first send was never scheduled.
    pub ingested: usize,
    pub timers_rearmed: usize,
    /// Leads expecting a send that had no outbound action.
    pub actions_recreated: usize,
    pub skipped: usize,
}

pub struct Orchestrator {
    store: Arc<dyn LeadStore>,
    catalog: Arc<CampaignCatalog>,
    dispatcher: Arc<Dispatcher>,
    delivery_retry: RetryPolicy,
    /// Shared with the dispatcher.
    locks: Arc<LeadLocks>,
    transitions_tx: broadcast::Sender<TransitionRecord>,
    stats: OrchestratorStats,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn LeadStore>,
        catalog: Arc<CampaignCatalog>,
        dispatcher: Arc<Dispatcher>,
        delivery_retry: RetryPolicy,
    ) -> Self {
        let (transitions_tx, _rx) = broadcast::channel(TRANSITION_FEED_CAPACITY);
        Self {
            store,
            catalog,
            locks: Arc::clone(dispatcher.lead_locks()),
            dispatcher,
            delivery_retry,
            transitions_tx,
            stats: OrchestratorStats::default(),
        }
    }

    /// Feed of applied transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionRecord> {
        self.transitions_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn LeadStore> {
        &self.store
    }

    pub fn catalog(&self) -> &CampaignCatalog {
        &self.catalog
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    /// Accept a CRM lead and schedule its first step.
    /// Returns false if the lead id is already known.
    pub async fn ingest_lead(&self, new: NewLead) -> Result<bool, Error> {
        if new.id.trim().is_empty() {
            return Err(EventError::Malformed("lead without an id".into()).into());
        }
        let campaign = self.catalog.get_active(&new.campaign_id)?;
        let address = normalize_address(&new.address);
        if address.is_empty() {
            return Err(
                EventError::Malformed(format!("lead {} has no usable address", new.id)).into(),
            );
        }

        let now = Utc::now();
        let variant = campaign.variants.assign(&new.id);
        let lead = Lead::new(NewLead { address, ..new }, variant, now);
        if !self.store.insert_lead(&lead).await? {
            debug!(lead_id = %lead.id, "Lead already known, ignoring");
            return Ok(false);
        }
        info!(
            lead_id = %lead.id,
            campaign_id = %lead.campaign_id,
            variant = %lead.variant_id,
            "Lead ingested"
        );

        self.handle_event(Event::new(lead.id.clone(), EventKind::Ingested, now))
            .await?;
        Ok(true)
    }

    /// Route one event to its lead. Per-lead failures come back as outcomes
    /// or non-systemic errors; only store/config failures are systemic.
    pub async fn handle_event(&self, event: Event) -> Result<Outcome, Error> {
        if let Some(key) = &event.idempotency_key
            && !self.store.record_event_key(key, Utc::now()).await?
        {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(lead_id = %event.lead_id, key = %key, "Redelivered event dropped");
            return Ok(Outcome::Duplicate);
        }

        let result = self.apply(&event).await;

        if let (Err(e), Some(key)) = (&result, &event.idempotency_key)
            && e.is_systemic()
            && let Err(release) = self.store.release_event_key(key).await
        {
            error!(key = %key, error = %release, "Failed to release idempotency key");
        }
        result
    }

    async fn apply(&self, event: &Event) -> Result<Outcome, Error> {
        let guard = self.locks.acquire(&event.lead_id).await;

        let Some(lead) = self.store.get_lead(&event.lead_id).await? else {
            self.stats.unresolved.fetch_add(1, Ordering::Relaxed);
            return Err(EventError::UnknownLead {
                reference: event.lead_id.clone(),
            }
            .into());
        };
        let campaign = self.catalog.get(&lead.campaign_id)?;
        let pending = self.store.get_pending_action(&lead.id).await?;

        let ctx = TransitionContext {
            lead: &lead,
            campaign,
            pending: pending.as_ref(),
            delivery_retry: &self.delivery_retry,
        };
        let decision = match transition(ctx, event) {
            Ok(decision) => decision,
            Err(EventError::Duplicate { key }) => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(lead_id = %lead.id, key = %key, event = event.kind.label(), "Duplicate event");
                return Ok(Outcome::Duplicate);
            }
            Err(e @ EventError::InvalidTransition { .. }) => {
                self.stats.invalid_transitions.fetch_add(1, Ordering::Relaxed);
                info!(lead_id = %lead.id, error = %e, "Event discarded");
                return Ok(Outcome::Discarded);
            }
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let mut updated = lead.clone();
        updated.state = decision.next_state;
        updated.current_step = decision.step;
        updated.stale_reason = if decision.next_state == ConversationState::Stale {
            decision.stale_reason.or(lead.stale_reason)
        } else {
            None
        };
        if decision.next_state == ConversationState::OptedOut {
            updated.opted_out = true;
        }
        if decision.touch_last_action {
            updated.last_action_at = Some(event.occurred_at);
        }
        updated.updated_at = now;

        let (classification, reply_latency_secs) = match &event.kind {
            EventKind::Replied { classification, .. } => {
                (Some(*classification), reply_latency(&lead, event.occurred_at))
            }
            _ => (None, None),
        };

        let write = TransitionWrite {
            resolve_action: decision
                .resolve_pending
                .and(pending.as_ref().map(|p| p.id)),
            reschedule_action: decision
                .retry_pending_at
                .and_then(|at| pending.as_ref().map(|p| (p.id, at))),
            new_action: decision
                .send_step
                .map(|step| OutboundAction::new(&updated, step, now)),
            timer: decision.timer,
            record: TransitionRecord {
                lead_id: lead.id.clone(),
                from: lead.state,
                to: decision.next_state,
                step: decision.step,
                trigger: event.kind.label().to_string(),
                classification,
                reply_latency_secs,
                reason: decision.surfaced_error.clone().or(decision.note.clone()),
                occurred_at: event.occurred_at,
                id: None,
            },
            lead: updated,
        };
        let transition_id = self.store.apply_transition(&write).await?;
        drop(guard);

        self.stats.transitions.fetch_add(1, Ordering::Relaxed);
        info!(
            lead_id = %lead.id,
            from = %lead.state,
            to = %decision.next_state,
            step = decision.step,
            trigger = event.kind.label(),
            "Lead transitioned"
        );

        if let Some(action) = &write.new_action {
            self.stats.actions_created.fetch_add(1, Ordering::Relaxed);
            self.dispatcher.enqueue(action).await;
        }
        if let (Some((_, retry_at)), Some(pending)) = (write.reschedule_action, pending) {
            self.stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
            info!(
                lead_id = %lead.id,
                step = pending.step,
                attempt = pending.attempts,
                retry_at = %retry_at,
                "Send retry scheduled"
            );
            let retry = OutboundAction {
                status: ActionStatus::Queued,
                scheduled_at: retry_at,
                ..pending
            };
            self.dispatcher.enqueue(&retry).await;
        }
        if let Some(surfaced) = &decision.surfaced_error {
            self.stats.surfaced_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                lead_id = %lead.id,
                reason = ?decision.stale_reason.map(|r| r.as_str()),
                error = %surfaced,
                "Lead needs operator attention"
            );
        }

        // No subscribers is fine.
        let _ = self.transitions_tx.send(TransitionRecord {
            id: Some(transition_id),
            ..write.record
        });

        Ok(Outcome::Applied {
            from: lead.state,
            to: decision.next_state,
        })
    }

    /// Restart recovery: reconcile in-flight actions first, then re-evaluate
    /// live leads that have no unresolved action.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport, Error> {
        let mut report = RecoveryReport {
            reconcile: self.dispatcher.reconcile(now).await?,
            ..RecoveryReport::default()
        };

        for lead in self.store.list_live_leads().await? {
            if self.store.get_pending_action(&lead.id).await?.is_some() {
                continue;
            }
            let result = match lead.state {
                ConversationState::New => self
                    .handle_event(Event::new(lead.id.clone(), EventKind::Ingested, now))
                    .await
                    .map(|_| report.ingested += 1),
                ConversationState::AwaitingReply => {
                    self.rearm_timer(&lead).await.map(|armed| {
                        if armed {
                            report.timers_rearmed += 1;
                        }
                    })
                }
                state if state.awaits_delivery() => self
                    .recreate_action(&lead.id, now)
                    .await
                    .map(|created| {
                        if created {
                            report.actions_recreated += 1;
                        }
                    }),
                _ => Ok(()),
            };

            if let Err(e) = result {
                if e.is_systemic() {
                    return Err(e);
                }
                warn!(lead_id = %lead.id, error = %e, "Recovery skipped lead");
                report.skipped += 1;
            }
        }

        info!(
            ingested = report.ingested,
            timers_rearmed = report.timers_rearmed,
            actions_recreated = report.actions_recreated,
            skipped = report.skipped,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Arm the reply timer an `AwaitingReply` lead is owed, if missing.
    async fn rearm_timer(&self, lead: &Lead) -> Result<bool, Error> {
        let timers = self.store.timers_for_lead(&lead.id).await?;
        if timers.iter().any(|t| t.step == lead.current_step) {
            return Ok(false);
        }
        let campaign = self.catalog.get(&lead.campaign_id)?;
        let since = lead.last_action_at.unwrap_or(lead.updated_at);
        let timer = ReplyTimer {
            lead_id: lead.id.clone(),
            step: lead.current_step,
            due_at: since + campaign.wait_for(lead.current_step),
        };
        self.store.arm_timer(&timer).await?;
        info!(lead_id = %lead.id, step = timer.step, due_at = %timer.due_at, "Reply timer re-armed");
        Ok(true)
    }

    /// Recreate the send for a lead stuck waiting on an action that no longer exists.
    async fn recreate_action(&self, lead_id: &str, now: DateTime<Utc>) -> Result<bool, Error> {
        let guard = self.locks.acquire(lead_id).await;
        let Some(lead) = self.store.get_lead(lead_id).await? else {
            return Ok(false);
        };
        if !lead.state.awaits_delivery() || self.store.get_pending_action(lead_id).await?.is_some()
        {
            return Ok(false);
        }
        self.catalog.get(&lead.campaign_id)?;

        let action = OutboundAction::new(&lead, lead.current_step, now);
        let write = TransitionWrite {
            record: TransitionRecord {
                lead_id: lead.id.clone(),
                from: lead.state,
                to: lead.state,
                step: lead.current_step,
                trigger: "recovered".into(),
                classification: None,
                reply_latency_secs: None,
                reason: Some("outbound action missing after restart".into()),
                occurred_at: now,
                id: None,
            },
            lead,
            resolve_action: None,
            reschedule_action: None,
            new_action: Some(action.clone()),
            timer: TimerCommand::Keep,
        };
        self.store.apply_transition(&write).await?;
        drop(guard);

        warn!(lead_id = %lead_id, step = action.step, "Recreated missing outbound action");
        self.stats.actions_created.fetch_add(1, Ordering::Relaxed);
        self.dispatcher.enqueue(&action).await;
        Ok(true)
    }

    /// Process every event already waiting on `rx`. Returns how many were handled.
    pub async fn drain_events(&self, rx: &mut mpsc::Receiver<Event>) -> usize {
        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            self.handle_logged(event).await;
            handled += 1;
        }
        handled
    }

    async fn handle_logged(&self, event: Event) {
        let lead_id = event.lead_id.clone();
        let label = event.kind.label();
        let mut attempt = 0;
        loop {
            match self.handle_event(event.clone()).await {
                Ok(outcome) => {
                    debug!(lead_id = %lead_id, event = label, ?outcome, "Event handled");
                    return;
                }
                Err(e) if e.is_systemic() && attempt < PUMP_RETRIES => {
                    attempt += 1;
                    warn!(lead_id = %lead_id, event = label, attempt, error = %e, "Event failed, retrying");
                    tokio::time::sleep(PUMP_RETRY_DELAY).await;
                }
                Err(e) if e.is_systemic() => {
                    error!(lead_id = %lead_id, event = label, error = %e, "Event lost to store failure");
                    return;
                }
                Err(e) => {
                    warn!(lead_id = %lead_id, event = label, error = %e, "Event rejected");
                    return;
                }
            }
        }
    }
}

/// Seconds from the last delivered message to a reply, for leads waiting on one.
fn reply_latency(lead: &Lead, replied_at: DateTime<Utc>) -> Option<i64> {
    if lead.state != ConversationState::AwaitingReply {
        return None;
    }
    lead.last_action_at
        .map(|at| (replied_at - at).num_seconds().max(0))
}

/// Spawn the task feeding dispatcher outcomes back into the orchestrator.
pub fn spawn_event_pump(
    orchestrator: Arc<Orchestrator>,
    mut rx: mpsc::Receiver<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            orchestrator.handle_logged(event).await;
        }
        info!("Dispatcher event channel closed, pump exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_only_while_awaiting_reply() {
        let now = Utc::now();
        let mut lead = Lead::new(
            NewLead {
                id: "l1".into(),
                name: "Ana".into(),
                address: "15550001111".into(),
                email: None,
                campaign_id: "c1".into(),
                context: serde_json::Value::Null,
            },
            "control".into(),
            now,
        );
        lead.last_action_at = Some(now - chrono::Duration::seconds(90));
        lead.state = ConversationState::AwaitingReply;
        assert_eq!(reply_latency(&lead, now), Some(90));

        lead.state = ConversationState::Replied;
        assert_eq!(reply_latency(&lead, now), None);
    }
}
