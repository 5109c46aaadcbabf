//! Dispatcher: queues outbound actions and sends them within rate budgets.
//!
//! The queue is in memory; the store is the source of truth. Every send is
//! claimed (`record_attempt`) under the lead's lock before the transport
//! call, so it never races a transition for that lead. The outcome of
//! a failed call goes back to the orchestrator as a `failed` event. On
//! restart, `reconcile` rebuilds the queue from the store and settles
//! attempts whose outcome was never recorded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::campaign::CampaignCatalog;
use crate::channels::{ChannelTransport, ReceiptStatus, is_retryable_code};
use crate::config::{PolicyConfig, RateBudget, RetryPolicy};
use crate::dispatch::rate_limit::RateLimiter;
use crate::error::Error;
use crate::lead::{
    ActionStatus, ConversationMessage, Event, EventKind, FailureCause, Lead, LeadLocks,
    MessageDirection, OutboundAction,
};
use crate::llm::{RenderRequest, TextGenerator};
use crate::store::LeadStore;

/// Messages of conversation history handed to the generator.
const PROMPT_HISTORY_LIMIT: usize = 5;

/// Dispatcher settings taken from the policy file.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub render_retry: RetryPolicy,
    pub channel_budget: RateBudget,
    pub max_queue_depth: usize,
    /// Receipt error codes that end a conversation.
    pub fatal_error_codes: Vec<String>,
}

impl DispatchPolicy {
    pub fn from_config(policy: &PolicyConfig, transport: &dyn ChannelTransport) -> Self {
        Self {
            render_retry: policy.render_retry.clone(),
            channel_budget: policy.channel_budget,
            max_queue_depth: policy.max_queue_depth,
            fatal_error_codes: effective_fatal_codes(policy, transport),
        }
    }
}

/// Configured fatal codes, or the transport's defaults when none are configured.
pub fn effective_fatal_codes(policy: &PolicyConfig, transport: &dyn ChannelTransport) -> Vec<String> {
    if policy.fatal_error_codes.is_empty() {
        transport.default_fatal_codes()
    } else {
        policy.fatal_error_codes.clone()
    }
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub sent: AtomicUsize,
    pub send_failures: AtomicUsize,
    pub render_failures: AtomicUsize,
    /// Due actions held back by a rate budget.
    pub throttled: AtomicUsize,
    /// Times the queue crossed its depth limit.
    pub queue_alerts: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DispatchStatsSnapshot {
    pub sent: usize,
    pub send_failures: usize,
    pub render_failures: usize,
    pub throttled: usize,
    pub queue_alerts: usize,
    pub queue_depth: usize,
}

/// What `reconcile` did with each unresolved action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Put back in the queue for (re)sending.
    pub requeued: usize,
    /// In-flight attempt found in the transport history and adopted.
    pub adopted: usize,
    /// Receipt outcome found and emitted as an event.
    pub resolved: usize,
    /// Sent and still waiting for a receipt.
    pub awaiting: usize,
    /// Transport lookup failed; retried on later ticks.
    pub deferred: usize,
}

#[derive(Debug, Clone)]
struct QueuedAction {
    action_id: Uuid,
    lead_id: String,
    scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DispatchQueue {
    by_campaign: HashMap<String, VecDeque<QueuedAction>>,
    /// Round-robin order of campaigns with queued work.
    rotation: VecDeque<String>,
    members: HashSet<Uuid>,
    over_depth: bool,
}

impl DispatchQueue {
    fn push(&mut self, campaign_id: &str, item: QueuedAction) -> bool {
        if !self.members.insert(item.action_id) {
            return false;
        }
        let entries = self.by_campaign.entry(campaign_id.to_string()).or_default();
        if entries.is_empty() && !self.rotation.iter().any(|c| c == campaign_id) {
            self.rotation.push_back(campaign_id.to_string());
        }
        entries.push_back(item);
        true
    }

    fn has_due(&self, campaign_id: &str, now: DateTime<Utc>) -> bool {
        self.by_campaign
            .get(campaign_id)
            .is_some_and(|q| q.iter().any(|a| a.scheduled_at <= now))
    }

    /// Earliest-enqueued due action of a campaign.
    fn take_due(&mut self, campaign_id: &str, now: DateTime<Utc>) -> Option<QueuedAction> {
        let entries = self.by_campaign.get_mut(campaign_id)?;
        let pos = entries.iter().position(|a| a.scheduled_at <= now)?;
        let item = entries.remove(pos)?;
        self.members.remove(&item.action_id);
        Some(item)
    }

    /// Drop empty campaigns and start the next pass one campaign later.
    fn rotate(&mut self) {
        self.by_campaign.retain(|_, q| !q.is_empty());
        let by_campaign = &self.by_campaign;
        self.rotation.retain(|c| by_campaign.contains_key(c));
        if let Some(first) = self.rotation.pop_front() {
            self.rotation.push_back(first);
        }
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

enum SendOutcome {
    Sent,
    Skipped,
    RenderRetry,
    Failed,
}

/// Rate-limited outbound dispatcher.
pub struct Dispatcher {
    store: Arc<dyn LeadStore>,
    catalog: Arc<CampaignCatalog>,
    transport: Arc<dyn ChannelTransport>,
    generator: Arc<dyn TextGenerator>,
    policy: DispatchPolicy,
    queue: Mutex<DispatchQueue>,
    limiter: Mutex<RateLimiter>,
    /// Actions whose reconciliation lookup failed.
    deferred: Mutex<HashSet<Uuid>>,
    events: mpsc::Sender<Event>,
    stats: DispatchStats,
    locks: Arc<LeadLocks>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn LeadStore>,
        catalog: Arc<CampaignCatalog>,
        transport: Arc<dyn ChannelTransport>,
        generator: Arc<dyn TextGenerator>,
        policy: DispatchPolicy,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            store,
            catalog,
            transport,
            generator,
            policy,
            queue: Mutex::new(DispatchQueue::default()),
            limiter: Mutex::new(RateLimiter::new()),
            deferred: Mutex::new(HashSet::new()),
            events,
            stats: DispatchStats::default(),
            locks: Arc::new(LeadLocks::new()),
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Per-lead locks a send is claimed under. Shared with the orchestrator.
    pub fn lead_locks(&self) -> &Arc<LeadLocks> {
        &self.locks
    }

    /// Add an action to its campaign's queue. Already-queued actions are ignored.
    pub async fn enqueue(&self, action: &OutboundAction) -> bool {
        let mut queue = self.queue.lock().await;
        let added = queue.push(
            &action.campaign_id,
            QueuedAction {
                action_id: action.id,
                lead_id: action.lead_id.clone(),
                scheduled_at: action.scheduled_at,
            },
        );

        let depth = queue.len();
        if depth > self.policy.max_queue_depth {
            if !queue.over_depth {
                self.stats.queue_alerts.fetch_add(1, Ordering::Relaxed);
                error!(
                    depth,
                    max = self.policy.max_queue_depth,
                    "Dispatch queue over its depth limit"
                );
                queue.over_depth = true;
            }
        } else if queue.over_depth {
            info!(depth, "Dispatch queue back under its depth limit");
            queue.over_depth = false;
        }

        if added {
            debug!(
                lead_id = %action.lead_id,
                action_id = %action.id,
                step = action.step,
                scheduled_at = %action.scheduled_at,
                depth,
                "Action enqueued"
            );
        }
        added
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Whether the queue is currently above `max_queue_depth`.
    pub async fn over_depth(&self) -> bool {
        self.queue.lock().await.over_depth
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub async fn stats_snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            render_failures: self.stats.render_failures.load(Ordering::Relaxed),
            throttled: self.stats.throttled.load(Ordering::Relaxed),
            queue_alerts: self.stats.queue_alerts.load(Ordering::Relaxed),
            queue_depth: self.queue_depth().await,
        }
    }

    /// One dispatch pass: admit due actions within budget and send them.
    /// Returns the number of messages handed to the transport.
    pub async fn run_once(&self, now: DateTime<Utc>) -> usize {
        self.retry_deferred(now).await;

        let batch = self.admit(now).await;
        if batch.is_empty() {
            return 0;
        }

        let outcomes = join_all(batch.into_iter().map(|(campaign_id, item)| async move {
            let result = self.process(&item, now).await;
            (campaign_id, item, result)
        }))
        .await;

        let mut sent = 0;
        for (campaign_id, item, result) in outcomes {
            match result {
                Ok(SendOutcome::Sent) => sent += 1,
                Ok(SendOutcome::Skipped | SendOutcome::RenderRetry | SendOutcome::Failed) => {}
                Err(e) => {
                    error!(
                        lead_id = %item.lead_id,
                        action_id = %item.action_id,
                        error = %e,
                        "Dispatch failed; action kept for the next pass"
                    );
                    self.queue.lock().await.push(&campaign_id, item);
                }
            }
        }
        sent
    }

    /// Pick due actions round-robin across campaigns while budgets allow.
    async fn admit(&self, now: DateTime<Utc>) -> Vec<(String, QueuedAction)> {
        let mut queue = self.queue.lock().await;
        let mut limiter = self.limiter.lock().await;

        let channel_key = format!("channel:{}", self.transport.name());
        let channel_budget = self.policy.channel_budget;
        let campaigns: Vec<String> = queue.rotation.iter().cloned().collect();
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut batch = Vec::new();

        'rounds: loop {
            let mut progressed = false;
            for campaign_id in &campaigns {
                if blocked.contains(campaign_id.as_str()) || !queue.has_due(campaign_id, now) {
                    continue;
                }
                let Ok(campaign) = self.catalog.get(campaign_id) else {
                    // Unknown campaign: pass the action on so it fails visibly.
                    if let Some(item) = queue.take_due(campaign_id, now) {
                        batch.push((campaign_id.clone(), item));
                        progressed = true;
                    }
                    continue;
                };

                if let Some(wait) = limiter.wait_time(&channel_key, &channel_budget, now) {
                    self.stats.throttled.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        channel = %channel_key,
                        wait_ms = wait.num_milliseconds(),
                        "Channel budget exhausted"
                    );
                    break 'rounds;
                }
                let campaign_key = format!("campaign:{campaign_id}");
                if !limiter.try_admit(
                    &[
                        (campaign_key.as_str(), campaign.rate_budget),
                        (channel_key.as_str(), channel_budget),
                    ],
                    now,
                ) {
                    self.stats.throttled.fetch_add(1, Ordering::Relaxed);
                    let wait = limiter.wait_time(&campaign_key, &campaign.rate_budget, now);
                    debug!(
                        campaign_id = %campaign_id,
                        wait_ms = wait.map(|w| w.num_milliseconds()),
                        "Campaign budget exhausted"
                    );
                    blocked.insert(campaign_id.as_str());
                    continue;
                }
                if let Some(item) = queue.take_due(campaign_id, now) {
                    batch.push((campaign_id.clone(), item));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        queue.rotate();
        batch
    }

    async fn process(&self, item: &QueuedAction, now: DateTime<Utc>) -> Result<SendOutcome, Error> {
        let Some(action) = self.store.get_action(item.action_id).await? else {
            debug!(action_id = %item.action_id, "Action resolved before dispatch");
            return Ok(SendOutcome::Skipped);
        };
        if action.status != ActionStatus::Queued {
            return Ok(SendOutcome::Skipped);
        }
        if action.scheduled_at > now {
            // Rescheduled after it was queued; wait for the new time.
            self.enqueue(&action).await;
            return Ok(SendOutcome::Skipped);
        }
        let Some(lead) = self.store.get_lead(&action.lead_id).await? else {
            warn!(lead_id = %action.lead_id, "Action for unknown lead");
            return Ok(SendOutcome::Skipped);
        };
        if lead.state.is_terminal() {
            return Ok(SendOutcome::Skipped);
        }

        let text = match action.rendered_text.clone() {
            Some(text) => text,
            None => match self.render(&lead, &action).await {
                Ok(text) => {
                    if !self.store.save_render(action.id, &text).await? {
                        return Ok(SendOutcome::Skipped);
                    }
                    text
                }
                Err((err, retryable)) => {
                    return self.render_failed(&action, err, retryable, now).await;
                }
            },
        };

        // Claim the send under the lead lock. A transition may have resolved
        // the action or ended the conversation since it was read.
        let guard = self.locks.acquire(&action.lead_id).await;
        match self.store.get_action(action.id).await? {
            Some(current) if current.status == ActionStatus::Queued => {}
            _ => {
                debug!(action_id = %action.id, "Action resolved while rendering");
                return Ok(SendOutcome::Skipped);
            }
        }
        let lead = match self.store.get_lead(&action.lead_id).await? {
            Some(lead) if !lead.state.is_terminal() => lead,
            _ => return Ok(SendOutcome::Skipped),
        };
        let Some(attempt) = self.store.record_attempt(action.id, now).await? else {
            return Ok(SendOutcome::Skipped);
        };
        drop(guard);
        info!(
            lead_id = %lead.id,
            step = action.step,
            attempt,
            "Sending message"
        );

        match self.transport.send(&lead.address, &text).await {
            Ok(attempt_id) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                if !self.store.mark_sent(action.id, &attempt_id).await? {
                    warn!(
                        lead_id = %lead.id,
                        attempt_id = %attempt_id,
                        "Action resolved while its send was in flight"
                    );
                }
                let message = ConversationMessage {
                    lead_id: lead.id.clone(),
                    direction: MessageDirection::Outbound,
                    body: text,
                    message_id: Some(attempt_id),
                    step: Some(action.step),
                    at: now,
                };
                if let Err(e) = self.store.append_message(&message).await {
                    warn!(lead_id = %lead.id, error = %e, "Failed to log outbound message");
                }
                Ok(SendOutcome::Sent)
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    lead_id = %lead.id,
                    step = action.step,
                    attempt,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Send failed"
                );
                self.emit(Event::new(
                    lead.id.clone(),
                    EventKind::Failed {
                        action_id: Some(action.id),
                        attempt_id: None,
                        retryable: e.is_retryable(),
                        cause: FailureCause::Transport,
                        reason: e.reason().to_string(),
                    },
                    now,
                ))
                .await;
                Ok(SendOutcome::Failed)
            }
        }
    }

    /// Render the action's step. The flag says whether a retry could help.
    async fn render(&self, lead: &Lead, action: &OutboundAction) -> Result<String, (String, bool)> {
        let campaign = self
            .catalog
            .get(&action.campaign_id)
            .map_err(|e| (e.to_string(), false))?;
        let template = campaign
            .template_for(action.step, &action.variant_id)
            .ok_or_else(|| (format!("campaign {} has no step {}", campaign.id, action.step), false))?;
        let history = match self.store.conversation(&lead.id, PROMPT_HISTORY_LIMIT).await {
            Ok(history) => history,
            Err(e) => {
                warn!(lead_id = %lead.id, error = %e, "Conversation history unavailable");
                Vec::new()
            }
        };

        self.generator
            .render(RenderRequest {
                lead,
                campaign,
                step: action.step,
                variant: &action.variant_id,
                template,
                history: &history,
            })
            .await
            .map_err(|e| (e.to_string(), true))
    }

    async fn render_failed(
        &self,
        action: &OutboundAction,
        reason: String,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, Error> {
        self.stats.render_failures.fetch_add(1, Ordering::Relaxed);
        let attempts_made = action.render_attempts + 1;

        if retryable && self.policy.render_retry.allows_another(attempts_made) {
            let delay = self.policy.render_retry.backoff_for_attempt(attempts_made);
            let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            warn!(
                lead_id = %action.lead_id,
                step = action.step,
                attempt = attempts_made,
                retry_at = %retry_at,
                reason = %reason,
                "Render failed, will retry"
            );
            if self.store.record_render_failure(action.id, retry_at).await?.is_some() {
                let mut retried = action.clone();
                retried.scheduled_at = retry_at;
                self.enqueue(&retried).await;
            }
            return Ok(SendOutcome::RenderRetry);
        }

        self.store.record_render_failure(action.id, now).await?;
        error!(
            lead_id = %action.lead_id,
            step = action.step,
            attempts = attempts_made,
            reason = %reason,
            "Render failed permanently"
        );
        self.emit(Event::new(
            action.lead_id.clone(),
            EventKind::Failed {
                action_id: Some(action.id),
                attempt_id: None,
                retryable: false,
                cause: FailureCause::Render,
                reason,
            },
            now,
        ))
        .await;
        Ok(SendOutcome::Failed)
    }

    /// Rebuild the queue from the store and settle unconfirmed attempts.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, Error> {
        let mut report = ReconcileReport::default();
        for action in self.store.list_unresolved_actions().await? {
            self.reconcile_action(action, now, &mut report).await?;
        }
        info!(
            requeued = report.requeued,
            adopted = report.adopted,
            resolved = report.resolved,
            awaiting = report.awaiting,
            deferred = report.deferred,
            "Dispatcher reconciliation complete"
        );
        Ok(report)
    }

    /// Poll the transport for sent actions whose receipt is older than
    /// `older_than`. Catches receipts that arrived before the attempt id was
    /// stored. Returns the number of outcomes emitted.
    pub async fn sweep_receipts(
        &self,
        now: DateTime<Utc>,
        older_than: chrono::Duration,
    ) -> Result<usize, Error> {
        let mut resolved = 0;
        for action in self.store.list_unresolved_actions().await? {
            let (ActionStatus::Sent, Some(attempt_id)) = (action.status, action.attempt_id.clone())
            else {
                continue;
            };
            if action.last_attempt_at.is_some_and(|at| now - at < older_than) {
                continue;
            }
            match self.transport.attempt_status(&attempt_id).await {
                Ok(Some(status)) => {
                    if self.emit_receipt(&action, &attempt_id, &status, now).await {
                        resolved += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(lead_id = %action.lead_id, attempt_id = %attempt_id, error = %e, "Receipt poll failed");
                }
            }
        }
        if resolved > 0 {
            info!(resolved, "Receipt sweep settled sent actions");
        }
        Ok(resolved)
    }

    async fn retry_deferred(&self, now: DateTime<Utc>) {
        let ids: Vec<Uuid> = self.deferred.lock().await.drain().collect();
        for id in ids {
            let result = match self.store.get_action(id).await {
                Ok(Some(action)) => {
                    let mut report = ReconcileReport::default();
                    self.reconcile_action(action, now, &mut report).await
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(action_id = %id, error = %e, "Deferred reconciliation failed");
                self.deferred.lock().await.insert(id);
            }
        }
    }

    async fn reconcile_action(
        &self,
        action: OutboundAction,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), Error> {
        match (action.status, action.attempt_id.clone()) {
            (ActionStatus::Queued, _) => {
                self.enqueue(&action).await;
                report.requeued += 1;
            }
            (ActionStatus::Sent, Some(attempt_id)) => {
                match self.transport.attempt_status(&attempt_id).await {
                    Ok(Some(status)) => {
                        if self.emit_receipt(&action, &attempt_id, &status, now).await {
                            report.resolved += 1;
                        } else {
                            report.awaiting += 1;
                        }
                    }
                    Ok(None) => {
                        warn!(
                            lead_id = %action.lead_id,
                            attempt_id = %attempt_id,
                            "Transport has no record of attempt; waiting for receipt"
                        );
                        report.awaiting += 1;
                    }
                    Err(e) => {
                        warn!(lead_id = %action.lead_id, error = %e, "Receipt lookup failed");
                        self.deferred.lock().await.insert(action.id);
                        report.deferred += 1;
                    }
                }
            }
            // Sending, or a sent action missing its attempt id.
            (ActionStatus::Sending | ActionStatus::Sent, _) => {
                let Some(lead) = self.store.get_lead(&action.lead_id).await? else {
                    return Ok(());
                };
                let since = action.last_attempt_at.unwrap_or(action.created_at);
                match self.transport.find_recent_attempt(&lead.address, since).await {
                    Ok(Some(receipt)) => {
                        self.store.mark_sent(action.id, &receipt.attempt_id).await?;
                        info!(
                            lead_id = %lead.id,
                            attempt_id = %receipt.attempt_id,
                            "Adopted in-flight attempt from transport history"
                        );
                        report.adopted += 1;
                        if self
                            .emit_receipt(&action, &receipt.attempt_id, &receipt.status, now)
                            .await
                        {
                            report.resolved += 1;
                        }
                    }
                    Ok(None) => {
                        self.store.requeue_action(action.id).await?;
                        let mut queued = action.clone();
                        queued.status = ActionStatus::Queued;
                        self.enqueue(&queued).await;
                        report.requeued += 1;
                    }
                    Err(e) => {
                        warn!(lead_id = %lead.id, error = %e, "Attempt history lookup failed");
                        self.deferred.lock().await.insert(action.id);
                        report.deferred += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit a delivered/failed event for a known receipt. False while pending.
    async fn emit_receipt(
        &self,
        action: &OutboundAction,
        attempt_id: &str,
        status: &ReceiptStatus,
        now: DateTime<Utc>,
    ) -> bool {
        let kind = match status {
            ReceiptStatus::Pending => return false,
            ReceiptStatus::Delivered => EventKind::Delivered {
                action_id: Some(action.id),
                attempt_id: Some(attempt_id.to_string()),
            },
            ReceiptStatus::Failed { error_code } => EventKind::Failed {
                action_id: Some(action.id),
                attempt_id: Some(attempt_id.to_string()),
                retryable: is_retryable_code(error_code.as_deref(), &self.policy.fatal_error_codes),
                cause: FailureCause::Transport,
                reason: format!(
                    "receipt failed (code {})",
                    error_code.as_deref().unwrap_or("none")
                ),
            },
        };
        self.emit(Event::new(action.lead_id.clone(), kind, now)).await;
        true
    }

    async fn emit(&self, event: Event) {
        let lead_id = event.lead_id.clone();
        if let Err(e) = self.events.send(event).await {
            error!(lead_id = %lead_id, error = %e, "Event channel closed; dispatcher outcome lost");
        }
    }
}

/// Spawn the dispatcher loop. Unconfirmed receipts are swept every
/// [`RECEIPT_SWEEP_INTERVAL`].
pub fn spawn_dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last_sweep = Utc::now();
        loop {
            ticker.tick().await;
            let now = Utc::now();
            dispatcher.run_once(now).await;

            if now - last_sweep >= receipt_sweep_interval() {
                last_sweep = now;
                if let Err(e) = dispatcher.sweep_receipts(now, receipt_sweep_interval()).await {
                    warn!(error = %e, "Receipt sweep failed");
                }
            }
        }
    })
}

/// How often sent actions without a receipt are checked with the transport.
pub const RECEIPT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

fn receipt_sweep_interval() -> chrono::Duration {
    chrono::Duration::from_std(RECEIPT_SWEEP_INTERVAL).unwrap_or_else(|_| chrono::Duration::zero())
}
