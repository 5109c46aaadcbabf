//! `LeadStore` trait: single async interface for all orchestrator persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::lead::{ConversationMessage, Lead, OutboundAction, TimerCommand, TransitionRecord};

/// A persisted reply-timeout timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyTimer {
    pub lead_id: String,
    pub step: u32,
    pub due_at: DateTime<Utc>,
}

/// Kinds of score change recorded in score history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreChangeKind {
    Delivered,
    PositiveReply,
    Decay,
}

impl ScoreChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::PositiveReply => "positive_reply",
            Self::Decay => "decay",
        }
    }
}

/// Reporting filter over leads.
#[derive(Debug, Clone, Default)]
pub struct LeadFilter {
    /// State name; `sent` matches every `sent:n`.
    pub state: Option<String>,
    pub campaign_id: Option<String>,
    pub limit: Option<usize>,
}

/// Everything one transition writes, applied in a single transaction.
#[derive(Debug, Clone)]
pub struct TransitionWrite {
    /// Lead with its conversation fields updated. Score columns are not written.
    pub lead: Lead,
    /// Unresolved action to delete.
    pub resolve_action: Option<Uuid>,
    /// Unresolved action to put back in the queue at the given time.
    pub reschedule_action: Option<(Uuid, DateTime<Utc>)>,
    pub new_action: Option<OutboundAction>,
    pub timer: TimerCommand,
    pub record: TransitionRecord,
}

/// Backend-agnostic store for leads, actions, timers and history.
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a new lead. Returns false if the id already exists.
    async fn insert_lead(&self, lead: &Lead) -> Result<bool, DatabaseError>;

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, DatabaseError>;

    /// Lead for a channel address, preferring one still in conversation.
    async fn find_lead_by_address(&self, address: &str) -> Result<Option<Lead>, DatabaseError>;

    async fn list_leads(&self, filter: &LeadFilter) -> Result<Vec<Lead>, DatabaseError>;

    /// Leads not in a terminal state.
    async fn list_live_leads(&self) -> Result<Vec<Lead>, DatabaseError>;

    /// Lead count per state string.
    async fn state_counts(&self) -> Result<Vec<(String, i64)>, DatabaseError>;

    /// Apply one transition atomically. Returns the history row id.
    async fn apply_transition(&self, write: &TransitionWrite) -> Result<i64, DatabaseError>;

    // ── Outbound actions ────────────────────────────────────────────

    async fn get_pending_action(&self, lead_id: &str)
    -> Result<Option<OutboundAction>, DatabaseError>;

    async fn get_action(&self, id: Uuid) -> Result<Option<OutboundAction>, DatabaseError>;

    async fn find_action_by_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<OutboundAction>, DatabaseError>;

    async fn list_unresolved_actions(&self) -> Result<Vec<OutboundAction>, DatabaseError>;

    /// Persist rendered text. Returns false if the action no longer exists.
    async fn save_render(&self, action_id: Uuid, text: &str) -> Result<bool, DatabaseError>;

    /// Count a failed render and push the action back. Returns the new
    /// render attempt count, or `None` if the action no longer exists.
    async fn record_render_failure(
        &self,
        action_id: Uuid,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError>;

    /// Record an attempt before the transport call. Returns the new attempt
    /// count, or `None` if the action no longer exists.
    async fn record_attempt(
        &self,
        action_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError>;

    /// Store the transport's id for the latest attempt.
    async fn mark_sent(&self, action_id: Uuid, attempt_id: &str) -> Result<bool, DatabaseError>;

    /// Return a `sending` action to the queue (reconciliation found no trace of it).
    async fn requeue_action(&self, action_id: Uuid) -> Result<bool, DatabaseError>;

    // ── Timers ──────────────────────────────────────────────────────

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<ReplyTimer>, DatabaseError>;

    async fn timers_for_lead(&self, lead_id: &str) -> Result<Vec<ReplyTimer>, DatabaseError>;

    async fn arm_timer(&self, timer: &ReplyTimer) -> Result<(), DatabaseError>;

    async fn delete_timer(&self, lead_id: &str, step: u32) -> Result<(), DatabaseError>;

    // ── History & scoring ───────────────────────────────────────────

    /// Transition history for a lead, oldest first.
    async fn list_transitions(
        &self,
        lead_id: &str,
        limit: usize,
    ) -> Result<Vec<TransitionRecord>, DatabaseError>;

    /// History across all leads with row id above `after_id`, oldest first.
    async fn transitions_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TransitionRecord>, DatabaseError>;

    /// Highest history row id, 0 when empty.
    async fn latest_transition_id(&self) -> Result<i64, DatabaseError>;

    /// Add a positive score delta. Returns the new score, or `None` if the
    /// lead is unknown or `transition_id` was already scored.
    async fn add_score(
        &self,
        lead_id: &str,
        delta: f64,
        kind: ScoreChangeKind,
        at: DateTime<Utc>,
        transition_id: Option<i64>,
    ) -> Result<Option<f64>, DatabaseError>;

    /// Subtract `penalty` (floored at zero) and move the decay anchor to `at`,
    /// only if the anchor still equals `decayed_since`. Returns the stored
    /// score, or `None` if another reader decayed first.
    async fn apply_decay(
        &self,
        lead_id: &str,
        penalty: f64,
        decayed_since: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, DatabaseError>;

    // ── Conversation log ────────────────────────────────────────────

    /// Append a message. Returns false if its message id was already stored.
    async fn append_message(&self, message: &ConversationMessage) -> Result<bool, DatabaseError>;

    /// The most recent `limit` messages for a lead, oldest first.
    async fn conversation(
        &self,
        lead_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, DatabaseError>;

    // ── Event idempotency ───────────────────────────────────────────

    /// Whether an idempotency key was already processed.
    async fn has_event_key(&self, key: &str) -> Result<bool, DatabaseError>;

    /// Remember an idempotency key. Returns false if it was already seen.
    async fn record_event_key(&self, key: &str, at: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Forget a key so a redelivery can be processed.
    async fn release_event_key(&self, key: &str) -> Result<(), DatabaseError>;
}
