//! Lead, action and event types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a lead is in its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ConversationState {
    New,
    AwaitingFirstSend,
    /// Follow-up step `n` is queued or in flight.
    Sent(u32),
    AwaitingReply,
    Replied,
    Converted,
    Stale,
    OptedOut,
}

impl ConversationState {
    /// Terminal states absorb every event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converted | Self::OptedOut)
    }

    /// States where an outbound send is expected to be outstanding.
    pub fn awaits_delivery(&self) -> bool {
        matches!(self, Self::AwaitingFirstSend | Self::Sent(_) | Self::Replied)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::AwaitingFirstSend => write!(f, "awaiting_first_send"),
            Self::Sent(n) => write!(f, "sent:{n}"),
            Self::AwaitingReply => write!(f, "awaiting_reply"),
            Self::Replied => write!(f, "replied"),
            Self::Converted => write!(f, "converted"),
            Self::Stale => write!(f, "stale"),
            Self::OptedOut => write!(f, "opted_out"),
        }
    }
}

impl FromStr for ConversationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(n) = s.strip_prefix("sent:") {
            return n
                .parse()
                .map(Self::Sent)
                .map_err(|_| format!("invalid step in state '{s}'"));
        }
        match s {
            "new" => Ok(Self::New),
            "awaiting_first_send" => Ok(Self::AwaitingFirstSend),
            "awaiting_reply" => Ok(Self::AwaitingReply),
            "replied" => Ok(Self::Replied),
            "converted" => Ok(Self::Converted),
            "stale" => Ok(Self::Stale),
            "opted_out" => Ok(Self::OptedOut),
            other => Err(format!("unknown conversation state '{other}'")),
        }
    }
}

impl From<ConversationState> for String {
    fn from(state: ConversationState) -> Self {
        state.to_string()
    }
}

impl TryFrom<String> for ConversationState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Why a lead went stale. Surfaced in reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// The last step's reply window elapsed.
    NoResponse,
    /// A non-positive reply arrived with no steps left.
    SequenceExhausted,
    /// The channel refused the message permanently.
    DeliveryFailed,
    /// Transient failures hit the attempt cap.
    RetriesExhausted,
    /// Text generation never produced a usable message.
    RenderFailed,
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoResponse => "no_response",
            Self::SequenceExhausted => "sequence_exhausted",
            Self::DeliveryFailed => "delivery_failed",
            Self::RetriesExhausted => "retries_exhausted",
            Self::RenderFailed => "render_failed",
        }
    }

    /// Failures an operator should look at, as opposed to a lead going quiet.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::DeliveryFailed | Self::RetriesExhausted | Self::RenderFailed
        )
    }
}

impl FromStr for StaleReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_response" => Ok(Self::NoResponse),
            "sequence_exhausted" => Ok(Self::SequenceExhausted),
            "delivery_failed" => Ok(Self::DeliveryFailed),
            "retries_exhausted" => Ok(Self::RetriesExhausted),
            "render_failed" => Ok(Self::RenderFailed),
            other => Err(format!("unknown stale reason '{other}'")),
        }
    }
}

/// Opaque reply classification supplied by the classifier collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyClassification {
    Positive,
    Neutral,
    Negative,
}

impl ReplyClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

impl FromStr for ReplyClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Ok(Self::Positive),
            "neutral" => Ok(Self::Neutral),
            "negative" => Ok(Self::Negative),
            other => Err(format!("unknown classification '{other}'")),
        }
    }
}

/// A lead record as supplied by the CRM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLead {
    pub id: String,
    pub name: String,
    /// Channel address (phone number).
    pub address: String,
    #[serde(default)]
    pub email: Option<String>,
    pub campaign_id: String,
    /// Original form data from the CRM, passed to the text generator.
    #[serde(default)]
    pub context: serde_json::Value,
}

/// A lead's durable conversation and scoring state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub name: String,
    pub address: String,
    pub email: Option<String>,
    pub campaign_id: String,
    pub variant_id: String,
    pub state: ConversationState,
    /// Step of the most recently created action.
    pub current_step: u32,
    pub score: f64,
    pub last_action_at: Option<DateTime<Utc>>,
    pub score_decayed_at: Option<DateTime<Utc>>,
    pub opted_out: bool,
    pub stale_reason: Option<StaleReason>,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(new: NewLead, variant_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            name: new.name,
            address: new.address,
            email: new.email,
            campaign_id: new.campaign_id,
            variant_id,
            state: ConversationState::New,
            current_step: 0,
            score: 0.0,
            last_action_at: None,
            score_decayed_at: None,
            opted_out: false,
            stale_reason: None,
            context: if new.context.is_null() {
                serde_json::json!({})
            } else {
                new.context
            },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle of an unresolved outbound action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting in the dispatcher queue.
    Queued,
    /// Attempt recorded, transport call not yet confirmed.
    Sending,
    /// Transport accepted the attempt; waiting for a receipt.
    Sent,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
        }
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            other => Err(format!("unknown action status '{other}'")),
        }
    }
}

/// A send the state machine asked for. Deleted from the store once resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundAction {
    pub id: Uuid,
    pub lead_id: String,
    pub campaign_id: String,
    pub step: u32,
    pub variant_id: String,
    pub rendered_text: Option<String>,
    /// Transport attempts made so far.
    pub attempts: u32,
    pub render_attempts: u32,
    pub status: ActionStatus,
    /// Transport id of the latest attempt.
    pub attempt_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl OutboundAction {
    pub fn new(lead: &Lead, step: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id: lead.id.clone(),
            campaign_id: lead.campaign_id.clone(),
            step,
            variant_id: lead.variant_id.clone(),
            rendered_text: None,
            attempts: 0,
            render_attempts: 0,
            status: ActionStatus::Queued,
            attempt_id: None,
            scheduled_at: now,
            created_at: now,
            last_attempt_at: None,
        }
    }

    /// Whether a receipt/failure event refers to this action.
    pub fn matches(&self, action_id: Option<Uuid>, attempt_id: Option<&str>) -> bool {
        match (action_id, attempt_id) {
            (Some(id), _) => id == self.id,
            (None, Some(attempt)) => self.attempt_id.as_deref() == Some(attempt),
            (None, None) => false,
        }
    }
}

/// What a `failed` event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Transport,
    Render,
}

/// Normalized event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Internal trigger for a freshly ingested lead.
    Ingested,
    Delivered {
        action_id: Option<Uuid>,
        attempt_id: Option<String>,
    },
    Failed {
        action_id: Option<Uuid>,
        attempt_id: Option<String>,
        retryable: bool,
        cause: FailureCause,
        reason: String,
    },
    Replied {
        text: String,
        classification: ReplyClassification,
    },
    TimedOut {
        step: u32,
    },
    OptedOut {
        source: String,
    },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ingested => "ingested",
            Self::Delivered { .. } => "delivered",
            Self::Failed { .. } => "failed",
            Self::Replied { .. } => "replied",
            Self::TimedOut { .. } => "timed_out",
            Self::OptedOut { .. } => "opted_out",
        }
    }
}

/// An event addressed to one lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub lead_id: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    /// Transport message id + kind, when the event came from the transport.
    pub idempotency_key: Option<String>,
}

impl Event {
    pub fn new(lead_id: impl Into<String>, kind: EventKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            lead_id: lead_id.into(),
            kind,
            occurred_at,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// One applied transition, persisted as history and fed to scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub lead_id: String,
    pub from: ConversationState,
    pub to: ConversationState,
    pub step: u32,
    pub trigger: String,
    pub classification: Option<ReplyClassification>,
    /// Seconds between the last outbound action and the reply.
    pub reply_latency_secs: Option<i64>,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
    /// History row id, assigned when the transition is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

/// Which way a conversation message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl FromStr for MessageDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("unknown message direction '{other}'")),
        }
    }
}

/// One message body exchanged with a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub lead_id: String,
    pub direction: MessageDirection,
    pub body: String,
    /// Transport message id; redeliveries with the same id are stored once.
    pub message_id: Option<String>,
    /// Sequence step for outbound messages.
    pub step: Option<u32>,
    pub at: DateTime<Utc>,
}

impl ConversationMessage {
    /// Prompt line form, e.g. `inbound: sounds good`.
    pub fn prompt_line(&self) -> String {
        format!("{}: {}", self.direction.as_str(), self.body)
    }
}
