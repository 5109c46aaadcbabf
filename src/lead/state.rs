//! Conversation state machine.
//!
//! `transition` is a pure function of the lead, its campaign, its unresolved
//! action (if any) and one event. It never touches the store; the
//! orchestrator applies the returned `Decision` atomically.

use chrono::{DateTime, Utc};

use crate::campaign::Campaign;
use crate::config::RetryPolicy;
use crate::error::EventError;
use crate::lead::model::{
    ActionStatus, ConversationState, Event, EventKind, FailureCause, Lead, OutboundAction,
    ReplyClassification, StaleReason,
};

/// Inputs to one transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub lead: &'a Lead,
    pub campaign: &'a Campaign,
    pub pending: Option<&'a OutboundAction>,
    pub delivery_retry: &'a RetryPolicy,
}

/// How the unresolved action leaves the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    Failed,
    Cancelled,
}

/// Reply-timeout timer effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Keep,
    Arm { step: u32, due_at: DateTime<Utc> },
    CancelAll,
}

/// Outcome of a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub next_state: ConversationState,
    /// Lead's current step after the transition.
    pub step: u32,
    pub resolve_pending: Option<Resolution>,
    /// Keep the pending action but retry it no earlier than this.
    pub retry_pending_at: Option<DateTime<Utc>>,
    /// Create an outbound action for this step.
    pub send_step: Option<u32>,
    pub timer: TimerCommand,
    pub stale_reason: Option<StaleReason>,
    /// The event counts as contact with the lead (delivery).
    pub touch_last_action: bool,
    /// Operator-facing failure description.
    pub surfaced_error: Option<String>,
    pub note: Option<String>,
}

impl Decision {
    fn stay(lead: &Lead) -> Self {
        Self {
            next_state: lead.state,
            step: lead.current_step,
            resolve_pending: None,
            retry_pending_at: None,
            send_step: None,
            timer: TimerCommand::Keep,
            stale_reason: None,
            touch_last_action: false,
            surfaced_error: None,
            note: None,
        }
    }

    fn to(lead: &Lead, next_state: ConversationState) -> Self {
        Self {
            next_state,
            ..Self::stay(lead)
        }
    }

    fn stale(lead: &Lead, reason: StaleReason) -> Self {
        Self {
            stale_reason: Some(reason),
            timer: TimerCommand::CancelAll,
            note: Some(reason.as_str().to_string()),
            ..Self::to(lead, ConversationState::Stale)
        }
    }

    /// Whether anything observable changes.
    pub fn is_noop(&self, lead: &Lead) -> bool {
        self.next_state == lead.state
            && self.step == lead.current_step
            && self.resolve_pending.is_none()
            && self.retry_pending_at.is_none()
            && self.send_step.is_none()
            && self.timer == TimerCommand::Keep
    }
}

/// Decide what an event does to a lead.
pub fn transition(ctx: TransitionContext<'_>, event: &Event) -> Result<Decision, EventError> {
    let lead = ctx.lead;
    let invalid = || EventError::InvalidTransition {
        lead_id: lead.id.clone(),
        state: lead.state.to_string(),
        event: event.kind.label().to_string(),
    };

    if lead.state.is_terminal() {
        return Err(invalid());
    }

    match &event.kind {
        EventKind::OptedOut { source } => Ok(Decision {
            resolve_pending: ctx.pending.map(|_| Resolution::Cancelled),
            timer: TimerCommand::CancelAll,
            note: Some(format!("opted out via {source}")),
            ..Decision::to(lead, ConversationState::OptedOut)
        }),

        EventKind::Ingested => {
            if lead.state != ConversationState::New || ctx.pending.is_some() {
                return Err(invalid());
            }
            Ok(Decision {
                step: 0,
                send_step: Some(0),
                ..Decision::to(lead, ConversationState::AwaitingFirstSend)
            })
        }

        EventKind::Delivered {
            action_id,
            attempt_id,
        } => {
            let pending = matching_pending(ctx, *action_id, attempt_id.as_deref())?;
            if !lead.state.awaits_delivery() {
                return Err(invalid());
            }
            Ok(delivered(ctx, pending, event.occurred_at))
        }

        EventKind::Failed {
            action_id,
            attempt_id,
            retryable,
            cause,
            reason,
        } => {
            let pending = matching_pending(ctx, *action_id, attempt_id.as_deref())?;
            Ok(failed(ctx, pending, *retryable, *cause, reason, event.occurred_at))
        }

        EventKind::Replied { classification, .. } => replied(ctx, *classification, event)
            .ok_or_else(invalid),

        EventKind::TimedOut { step } => {
            let eligible = lead.state == ConversationState::AwaitingReply
                && lead.current_step == *step
                && ctx.pending.is_none();
            if !eligible {
                return Err(invalid());
            }
            Ok(advance(ctx, *step, StaleReason::NoResponse, |next| {
                ConversationState::Sent(next)
            }))
        }
    }
}

fn matching_pending<'a>(
    ctx: TransitionContext<'a>,
    action_id: Option<uuid::Uuid>,
    attempt_id: Option<&str>,
) -> Result<&'a OutboundAction, EventError> {
    ctx.pending
        .filter(|p| p.matches(action_id, attempt_id))
        .ok_or_else(|| EventError::Duplicate {
            key: action_id
                .map(|id| id.to_string())
                .or_else(|| attempt_id.map(str::to_string))
                .unwrap_or_else(|| format!("{}:unaddressed", ctx.lead.id)),
        })
}

fn delivered(ctx: TransitionContext<'_>, pending: &OutboundAction, at: DateTime<Utc>) -> Decision {
    Decision {
        step: pending.step,
        resolve_pending: Some(Resolution::Delivered),
        timer: TimerCommand::Arm {
            step: pending.step,
            due_at: at + ctx.campaign.wait_for(pending.step),
        },
        touch_last_action: true,
        ..Decision::to(ctx.lead, ConversationState::AwaitingReply)
    }
}

fn failed(
    ctx: TransitionContext<'_>,
    pending: &OutboundAction,
    retryable: bool,
    cause: FailureCause,
    reason: &str,
    at: DateTime<Utc>,
) -> Decision {
    if cause == FailureCause::Transport
        && retryable
        && ctx.delivery_retry.allows_another(pending.attempts)
    {
        let delay = ctx.delivery_retry.backoff_for_attempt(pending.attempts);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        return Decision {
            retry_pending_at: Some(at + delay),
            note: Some(format!("retry after attempt {}: {reason}", pending.attempts)),
            ..Decision::stay(ctx.lead)
        };
    }

    let stale_reason = match cause {
        FailureCause::Render => StaleReason::RenderFailed,
        FailureCause::Transport if retryable => StaleReason::RetriesExhausted,
        FailureCause::Transport => StaleReason::DeliveryFailed,
    };
    Decision {
        resolve_pending: Some(Resolution::Failed),
        surfaced_error: Some(format!(
            "step {} for lead {} failed after {} attempt(s): {reason}",
            pending.step, ctx.lead.id, pending.attempts
        )),
        ..Decision::stale(ctx.lead, stale_reason)
    }
}

fn replied(
    ctx: TransitionContext<'_>,
    classification: ReplyClassification,
    event: &Event,
) -> Option<Decision> {
    let lead = ctx.lead;
    let positive = classification == ReplyClassification::Positive;

    match lead.state {
        ConversationState::AwaitingReply if ctx.pending.is_none() => {
            Some(after_reply(ctx, lead.current_step, positive))
        }
        ConversationState::AwaitingFirstSend
        | ConversationState::Sent(_)
        | ConversationState::Replied => {
            let pending = ctx.pending?;
            if pending.status == ActionStatus::Sent {
                // A reply to a message we handed off proves it was delivered.
                let mut decision = after_reply(ctx, pending.step, positive);
                decision.resolve_pending = Some(Resolution::Delivered);
                decision.touch_last_action = true;
                return Some(decision);
            }
            if positive {
                Some(Decision {
                    resolve_pending: Some(Resolution::Cancelled),
                    timer: TimerCommand::CancelAll,
                    note: Some("positive reply before send".to_string()),
                    ..Decision::to(lead, ConversationState::Converted)
                })
            } else {
                Some(Decision {
                    note: Some(format!(
                        "{} reply absorbed while step {} queued",
                        classification.as_str(),
                        pending.step
                    )),
                    ..Decision::stay(lead)
                })
            }
        }
        ConversationState::Stale if positive => Some(Decision {
            stale_reason: None,
            timer: TimerCommand::CancelAll,
            note: Some(format!("revived by reply at {}", event.occurred_at.to_rfc3339())),
            ..Decision::to(lead, ConversationState::Converted)
        }),
        _ => None,
    }
}

fn after_reply(ctx: TransitionContext<'_>, step: u32, positive: bool) -> Decision {
    if positive {
        return Decision {
            step,
            timer: TimerCommand::CancelAll,
            ..Decision::to(ctx.lead, ConversationState::Converted)
        };
    }
    advance(ctx, step, StaleReason::SequenceExhausted, |_| {
        ConversationState::Replied
    })
}

/// Move to step + 1 if the campaign has it, otherwise go stale.
fn advance(
    ctx: TransitionContext<'_>,
    step: u32,
    exhausted: StaleReason,
    next_state: impl FnOnce(u32) -> ConversationState,
) -> Decision {
    let next = step + 1;
    if ctx.campaign.has_step(next) {
        Decision {
            step: next,
            send_step: Some(next),
            timer: TimerCommand::CancelAll,
            ..Decision::to(ctx.lead, next_state(next))
        }
    } else {
        Decision {
            step,
            ..Decision::stale(ctx.lead, exhausted)
        }
    }
}
