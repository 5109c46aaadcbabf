//! Event ingestion router: turns transport webhooks, opt-out requests and
//! timer firings into lead events.

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::channels::{ReceiptStatus, is_retryable_code, normalize_address};
use crate::error::{ConfigError, Error, EventError};
use crate::lead::{
    ConversationMessage, Event, EventKind, FailureCause, MessageDirection, ReplyClassification,
};
use crate::llm::ReplyClassifier;
use crate::orchestrator::{Orchestrator, Outcome};
use crate::store::{LeadStore, ReplyTimer};

/// Whole-word, case-insensitive match on any keyword. `None` for an empty list.
pub fn opt_out_pattern(keywords: &[String]) -> Result<Option<Regex>, ConfigError> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: "opt_out_keywords".into(),
            message: e.to_string(),
        })
}

pub struct IngestRouter {
    orchestrator: Arc<Orchestrator>,
    classifier: Arc<dyn ReplyClassifier>,
    opt_out: Option<Regex>,
    fatal_codes: Vec<String>,
}

impl IngestRouter {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        classifier: Arc<dyn ReplyClassifier>,
        opt_out: Option<Regex>,
        fatal_codes: Vec<String>,
    ) -> Self {
        Self {
            orchestrator,
            classifier,
            opt_out,
            fatal_codes,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn store(&self) -> &Arc<dyn LeadStore> {
        self.orchestrator.store()
    }

    fn unresolved(&self) -> Outcome {
        self.orchestrator
            .stats()
            .unresolved
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Outcome::Ignored
    }

    /// Delivery receipt for a transport attempt.
    pub async fn receipt(
        &self,
        attempt_id: &str,
        status: &str,
        error_code: Option<&str>,
    ) -> Result<Outcome, Error> {
        if attempt_id.trim().is_empty() {
            return Err(EventError::Malformed("receipt without a message id".into()).into());
        }

        let (label, kind) = match ReceiptStatus::from_transport(status, error_code) {
            ReceiptStatus::Pending => {
                debug!(attempt_id, status, "Intermediate receipt ignored");
                return Ok(Outcome::Ignored);
            }
            ReceiptStatus::Delivered => (
                "delivered",
                EventKind::Delivered {
                    action_id: None,
                    attempt_id: Some(attempt_id.to_string()),
                },
            ),
            ReceiptStatus::Failed { error_code } => (
                "failed",
                EventKind::Failed {
                    action_id: None,
                    attempt_id: Some(attempt_id.to_string()),
                    retryable: is_retryable_code(error_code.as_deref(), &self.fatal_codes),
                    reason: format!(
                        "receipt {status} (code {})",
                        error_code.as_deref().unwrap_or("none")
                    ),
                    cause: FailureCause::Transport,
                },
            ),
        };

        // A redelivered receipt's action is usually resolved by now.
        let key = format!("{attempt_id}:{label}");
        if self.store().has_event_key(&key).await? {
            debug!(attempt_id, status, "Duplicate receipt");
            self.orchestrator
                .stats()
                .duplicates
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(Outcome::Duplicate);
        }

        let Some(action) = self.store().find_action_by_attempt(attempt_id).await? else {
            debug!(attempt_id, status, "Receipt for no unresolved attempt");
            return Ok(self.unresolved());
        };

        let event = Event::new(action.lead_id, kind, Utc::now()).with_idempotency_key(key);
        self.orchestrator.handle_event(event).await
    }

    /// Inbound message from a lead.
    pub async fn inbound(
        &self,
        message_id: &str,
        from: &str,
        body: &str,
    ) -> Result<Outcome, Error> {
        let address = normalize_address(from);
        if address.is_empty() || message_id.trim().is_empty() {
            return Err(EventError::Malformed(format!("inbound message from '{from}'")).into());
        }
        let Some(lead) = self.store().find_lead_by_address(&address).await? else {
            warn!(address = %address, "Inbound message from unknown address");
            return Ok(self.unresolved());
        };

        let message = ConversationMessage {
            lead_id: lead.id.clone(),
            direction: MessageDirection::Inbound,
            body: body.to_string(),
            message_id: Some(message_id.to_string()),
            step: None,
            at: Utc::now(),
        };
        if !self.store().append_message(&message).await? {
            debug!(lead_id = %lead.id, message_id, "Inbound message already logged");
        }

        if self.opt_out.as_ref().is_some_and(|re| re.is_match(body)) {
            info!(lead_id = %lead.id, "Opt-out keyword received");
            let event = Event::new(
                lead.id,
                EventKind::OptedOut {
                    source: "keyword".into(),
                },
                Utc::now(),
            )
            .with_idempotency_key(format!("{message_id}:opted_out"));
            return self.orchestrator.handle_event(event).await;
        }

        let classification = if lead.state.is_terminal() {
            // Discarded downstream; no need to classify.
            ReplyClassification::Neutral
        } else {
            match self.classifier.classify(body, &lead).await {
                Ok(classification) => classification,
                Err(e) => {
                    warn!(lead_id = %lead.id, error = %e, "Reply classification failed, treating as neutral");
                    ReplyClassification::Neutral
                }
            }
        };
        debug!(lead_id = %lead.id, classification = classification.as_str(), "Reply classified");

        let event = Event::new(
            lead.id,
            EventKind::Replied {
                text: body.to_string(),
                classification,
            },
            Utc::now(),
        )
        .with_idempotency_key(format!("{message_id}:replied"));
        self.orchestrator.handle_event(event).await
    }

    /// Operator or CRM opt-out request.
    pub async fn manual_opt_out(
        &self,
        lead_id: &str,
        request_id: Option<&str>,
    ) -> Result<Outcome, Error> {
        if self.store().get_lead(lead_id).await?.is_none() {
            warn!(lead_id, "Opt-out for unknown lead");
            return Ok(self.unresolved());
        }
        let mut event = Event::new(
            lead_id,
            EventKind::OptedOut {
                source: "manual".into(),
            },
            Utc::now(),
        );
        if let Some(request_id) = request_id.filter(|r| !r.trim().is_empty()) {
            event = event.with_idempotency_key(format!("{request_id}:opted_out"));
        }
        self.orchestrator.handle_event(event).await
    }

    /// A reply timer came due. The event is dated at the timer's due time.
    pub async fn timed_out(&self, timer: &ReplyTimer) -> Result<Outcome, Error> {
        let event = Event::new(
            timer.lead_id.clone(),
            EventKind::TimedOut { step: timer.step },
            timer.due_at,
        );
        self.orchestrator.handle_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn opt_out_matches_whole_words_case_insensitively() {
        let re = opt_out_pattern(&keywords(&["STOP", "unsubscribe"]))
            .unwrap()
            .unwrap();
        assert!(re.is_match("stop"));
        assert!(re.is_match("Please STOP messaging me"));
        assert!(re.is_match("Unsubscribe."));
        assert!(!re.is_match("unstoppable deal"));
        assert!(!re.is_match("sounds good"));
    }

    #[test]
    fn empty_keyword_list_disables_opt_out() {
        assert!(opt_out_pattern(&[]).unwrap().is_none());
        assert!(opt_out_pattern(&keywords(&["  "])).unwrap().is_none());
    }

    #[test]
    fn keywords_are_escaped() {
        let re = opt_out_pattern(&keywords(&["opt.out"])).unwrap().unwrap();
        assert!(re.is_match("opt.out"));
        assert!(!re.is_match("optXout"));
    }
}
