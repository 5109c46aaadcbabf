//! Shared stubs and wiring for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use lead_engage::campaign::{Campaign, CampaignCatalog, CampaignStep, VariantRule};
use lead_engage::channels::{AttemptReceipt, ChannelTransport, ReceiptStatus};
use lead_engage::config::{PolicyConfig, RateBudget, RetryPolicy, ScoringPolicy};
use lead_engage::dispatch::{DispatchPolicy, Dispatcher};
use lead_engage::error::{DeliveryError, RenderError};
use lead_engage::ingest::{IngestRouter, opt_out_pattern};
use lead_engage::lead::{Event, Lead, NewLead, ReplyClassification};
use lead_engage::llm::{RenderRequest, ReplyClassifier, TemplateRenderer, TextGenerator};
use lead_engage::orchestrator::Orchestrator;
use lead_engage::scoring::ScoringEngine;
use lead_engage::store::{LeadStore, LibSqlBackend};
use lead_engage::timers::TimerService;

/// One message handed to the stub transport.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub attempt_id: String,
    pub address: String,
    pub text: String,
}

/// Transport that records sends and replays scripted failures.
#[derive(Default)]
pub struct StubTransport {
    pub sent: Mutex<Vec<SentMessage>>,
    /// Failures returned by the next sends, in order.
    pub failures: Mutex<VecDeque<DeliveryError>>,
    /// Receipt status per attempt id.
    pub statuses: Mutex<HashMap<String, ReceiptStatus>>,
    /// Attempts the transport knows about but this process never recorded.
    pub history: Mutex<Vec<(String, AttemptReceipt)>>,
    pub calls: AtomicUsize,
}

impl StubTransport {
    pub fn fail_next(&self, count: usize, error: DeliveryError) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn transient() -> DeliveryError {
    DeliveryError::Transient {
        channel: "stub".into(),
        reason: "503 service unavailable".into(),
    }
}

#[async_trait]
impl ChannelTransport for StubTransport {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send(&self, address: &str, text: &str) -> Result<String, DeliveryError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let attempt_id = format!("SM{n:04}");
        self.sent.lock().unwrap().push(SentMessage {
            attempt_id: attempt_id.clone(),
            address: address.to_string(),
            text: text.to_string(),
        });
        Ok(attempt_id)
    }

    async fn attempt_status(
        &self,
        attempt_id: &str,
    ) -> Result<Option<ReceiptStatus>, DeliveryError> {
        if let Some(status) = self.statuses.lock().unwrap().get(attempt_id) {
            return Ok(Some(status.clone()));
        }
        let known = self
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.attempt_id == attempt_id);
        Ok(known.then_some(ReceiptStatus::Pending))
    }

    async fn find_recent_attempt(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttemptReceipt>, DeliveryError> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, receipt)| to == address && receipt.sent_at >= since)
            .map(|(_, receipt)| receipt.clone())
            .max_by_key(|receipt| receipt.sent_at))
    }

    fn default_fatal_codes(&self) -> Vec<String> {
        vec!["21211".into()]
    }
}

/// Classifies by keyword: "yes" is positive, "no" negative, anything else neutral.
pub struct KeywordClassifier;

#[async_trait]
impl ReplyClassifier for KeywordClassifier {
    async fn classify(
        &self,
        text: &str,
        _lead: &Lead,
    ) -> Result<ReplyClassification, RenderError> {
        let lower = text.to_lowercase();
        Ok(if lower.contains("yes") {
            ReplyClassification::Positive
        } else if lower.split_whitespace().any(|w| w == "no") {
            ReplyClassification::Negative
        } else {
            ReplyClassification::Neutral
        })
    }
}

/// Generator whose every render fails with a retryable error.
#[derive(Default)]
pub struct FailingGenerator {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TextGenerator for FailingGenerator {
    fn name(&self) -> &str {
        "failing"
    }

    async fn render(&self, _request: RenderRequest<'_>) -> Result<String, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RenderError::RequestFailed {
            provider: "failing".into(),
            reason: "upstream timeout".into(),
        })
    }
}

/// Renders the step template and remembers the history each render saw.
#[derive(Default)]
pub struct RecordingGenerator {
    pub histories: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl TextGenerator for RecordingGenerator {
    fn name(&self) -> &str {
        "recording"
    }

    async fn render(&self, request: RenderRequest<'_>) -> Result<String, RenderError> {
        let lines = request.history.iter().map(|m| m.prompt_line()).collect();
        self.histories.lock().unwrap().push(lines);
        TemplateRenderer.render(request).await
    }
}

pub fn campaign(id: &str, steps: usize, wait_secs: u64, budget: RateBudget) -> Campaign {
    Campaign {
        id: id.into(),
        name: format!("Campaign {id}"),
        description: None,
        is_active: true,
        steps: (0..steps)
            .map(|i| CampaignStep {
                template: format!("Hi {{first_name}}, message {} of {steps}", i + 1),
                wait_secs,
                variant_templates: Default::default(),
            })
            .collect(),
        variants: VariantRule::Single,
        rate_budget: budget,
    }
}

pub fn policy(campaigns: Vec<Campaign>) -> PolicyConfig {
    PolicyConfig {
        delivery_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: false,
        },
        render_retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: false,
        },
        scoring: ScoringPolicy {
            delivered_increment: 1.0,
            positive_reply_base: 10.0,
            fast_reply_window_secs: 3_600,
            decay_threshold_secs: 86_400,
            decay_per_day: 1.0,
        },
        channel_budget: RateBudget {
            max_sends: 100,
            window_secs: 60,
        },
        max_queue_depth: 1_000,
        opt_out_keywords: vec!["STOP".into(), "unsubscribe".into()],
        fatal_error_codes: Vec::new(),
        campaigns,
    }
}

pub fn budget(max_sends: u32) -> RateBudget {
    RateBudget {
        max_sends,
        window_secs: 60,
    }
}

pub fn new_lead(id: &str, phone: &str, campaign_id: &str) -> NewLead {
    NewLead {
        id: id.into(),
        name: format!("Lead {id}"),
        address: phone.into(),
        email: None,
        campaign_id: campaign_id.into(),
        context: serde_json::json!({ "source": "facebook" }),
    }
}

/// Fully wired orchestrator over stub collaborators.
pub struct Harness {
    pub store: Arc<dyn LeadStore>,
    pub transport: Arc<StubTransport>,
    pub dispatcher: Arc<Dispatcher>,
    pub orchestrator: Arc<Orchestrator>,
    pub router: Arc<IngestRouter>,
    pub timers: TimerService,
    pub scoring: Arc<ScoringEngine>,
    pub events: mpsc::Receiver<Event>,
}

impl Harness {
    pub async fn new(policy: PolicyConfig) -> Self {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Self::with_store(store, Arc::new(StubTransport::default()), policy)
    }

    pub async fn with_generator(policy: PolicyConfig, generator: Arc<dyn TextGenerator>) -> Self {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Self::build(store, Arc::new(StubTransport::default()), generator, policy)
    }

    pub fn with_store(
        store: Arc<dyn LeadStore>,
        transport: Arc<StubTransport>,
        policy: PolicyConfig,
    ) -> Self {
        Self::build(store, transport, Arc::new(TemplateRenderer), policy)
    }

    pub fn build(
        store: Arc<dyn LeadStore>,
        transport: Arc<StubTransport>,
        generator: Arc<dyn TextGenerator>,
        policy: PolicyConfig,
    ) -> Self {
        let catalog = Arc::new(CampaignCatalog::new(policy.campaigns.clone()));
        let (events_tx, events) = mpsc::channel(1024);
        let dispatch_policy = DispatchPolicy::from_config(&policy, transport.as_ref());
        let fatal_codes = dispatch_policy.fatal_error_codes.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            transport.clone(),
            generator,
            dispatch_policy,
            events_tx,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            catalog,
            Arc::clone(&dispatcher),
            policy.delivery_retry.clone(),
        ));
        let router = Arc::new(IngestRouter::new(
            Arc::clone(&orchestrator),
            Arc::new(KeywordClassifier),
            opt_out_pattern(&policy.opt_out_keywords).unwrap(),
            fatal_codes,
        ));
        let timers = TimerService::new(Arc::clone(&store), Arc::clone(&router));
        let scoring = Arc::new(ScoringEngine::new(Arc::clone(&store), policy.scoring.clone()));

        Self {
            store,
            transport,
            dispatcher,
            orchestrator,
            router,
            timers,
            scoring,
            events,
        }
    }

    /// Feed dispatcher outcomes back into the orchestrator.
    pub async fn pump(&mut self) -> usize {
        self.orchestrator.drain_events(&mut self.events).await
    }

    /// One dispatch pass at `now`, then apply its outcomes.
    pub async fn dispatch(&mut self, now: DateTime<Utc>) -> usize {
        let sent = self.dispatcher.run_once(now).await;
        self.pump().await;
        sent
    }

    pub async fn lead(&self, id: &str) -> Lead {
        self.store.get_lead(id).await.unwrap().unwrap()
    }

    /// Attempt id of the lead's unresolved action.
    pub async fn attempt_id(&self, lead_id: &str) -> String {
        self.store
            .get_pending_action(lead_id)
            .await
            .unwrap()
            .and_then(|a| a.attempt_id)
            .unwrap()
    }
}
