use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use lead_engage::api::{self, AppState, WebhookAuth};
use lead_engage::campaign::CampaignCatalog;
use lead_engage::channels::{ChannelTransport, TwilioConfig, TwilioWhatsApp};
use lead_engage::config::{PolicyConfig, ServiceConfig};
use lead_engage::dispatch::{DispatchPolicy, Dispatcher, spawn_dispatch_loop};
use lead_engage::ingest::{IngestRouter, opt_out_pattern};
use lead_engage::lead::{Event, ReplyClassification};
use lead_engage::llm::{
    FixedClassifier, OpenAiClient, OpenAiConfig, ReplyClassifier, TemplateRenderer, TextGenerator,
};
use lead_engage::orchestrator::{Orchestrator, spawn_event_pump};
use lead_engage::scoring::{ScoringEngine, spawn_scoring_subscriber};
use lead_engage::store::{LeadStore, LibSqlBackend};
use lead_engage::timers::{TimerService, spawn_timer_ticker};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Stderr logging, or a daily-rotating file when a log directory is set.
fn init_logging(config: &ServiceConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(log_dir) = &config.log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "lead-engage.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(file_writer)
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("reading service configuration")?;
    let _log_guard = init_logging(&config)?;

    let policy = PolicyConfig::load(&config.policy_path)
        .with_context(|| format!("loading policy file {}", config.policy_path.display()))?;

    eprintln!("📨 Lead Engage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Policy: {}", config.policy_path.display());
    eprintln!("   Campaigns: {}", policy.campaigns.len());

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Collaborators ────────────────────────────────────────────────────
    let catalog = Arc::new(CampaignCatalog::new(policy.campaigns.clone()));
    let twilio = TwilioConfig::from_env().context("configuring the WhatsApp transport")?;
    let webhook_auth = match &config.public_url {
        Some(url) => {
            eprintln!("   Webhooks: signed callbacks from {url}");
            Some(Arc::new(WebhookAuth {
                auth_token: twilio.auth_token.clone(),
                public_url: url.clone(),
            }))
        }
        None => {
            tracing::warn!("LEAD_ENGAGE_PUBLIC_URL not set, channel webhook signatures are not checked");
            None
        }
    };
    let transport: Arc<dyn ChannelTransport> = Arc::new(TwilioWhatsApp::new(twilio));

    let (generator, classifier): (Arc<dyn TextGenerator>, Arc<dyn ReplyClassifier>) =
        match OpenAiConfig::from_env() {
            Some(openai) => {
                let client = Arc::new(OpenAiClient::new(openai));
                eprintln!("   Generator: openai ({})", client.model_name());
                let generator: Arc<dyn TextGenerator> = client.clone();
                let classifier: Arc<dyn ReplyClassifier> = client;
                (generator, classifier)
            }
            None => {
                eprintln!("   Generator: template only (OPENAI_API_KEY not set)");
                let generator: Arc<dyn TextGenerator> = Arc::new(TemplateRenderer);
                let classifier: Arc<dyn ReplyClassifier> =
                    Arc::new(FixedClassifier(ReplyClassification::Neutral));
                (generator, classifier)
            }
        };

    // ── Orchestrator ─────────────────────────────────────────────────────
    let (events_tx, events_rx) = tokio::sync::mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
    let dispatch_policy = DispatchPolicy::from_config(&policy, transport.as_ref());
    let fatal_codes = dispatch_policy.fatal_error_codes.clone();
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::clone(&catalog),
        Arc::clone(&transport),
        generator,
        dispatch_policy,
        events_tx,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::clone(&catalog),
        Arc::clone(&dispatcher),
        policy.delivery_retry.clone(),
    ));

    let scoring = Arc::new(ScoringEngine::new(store.clone(), policy.scoring.clone()));
    let transitions = orchestrator.subscribe();
    let scored_through = store
        .latest_transition_id()
        .await
        .context("reading transition history")?;
    let _scoring_handle =
        spawn_scoring_subscriber(Arc::clone(&scoring), transitions, scored_through);
    let _pump_handle = spawn_event_pump(Arc::clone(&orchestrator), events_rx);

    let router = Arc::new(IngestRouter::new(
        Arc::clone(&orchestrator),
        classifier,
        opt_out_pattern(&policy.opt_out_keywords)?,
        fatal_codes,
    ));

    // ── Startup Recovery ─────────────────────────────────────────────────
    let report = orchestrator
        .recover(Utc::now())
        .await
        .context("startup recovery")?;
    eprintln!(
        "   Recovery: {} requeued, {} adopted, {} resolved, {} timers re-armed",
        report.reconcile.requeued,
        report.reconcile.adopted,
        report.reconcile.resolved,
        report.timers_rearmed
    );

    let _dispatch_handle = spawn_dispatch_loop(Arc::clone(&dispatcher), config.dispatch_interval);
    let timers = Arc::new(TimerService::new(store.clone(), Arc::clone(&router)));
    let _timer_handle = spawn_timer_ticker(timers, config.timer_interval);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::routes(AppState {
        router,
        orchestrator,
        scoring,
        webhook_auth,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    eprintln!("   HTTP: http://0.0.0.0:{}\n", config.port);
    tracing::info!(port = config.port, "Lead Engage started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
        })
        .await
        .context("HTTP server")?;

    Ok(())
}
