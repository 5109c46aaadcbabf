//! HTTP surface: CRM intake, channel webhooks and the read-only reporting API.

pub mod reporting;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::{StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
};
use secrecy::SecretString;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{CampaignError, Error, EventError};
use crate::ingest::IngestRouter;
use crate::orchestrator::Orchestrator;
use crate::scoring::ScoringEngine;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<IngestRouter>,
    pub orchestrator: Arc<Orchestrator>,
    /// Applies score decay to leads read through reporting.
    pub scoring: Arc<ScoringEngine>,
    /// Channel webhook signature check. Unverified when `None`.
    pub webhook_auth: Option<Arc<WebhookAuth>>,
}

/// Secret and public base URL the channel signs its callbacks with.
#[derive(Debug, Clone)]
pub struct WebhookAuth {
    pub auth_token: SecretString,
    /// Externally visible origin, e.g. `https://leads.example.com`.
    pub public_url: String,
}

impl WebhookAuth {
    /// The URL the sender signed for a request received at `uri`.
    pub fn callback_url(&self, uri: &Uri) -> String {
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        format!("{}{path}", self.public_url.trim_end_matches('/'))
    }
}

/// Build the Axum router with webhook and reporting routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/crm/leads", post(webhooks::crm_lead))
        .route("/webhooks/channel/status", post(webhooks::channel_status))
        .route("/webhooks/channel/inbound", post(webhooks::channel_inbound))
        .route("/webhooks/opt-out", post(webhooks::opt_out))
        .route("/api/leads", get(reporting::list_leads))
        .route("/api/leads/{id}", get(reporting::get_lead))
        .route("/api/leads/{id}/transitions", get(reporting::lead_transitions))
        .route("/api/leads/{id}/messages", get(reporting::lead_messages))
        .route("/api/stats", get(reporting::stats))
        .layer(cors)
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lead-engage"
    }))
}

/// Map an orchestrator error to a response. Systemic failures return 503 so
/// the sender redelivers.
pub(crate) fn error_response(e: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        _ if e.is_systemic() => StatusCode::SERVICE_UNAVAILABLE,
        Error::Event(EventError::Malformed(_)) => StatusCode::BAD_REQUEST,
        Error::Event(EventError::UnknownLead { .. }) => StatusCode::NOT_FOUND,
        Error::Campaign(CampaignError::NotFound { .. } | CampaignError::Inactive { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}
