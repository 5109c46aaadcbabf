//! Read-only reporting over lead state, score and history.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use super::{AppState, error_response};
use crate::error::Error;
use crate::lead::ConversationState;
use crate::store::LeadFilter;

const DEFAULT_LEAD_LIMIT: usize = 100;
const MAX_LEAD_LIMIT: usize = 1000;
const DEFAULT_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct LeadQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub campaign: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_leads(
    State(state): State<AppState>,
    Query(query): Query<LeadQuery>,
) -> impl IntoResponse {
    if let Some(s) = query.state.as_deref()
        && s != "sent"
        && s.parse::<ConversationState>().is_err()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("unknown state '{s}'") })),
        );
    }

    let filter = LeadFilter {
        state: query.state,
        campaign_id: query.campaign,
        limit: Some(query.limit.unwrap_or(DEFAULT_LEAD_LIMIT).clamp(1, MAX_LEAD_LIMIT)),
    };
    let leads = match state.orchestrator.store().list_leads(&filter).await {
        Ok(leads) => leads,
        Err(e) => return error_response(&Error::from(e)),
    };

    let now = Utc::now();
    let mut scored = Vec::with_capacity(leads.len());
    for lead in leads {
        match state.scoring.read_lead(lead, now).await {
            Ok(lead) => scored.push(lead),
            Err(e) => return error_response(&Error::from(e)),
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "count": scored.len(), "leads": scored })),
    )
}

pub async fn get_lead(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let store = state.orchestrator.store();
    let lead = match store.get_lead(&id).await {
        Ok(Some(lead)) => lead,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "Lead not found" })),
            );
        }
        Err(e) => return error_response(&Error::from(e)),
    };
    let lead = match state.scoring.read_lead(lead, Utc::now()).await {
        Ok(lead) => lead,
        Err(e) => return error_response(&Error::from(e)),
    };

    let pending = store.get_pending_action(&id).await;
    let timers = store.timers_for_lead(&id).await;
    let (pending, timers) = match (pending, timers) {
        (Ok(pending), Ok(timers)) => (pending, timers),
        (Err(e), _) | (_, Err(e)) => return error_response(&Error::from(e)),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "lead": lead,
            "pending_action": pending,
            "timers": timers,
        })),
    )
}

pub async fn lead_transitions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(1);
    match state.orchestrator.store().list_transitions(&id, limit).await {
        Ok(records) => (
            StatusCode::OK,
            Json(serde_json::json!({ "lead_id": id, "transitions": records })),
        ),
        Err(e) => error_response(&Error::from(e)),
    }
}

pub async fn lead_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(1);
    match state.orchestrator.store().conversation(&id, limit).await {
        Ok(messages) => (
            StatusCode::OK,
            Json(serde_json::json!({ "lead_id": id, "messages": messages })),
        ),
        Err(e) => error_response(&Error::from(e)),
    }
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let states = match state.orchestrator.store().state_counts().await {
        Ok(counts) => counts
            .into_iter()
            .map(|(state, count)| (state, serde_json::Value::from(count)))
            .collect::<serde_json::Map<String, serde_json::Value>>(),
        Err(e) => {
            warn!(error = %e, "State counts unavailable");
            return error_response(&Error::from(e));
        }
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "orchestrator": state.orchestrator.stats().snapshot(),
            "dispatch": state.orchestrator.dispatcher().stats_snapshot().await,
            "states": states,
        })),
    )
}
