//! Inbound webhooks: CRM lead intake, channel receipts and replies, opt-outs.

use axum::{
    Form, Json,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::IntoResponse,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Deserializer};
use tracing::{error, warn};

use super::{AppState, error_response};
use crate::channels::twilio::validate_signature;
use crate::lead::NewLead;
use crate::orchestrator::Outcome;

const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

/// Form-encoded callback fields, in arrival order.
type FormParams = Vec<(String, String)>;

fn param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

/// Lead as posted by the CRM.
#[derive(Debug, Deserialize)]
pub struct CrmLead {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    pub campaign_id: String,
    #[serde(default)]
    pub lead_data: serde_json::Value,
}

/// CRM ids arrive as either JSON strings or integers.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// Delivery receipt callback.
#[derive(Debug)]
pub struct StatusCallback {
    pub message_sid: String,
    pub message_status: String,
    pub error_code: Option<String>,
}

impl StatusCallback {
    pub fn from_params(params: &[(String, String)]) -> Self {
        Self {
            message_sid: param(params, "MessageSid").unwrap_or_default(),
            message_status: param(params, "MessageStatus").unwrap_or_default(),
            error_code: param(params, "ErrorCode").filter(|c| !c.is_empty()),
        }
    }
}

/// Inbound message callback.
#[derive(Debug)]
pub struct InboundMessage {
    pub message_sid: String,
    pub from: String,
    pub body: String,
}

impl InboundMessage {
    pub fn from_params(params: &[(String, String)]) -> Self {
        Self {
            message_sid: param(params, "MessageSid").unwrap_or_default(),
            from: param(params, "From").unwrap_or_default(),
            body: param(params, "Body").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OptOutRequest {
    #[serde(deserialize_with = "string_or_number")]
    pub lead_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

pub async fn crm_lead(State(state): State<AppState>, Json(body): Json<CrmLead>) -> impl IntoResponse {
    let lead_id = body.id.clone();
    let new = NewLead {
        id: body.id,
        name: body.name,
        address: body.phone,
        email: body.email,
        campaign_id: body.campaign_id,
        context: body.lead_data,
    };
    match state.orchestrator.ingest_lead(new).await {
        Ok(true) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "lead_id": lead_id, "status": "accepted" })),
        ),
        Ok(false) => (
            StatusCode::OK,
            Json(serde_json::json!({ "lead_id": lead_id, "status": "already_known" })),
        ),
        Err(e) => {
            warn!(lead_id = %lead_id, error = %e, "Lead intake rejected");
            error_response(&e)
        }
    }
}

/// Reject a channel callback whose signature does not match. Passes when
/// no webhook auth is configured.
fn signature_rejection(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    params: &[(String, String)],
) -> Option<(StatusCode, Json<serde_json::Value>)> {
    let auth = state.webhook_auth.as_ref()?;
    let url = auth.callback_url(uri);
    let valid = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|sig| validate_signature(auth.auth_token.expose_secret(), &url, params, sig));
    if valid {
        return None;
    }
    warn!(url = %url, "Channel webhook signature rejected");
    Some((
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "error": "invalid signature" })),
    ))
}

pub async fn channel_status(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Form(params): Form<FormParams>,
) -> impl IntoResponse {
    if let Some(rejection) = signature_rejection(&state, &uri, &headers, &params) {
        return rejection;
    }
    let callback = StatusCallback::from_params(&params);
    let result = state
        .router
        .receipt(
            &callback.message_sid,
            &callback.message_status,
            callback.error_code.as_deref(),
        )
        .await;
    outcome_response(result, &callback.message_sid)
}

pub async fn channel_inbound(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Form(params): Form<FormParams>,
) -> impl IntoResponse {
    if let Some(rejection) = signature_rejection(&state, &uri, &headers, &params) {
        return rejection;
    }
    let message = InboundMessage::from_params(&params);
    let result = state
        .router
        .inbound(&message.message_sid, &message.from, &message.body)
        .await;
    outcome_response(result, &message.message_sid)
}

pub async fn opt_out(
    State(state): State<AppState>,
    Json(request): Json<OptOutRequest>,
) -> impl IntoResponse {
    let result = state
        .router
        .manual_opt_out(&request.lead_id, request.request_id.as_deref())
        .await;
    outcome_response(result, &request.lead_id)
}

/// Webhooks acknowledge every event they could route, even discarded ones,
/// so the transport does not redeliver them.
fn outcome_response(
    result: crate::error::Result<Outcome>,
    reference: &str,
) -> (StatusCode, Json<serde_json::Value>) {
    match result {
        Ok(outcome) => (StatusCode::OK, Json(serde_json::json!(outcome))),
        Err(e) if e.is_systemic() => {
            error!(reference, error = %e, "Webhook failed, asking for redelivery");
            error_response(&e)
        }
        Err(e) => {
            warn!(reference, error = %e, "Webhook event rejected");
            error_response(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crm_lead_accepts_numeric_ids() {
        let lead: CrmLead = serde_json::from_value(serde_json::json!({
            "id": 42,
            "name": "Ana",
            "phone": "+1 555 000 1111",
            "campaign_id": 7,
            "lead_data": { "service": "solar" }
        }))
        .unwrap();
        assert_eq!(lead.id, "42");
        assert_eq!(lead.campaign_id, "7");
        assert_eq!(lead.email, None);
    }

    fn params(pairs: &[(&str, &str)]) -> FormParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn status_callback_uses_transport_field_names() {
        let cb = StatusCallback::from_params(&params(&[
            ("MessageSid", "SM1"),
            ("MessageStatus", "undelivered"),
            ("ErrorCode", "30003"),
        ]));
        assert_eq!(cb.message_sid, "SM1");
        assert_eq!(cb.error_code.as_deref(), Some("30003"));

        let bare = StatusCallback::from_params(&params(&[("MessageStatus", "sent"), ("ErrorCode", "")]));
        assert_eq!(bare.message_sid, "");
        assert_eq!(bare.error_code, None);
    }

    #[test]
    fn inbound_message_defaults_missing_body() {
        let msg = InboundMessage::from_params(&params(&[
            ("MessageSid", "IN1"),
            ("From", "whatsapp:+15550001111"),
        ]));
        assert_eq!(msg.from, "whatsapp:+15550001111");
        assert_eq!(msg.body, "");
    }
}
