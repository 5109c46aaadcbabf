//! WhatsApp channel over the Twilio Messages REST API.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha1::Sha1;

use crate::channels::{AttemptReceipt, ChannelTransport, ReceiptStatus, normalize_address};
use crate::error::{ConfigError, DeliveryError};

const CHANNEL: &str = "whatsapp";
const DEFAULT_API_BASE: &str = "https://api.twilio.com/2010-04-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Error codes after which Twilio will never deliver to the address:
/// invalid `To`, unsubscribed recipient, not a mobile number, and
/// not a WhatsApp user.
pub const DEFAULT_FATAL_CODES: &[&str] = &["21211", "21408", "21610", "21614", "63003"];

/// Twilio account settings.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// Sender number, digits or E.164.
    pub from_number: String,
    pub api_base: String,
}

impl TwilioConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let require = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };
        Ok(Self {
            account_sid: require("TWILIO_ACCOUNT_SID")?,
            auth_token: SecretString::from(require("TWILIO_AUTH_TOKEN")?),
            from_number: require("TWILIO_PHONE_NUMBER")?,
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }
}

/// Twilio WhatsApp transport.
pub struct TwilioWhatsApp {
    config: TwilioConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
    status: String,
    #[serde(default)]
    error_code: Option<serde_json::Value>,
    #[serde(default)]
    date_created: Option<String>,
}

impl MessageResource {
    fn receipt_status(&self) -> ReceiptStatus {
        let code = self.error_code.as_ref().and_then(code_string);
        ReceiptStatus::from_transport(&self.status, code.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<MessageResource>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

fn code_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn whatsapp_address(raw: &str) -> String {
    format!("whatsapp:+{}", normalize_address(raw))
}

fn transient(reason: impl Into<String>) -> DeliveryError {
    DeliveryError::Transient {
        channel: CHANNEL.into(),
        reason: reason.into(),
    }
}

/// Classify a non-success API response.
fn classify_failure(status: StatusCode, body: &str) -> DeliveryError {
    let parsed: Option<ApiError> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|e| e.code.as_ref())
        .and_then(code_string);
    let message = parsed
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.chars().take(200).collect());
    let reason = match &code {
        Some(code) => format!("HTTP {status} (code {code}): {message}"),
        None => format!("HTTP {status}: {message}"),
    };

    // Auth and permission failures are account problems, not the lead's.
    let fatal = status.is_client_error()
        && !matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        )
        && code
            .as_deref()
            .is_some_and(|code| DEFAULT_FATAL_CODES.contains(&code));
    if fatal {
        DeliveryError::Fatal {
            channel: CHANNEL.into(),
            reason,
        }
    } else {
        transient(reason)
    }
}

/// Check an `X-Twilio-Signature` header: base64 HMAC-SHA1, keyed with the
/// auth token, over the full callback URL followed by every form parameter's
/// name and value in name order.
pub fn validate_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    signature: &str,
) -> bool {
    let Ok(expected) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()) else {
        return false;
    };
    mac.update(url.as_bytes());
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    for (name, value) in sorted {
        mac.update(name.as_bytes());
        mac.update(value.as_bytes());
    }
    mac.verify_slice(&expected).is_ok()
}

impl TwilioWhatsApp {
    pub fn new(config: TwilioConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    fn message_url(&self, sid: &str) -> String {
        format!(
            "{}/Accounts/{}/Messages/{sid}.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, DeliveryError> {
        let resp = request
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| transient(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // Lookups never condemn a lead; surface everything as transient.
            return Err(transient(classify_failure(status, &body).reason().to_string()));
        }
        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| transient(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl ChannelTransport for TwilioWhatsApp {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send(&self, address: &str, text: &str) -> Result<String, DeliveryError> {
        let to = whatsapp_address(address);
        let from = whatsapp_address(&self.config.from_number);
        let form = [("From", from.as_str()), ("To", to.as_str()), ("Body", text)];

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| transient(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let err = classify_failure(status, &body);
            tracing::warn!(to = %to, error = %err, "WhatsApp send rejected");
            return Err(err);
        }

        let message: MessageResource = serde_json::from_str(&body)
            .map_err(|e| transient(format!("unparseable send response: {e}")))?;
        tracing::info!(sid = %message.sid, to = %to, status = %message.status, "WhatsApp message sent");
        Ok(message.sid)
    }

    async fn attempt_status(
        &self,
        attempt_id: &str,
    ) -> Result<Option<ReceiptStatus>, DeliveryError> {
        let message: Option<MessageResource> = self
            .get_json(self.client.get(self.message_url(attempt_id)))
            .await?;
        Ok(message.map(|m| m.receipt_status()))
    }

    async fn find_recent_attempt(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttemptReceipt>, DeliveryError> {
        let to = whatsapp_address(address);
        let date = since.format("%Y-%m-%d").to_string();
        let request = self.client.get(self.messages_url()).query(&[
            ("To", to.as_str()),
            ("DateSent>", date.as_str()),
            ("PageSize", "20"),
        ]);

        let page: Option<MessagePage> = self.get_json(request).await?;
        let Some(page) = page else {
            return Ok(None);
        };

        let found = page
            .messages
            .into_iter()
            .filter_map(|m| {
                let created = m
                    .date_created
                    .as_deref()
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())?
                    .with_timezone(&Utc);
                Some((created, m))
            })
            // Twilio timestamps have second precision.
            .filter(|(created, _)| *created >= since - chrono::Duration::seconds(1))
            .max_by_key(|(created, _)| *created)
            .map(|(created, m)| AttemptReceipt {
                status: m.receipt_status(),
                attempt_id: m.sid,
                sent_at: created,
            });
        Ok(found)
    }

    fn default_fatal_codes(&self) -> Vec<String> {
        DEFAULT_FATAL_CODES.iter().map(|c| c.to_string()).collect()
    }
}
