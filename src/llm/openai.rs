//! OpenAI-compatible chat completions for rendering and classification.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::RenderError;
use crate::lead::{Lead, ReplyClassification};
use crate::llm::{RenderRequest, ReplyClassifier, TextGenerator, fill_template};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const RENDER_SYSTEM_PROMPT: &str = "You write short WhatsApp messages for sales leads. \
Be personal, friendly and professional. Keep it under 300 characters and end with a clear next step. \
Reply with the message text only.";

const CLASSIFY_SYSTEM_PROMPT: &str = "You label a sales lead's reply. \
positive: wants to buy, book, or talk further. negative: not interested or annoyed. \
neutral: questions, unclear, or anything else. \
Answer with one line: CLASSIFICATION: positive|neutral|negative";

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

impl OpenAiConfig {
    /// Read `OPENAI_API_KEY`, `OPENAI_MODEL` and `OPENAI_BASE_URL`.
    /// Returns `None` when no key is set.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())?;
        Some(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client implementing both [`TextGenerator`] and [`ReplyClassifier`].
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        tracing::info!("Using OpenAI-compatible generator (model: {})", config.model);
        Self { config, client }
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        system: &str,
        user: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, RenderError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature,
        };

        let resp = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| RenderError::RequestFailed {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(RenderError::RateLimited {
                provider: PROVIDER.into(),
                retry_after,
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RenderError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("HTTP {status}: {}", text.chars().take(200).collect::<String>()),
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| RenderError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| RenderError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: "no message content in response".into(),
            })
    }
}

fn render_prompt(request: &RenderRequest<'_>) -> String {
    let draft = fill_template(
        request.template,
        request.lead,
        request.campaign,
        request.step,
    )
    .unwrap_or_else(|_| request.template.to_string());
    let step_kind = if request.step == 0 {
        "the first message"
    } else {
        "a follow-up message"
    };
    let history = if request.history.is_empty() {
        "(no messages yet)".to_string()
    } else {
        request
            .history
            .iter()
            .map(|m| m.prompt_line())
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Write {step_kind} (step {step} of {total}) for this lead.\n\n\
         Lead name: {name}\n\
         Lead details: {context}\n\n\
         Campaign: {campaign}\n\
         Campaign description: {description}\n\n\
         Recent conversation:\n{history}\n\n\
         Base this on the following draft:\n{draft}",
        step = request.step + 1,
        total = request.campaign.step_count(),
        name = request.lead.name,
        context = request.lead.context,
        campaign = request.campaign.name,
        description = request.campaign.description.as_deref().unwrap_or("n/a"),
    )
}

/// Extract the label from a classifier answer.
fn parse_classification(answer: &str) -> Option<ReplyClassification> {
    answer
        .lines()
        .find_map(|line| {
            let line = line.trim();
            let prefix = line.get(..15)?;
            if prefix.eq_ignore_ascii_case("CLASSIFICATION:") {
                line[15..].parse().ok()
            } else {
                None
            }
        })
        .or_else(|| answer.parse().ok())
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn render(&self, request: RenderRequest<'_>) -> Result<String, RenderError> {
        let text = self
            .complete(RENDER_SYSTEM_PROMPT, render_prompt(&request), 200, 0.7)
            .await?;
        if text.is_empty() {
            return Err(RenderError::Empty { step: request.step });
        }
        tracing::debug!(
            lead_id = %request.lead.id,
            step = request.step,
            length = text.len(),
            "Generated message"
        );
        Ok(text)
    }
}

#[async_trait]
impl ReplyClassifier for OpenAiClient {
    async fn classify(
        &self,
        text: &str,
        lead: &Lead,
    ) -> Result<ReplyClassification, RenderError> {
        let prompt = format!("Lead name: {}\nReply: \"{}\"", lead.name, text);
        let answer = self.complete(CLASSIFY_SYSTEM_PROMPT, prompt, 20, 0.0).await?;
        parse_classification(&answer).ok_or_else(|| RenderError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: format!("unrecognized classification: {answer}"),
        })
    }
}
