//! Text generation and reply classification.
//!
//! Supports:
//! - **Template**: placeholder substitution only, no external calls
//! - **OpenAI-compatible**: chat completions over HTTP via `reqwest`
//!
//! The orchestrator treats both the rendered text and the reply
//! classification as opaque values.

pub mod openai;

pub use openai::{OpenAiClient, OpenAiConfig};

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::campaign::Campaign;
use crate::error::RenderError;
use crate::lead::{ConversationMessage, Lead, ReplyClassification};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

/// Everything a generator needs to write one campaign step for one lead.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub lead: &'a Lead,
    pub campaign: &'a Campaign,
    pub step: u32,
    pub variant: &'a str,
    /// Step template after variant selection.
    pub template: &'a str,
    /// Recent messages with the lead, oldest first.
    pub history: &'a [ConversationMessage],
}

/// Produces the message text for a campaign step.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn render(&self, request: RenderRequest<'_>) -> Result<String, RenderError>;
}

/// Labels an inbound reply.
#[async_trait]
pub trait ReplyClassifier: Send + Sync {
    async fn classify(&self, text: &str, lead: &Lead)
    -> Result<ReplyClassification, RenderError>;
}

/// Fill `{field}` placeholders from the lead and its CRM context.
///
/// Known fields: `name`, `first_name`, `email`, `phone`, `campaign`, plus
/// any top-level string, number or bool in the lead's context.
pub fn fill_template(
    template: &str,
    lead: &Lead,
    campaign: &Campaign,
    step: u32,
) -> Result<String, RenderError> {
    let mut missing: Option<String> = None;

    let filled = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let field = &caps[1];
        match lookup_field(field, lead, campaign) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| field.to_string());
                String::new()
            }
        }
    });

    if let Some(field) = missing {
        return Err(RenderError::MissingField { step, field });
    }
    let text = filled.trim().to_string();
    if text.is_empty() {
        return Err(RenderError::Empty { step });
    }
    Ok(text)
}

fn lookup_field(field: &str, lead: &Lead, campaign: &Campaign) -> Option<String> {
    match field {
        "name" => Some(lead.name.clone()),
        "first_name" => lead.name.split_whitespace().next().map(str::to_string),
        "email" => lead.email.clone(),
        "phone" => Some(lead.address.clone()),
        "campaign" => Some(campaign.name.clone()),
        other => match lead.context.get(other)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        },
    }
}

/// Generator that only fills template placeholders.
#[derive(Debug, Default, Clone)]
pub struct TemplateRenderer;

#[async_trait]
impl TextGenerator for TemplateRenderer {
    fn name(&self) -> &str {
        "template"
    }

    async fn render(&self, request: RenderRequest<'_>) -> Result<String, RenderError> {
        fill_template(request.template, request.lead, request.campaign, request.step)
    }
}

/// Classifier that returns the same label for every reply.
#[derive(Debug, Clone, Copy)]
pub struct FixedClassifier(pub ReplyClassification);

#[async_trait]
impl ReplyClassifier for FixedClassifier {
    async fn classify(
        &self,
        _text: &str,
        _lead: &Lead,
    ) -> Result<ReplyClassification, RenderError> {
        Ok(self.0)
    }
}
