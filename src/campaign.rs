//! Campaign definitions: read-only step sequences, timing and variant rules.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::RateBudget;
use crate::error::CampaignError;

/// Variant id used when a campaign does not split traffic.
pub const CONTROL_VARIANT: &str = "control";

/// One message in a campaign sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStep {
    /// Default template (also the generation brief for the text generator).
    pub template: String,
    /// How long to wait for a reply after delivery before escalating.
    pub wait_secs: u64,
    /// Per-variant template overrides keyed by variant id.
    #[serde(default)]
    pub variant_templates: BTreeMap<String, String>,
}

/// A/B assignment rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariantRule {
    /// Every lead gets the control variant.
    #[default]
    Single,
    /// Leads are bucketed by a stable hash of their id, proportional to weight.
    Weighted { variants: Vec<WeightedVariant> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedVariant {
    pub id: String,
    pub weight: u32,
}

impl VariantRule {
    /// Assign a variant to a lead. Deterministic across restarts.
    pub fn assign(&self, lead_id: &str) -> String {
        match self {
            Self::Single => CONTROL_VARIANT.to_string(),
            Self::Weighted { variants } => {
                let total: u64 = variants.iter().map(|v| v.weight as u64).sum();
                if total == 0 {
                    return CONTROL_VARIANT.to_string();
                }
                let mut bucket = fnv1a(lead_id.as_bytes()) % total;
                for variant in variants {
                    let weight = variant.weight as u64;
                    if bucket < weight {
                        return variant.id.clone();
                    }
                    bucket -= weight;
                }
                CONTROL_VARIANT.to_string()
            }
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn default_active() -> bool {
    true
}

/// A campaign as configured externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Inactive campaigns accept no new leads; in-flight conversations continue.
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub steps: Vec<CampaignStep>,
    #[serde(default)]
    pub variants: VariantRule,
    pub rate_budget: RateBudget,
}

impl Campaign {
    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn has_step(&self, step: u32) -> bool {
        (step as usize) < self.steps.len()
    }

    pub fn step(&self, step: u32) -> Option<&CampaignStep> {
        self.steps.get(step as usize)
    }

    /// Reply wait for a step. Zero for a step the campaign does not have.
    pub fn wait_for(&self, step: u32) -> chrono::Duration {
        self.step(step)
            .map(|s| chrono::Duration::seconds(s.wait_secs as i64))
            .unwrap_or_else(chrono::Duration::zero)
    }

    /// Template for a step, honoring a variant override when present.
    pub fn template_for(&self, step: u32, variant: &str) -> Option<&str> {
        let s = self.step(step)?;
        Some(
            s.variant_templates
                .get(variant)
                .map(String::as_str)
                .unwrap_or(&s.template),
        )
    }

    pub fn validate(&self) -> Result<(), CampaignError> {
        let invalid = |reason: &str| CampaignError::Invalid {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.steps.is_empty() {
            return Err(invalid("campaign has no steps"));
        }
        if self.rate_budget.max_sends == 0 || self.rate_budget.window_secs == 0 {
            return Err(invalid("rate budget must be positive"));
        }
        if let VariantRule::Weighted { variants } = &self.variants
            && variants.iter().all(|v| v.weight == 0)
        {
            return Err(invalid("weighted variants need a non-zero weight"));
        }
        Ok(())
    }
}

/// Lookup of configured campaigns by id.
#[derive(Debug, Clone, Default)]
pub struct CampaignCatalog {
    campaigns: HashMap<String, Campaign>,
}

impl CampaignCatalog {
    pub fn new(campaigns: Vec<Campaign>) -> Self {
        Self {
            campaigns: campaigns.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Result<&Campaign, CampaignError> {
        self.campaigns
            .get(id)
            .ok_or_else(|| CampaignError::NotFound { id: id.to_string() })
    }

    /// Like `get`, but refuses campaigns that no longer take new leads.
    pub fn get_active(&self, id: &str) -> Result<&Campaign, CampaignError> {
        let campaign = self.get(id)?;
        if !campaign.is_active {
            return Err(CampaignError::Inactive { id: id.to_string() });
        }
        Ok(campaign)
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }
}
