//! LLM cost aggregation.
//!
//! Prices are USD per million tokens, held in a table that is loaded once and
//! shared read-only. Lookup order:
//!
//! 1. exact match on the normalized (trimmed, lowercase) model name
//! 2. first case-insensitive substring match, in table declaration order
//! 3. unknown model: zero cost plus a warning
//!
//! The declaration-order tie-break means the table must list specific names
//! before their prefixes (`gpt-4o-mini` before `gpt-4o`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PricingError;

const BUILTIN_PRICING_TOML: &str = include_str!("../../config/pricing.toml");
const TOKENS_PER_MILLION: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    pub models: Vec<ModelPrice>,
}

impl PricingTable {
    pub fn builtin() -> Self {
        Self::from_toml(BUILTIN_PRICING_TOML).unwrap_or_else(|err| {
            tracing::error!(error = %err, "Failed to parse built-in pricing table");
            PricingTable::default()
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, PricingError> {
        let mut table: PricingTable = toml::from_str(content)?;
        for entry in &mut table.models {
            entry.model = normalize(&entry.model);
            if !entry.input_per_million.is_finite() || !entry.output_per_million.is_finite() {
                return Err(PricingError::InvalidPrice {
                    model: entry.model.clone(),
                });
            }
            // Prices are never negative.
            entry.input_per_million = entry.input_per_million.max(0.0);
            entry.output_per_million = entry.output_per_million.max(0.0);
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, PricingError> {
        let content = std::fs::read_to_string(path).map_err(|source| PricingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, falling back to the built-in table on any error.
    pub fn load_or_builtin(path: Option<&PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };
        match Self::load(path) {
            Ok(table) => {
                tracing::info!(
                    path = %path.display(),
                    models = table.models.len(),
                    "Loaded pricing table"
                );
                table
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Failed to load pricing table; using built-in defaults"
                );
                Self::builtin()
            }
        }
    }

    pub fn lookup(&self, model: &str) -> Option<(&ModelPrice, PriceMatch)> {
        let key = normalize(model);
        if key.is_empty() {
            return None;
        }

        if let Some(entry) = self.models.iter().find(|entry| entry.model == key) {
            return Some((entry, PriceMatch::Exact(entry.model.clone())));
        }

        self.models
            .iter()
            .find(|entry| key.contains(entry.model.as_str()) || entry.model.contains(key.as_str()))
            .map(|entry| (entry, PriceMatch::Substring(entry.model.clone())))
    }
}

/// How a model name was resolved against the pricing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum PriceMatch {
    Exact(String),
    Substring(String),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cost {
    pub usd: f64,
    pub matched: PriceMatch,
}

impl Cost {
    pub fn is_unknown_model(&self) -> bool {
        self.matched == PriceMatch::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskCostEstimate {
    pub cost_per_step: f64,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub estimated_steps: u64,
}

/// Pure pricing lookup. Cheap to clone; the table is shared.
#[derive(Debug, Clone)]
pub struct CostAggregator {
    table: Arc<PricingTable>,
}

impl Default for CostAggregator {
    fn default() -> Self {
        Self::new(PricingTable::builtin())
    }
}

impl CostAggregator {
    pub fn new(table: PricingTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn table(&self) -> &PricingTable {
        &self.table
    }

    pub fn cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> Cost {
        match self.table.lookup(model) {
            Some((price, matched)) => {
                if let PriceMatch::Substring(ref key) = matched {
                    tracing::debug!(model = %model, pricing_model = %key, "Matched model by substring");
                }
                let usd = (tokens_in as f64 / TOKENS_PER_MILLION) * price.input_per_million
                    + (tokens_out as f64 / TOKENS_PER_MILLION) * price.output_per_million;
                tracing::debug!(
                    model = %model,
                    tokens_in,
                    tokens_out,
                    usd,
                    "Computed LLM cost"
                );
                Cost { usd, matched }
            }
            None => {
                tracing::warn!(model = %model, "Unknown model for cost calculation");
                Cost {
                    usd: 0.0,
                    matched: PriceMatch::Unknown,
                }
            }
        }
    }

    pub fn cost_usd(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        self.cost(model, tokens_in, tokens_out).usd
    }

    pub fn pricing_for(&self, model: &str) -> Option<ModelPrice> {
        self.table.lookup(model).map(|(price, _)| price.clone())
    }

    /// Rough cost of a task, assuming a 60/40 input/output token split.
    pub fn estimate_task_cost(
        &self,
        model: &str,
        estimated_steps: u64,
        avg_tokens_per_step: u64,
    ) -> TaskCostEstimate {
        let tokens_in = avg_tokens_per_step * 6 / 10;
        let tokens_out = avg_tokens_per_step * 4 / 10;
        let cost_per_step = self.cost_usd(model, tokens_in, tokens_out);

        TaskCostEstimate {
            cost_per_step: round_to(cost_per_step, 6),
            total_cost: round_to(cost_per_step * estimated_steps as f64, 4),
            total_tokens: avg_tokens_per_step * estimated_steps,
            estimated_steps,
        }
    }
}

pub fn format_cost(cost_usd: f64) -> String {
    if cost_usd == 0.0 {
        "Free".to_string()
    } else if cost_usd < 0.01 {
        format!("${cost_usd:.6}")
    } else if cost_usd < 1.0 {
        format!("${cost_usd:.4}")
    } else {
        format!("${cost_usd:.2}")
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn normalize(model: &str) -> String {
    model.trim().to_lowercase()
}
