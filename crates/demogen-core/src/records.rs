//! Row types written to the warehouse.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entity::{Entity, EntityUniverse};
use crate::prompt::PromptInstance;

pub const ENTITIES_TABLE: &str = "entities";
pub const FINANCIALS_TABLE: &str = "quarterly_financials";
pub const PROMPTS_TABLE: &str = "prompt_instances";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Generated,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Generated => "GENERATED",
            DocumentStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One materialized document, or a FAILED placeholder standing in for one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub id: String,
    pub source_type: String,
    pub title: String,
    pub content: String,
    pub publication_date: NaiveDate,
    pub entity_id: Option<String>,
    pub prompt_instance_id: String,
    pub language: String,
    pub attributes: BTreeMap<String, String>,
    pub status: DocumentStatus,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl GeneratedDocument {
    /// Document ids mirror the prompt instance id so reruns overwrite in place.
    pub fn id_for(prompt: &PromptInstance) -> String {
        let suffix = prompt
            .id
            .strip_prefix("pi_")
            .unwrap_or(prompt.id.as_str());
        format!("doc_{suffix}")
    }

    pub fn is_generated(&self) -> bool {
        self.status == DocumentStatus::Generated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub entity_id: String,
    pub name: String,
    pub ticker: String,
    pub category: String,
    pub sector: String,
    pub region: String,
    pub pinned: bool,
}

impl From<&Entity> for EntityRow {
    fn from(e: &Entity) -> Self {
        Self {
            entity_id: e.id.clone(),
            name: e.name.clone(),
            ticker: e.ticker.clone(),
            category: e.category.clone(),
            sector: e.sector.clone(),
            region: e.region.clone(),
            pinned: e.pinned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialRow {
    pub entity_id: String,
    pub quarter: String,
    pub fiscal_year: i32,
    pub revenue: f64,
    pub operating_margin: f64,
    pub operating_income: f64,
    pub net_income: f64,
}

impl FinancialRow {
    /// One row per entity and quarter, in universe order.
    pub fn rows_for(universe: &EntityUniverse) -> Vec<FinancialRow> {
        universe
            .entities()
            .iter()
            .flat_map(|e| {
                e.series.iter().map(move |m| FinancialRow {
                    entity_id: e.id.clone(),
                    quarter: m.quarter.to_string(),
                    fiscal_year: m.quarter.year(),
                    revenue: round2(m.revenue),
                    operating_margin: round4(m.operating_margin),
                    operating_income: round2(m.revenue * m.operating_margin),
                    net_income: round2(m.net_income),
                })
            })
            .collect()
    }
}

/// Prompt audit row; the full prompt text is kept for reruns and debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRow {
    pub prompt_instance_id: String,
    pub source_type: String,
    pub template_id: String,
    pub model: String,
    pub entity_id: Option<String>,
    pub language: String,
    pub publication_date: NaiveDate,
    pub text: String,
}

impl From<&PromptInstance> for PromptRow {
    fn from(p: &PromptInstance) -> Self {
        Self {
            prompt_instance_id: p.id.clone(),
            source_type: p.source_type.clone(),
            template_id: p.template_id.clone(),
            model: p.model.clone(),
            entity_id: p.entity_id.clone(),
            language: p.language.clone(),
            publication_date: p.publication_date,
            text: p.text.clone(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
