//! Entity Generator: the deterministic structured universe.
//!
//! Pinned (must-exist) entities always come first and are never dropped; the
//! remaining slots are filled with generated names. Quarterly series are
//! smoothed random walks shaped by the entity's category, so smaller/private
//! entities move more than large ones.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::config::{CategoryConfig, PipelineConfig};
use crate::{ConfigError, DeterministicRng, Quarter};

const NAME_PREFIXES: &[&str] = &[
    "Alder", "Beacon", "Cobalt", "Driftwood", "Ember", "Fairwind", "Granite", "Harbor",
    "Ironbark", "Juniper", "Keystone", "Lumen", "Meridian", "Northwind", "Oakridge", "Pioneer",
    "Quarry", "Redwood", "Summit", "Tidewater", "Umber", "Vantage", "Westbrook", "Zephyr",
];

const NAME_SUFFIXES: &[&str] = &[
    "Analytics", "Biotech", "Capital", "Dynamics", "Energy", "Foods", "Freight", "Health",
    "Holdings", "Industries", "Logistics", "Materials", "Networks", "Retail", "Robotics",
    "Systems",
];

const SECTORS: &[&str] = &[
    "Industrials",
    "Financials",
    "Technology",
    "Health Care",
    "Energy",
    "Consumer Staples",
    "Consumer Discretionary",
    "Materials",
    "Transportation",
];

const REGIONS: &[&str] = &["North America", "Europe", "Asia Pacific", "Latin America"];

/// Weight of the newest shock in the exponentially smoothed shock series.
const SHOCK_SMOOTHING: f64 = 0.45;
/// Pull of the margin walk back towards the category margin.
const MARGIN_REVERSION: f64 = 0.3;
const TAX_RATE: f64 = 0.24;

/// Number of distinct names the generator can produce.
pub fn name_capacity() -> usize {
    NAME_PREFIXES.len() * NAME_SUFFIXES.len()
}

/// Whether the generator's name pool can produce `name` (case-insensitive).
/// A pinned entity with such a name takes that slot away from the pool.
pub fn in_name_pool(name: &str) -> bool {
    let normalized = name.trim().to_lowercase();
    let Some((prefix, suffix)) = normalized.split_once(' ') else {
        return false;
    };
    NAME_PREFIXES.iter().any(|p| p.to_lowercase() == prefix)
        && NAME_SUFFIXES.iter().any(|s| s.to_lowercase() == suffix)
}

/// Stable identifier derived from the display name only.
pub fn entity_id_for(name: &str) -> String {
    let normalized = name.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("ent_{hex}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarterlyMetrics {
    pub quarter: Quarter,
    /// Millions.
    pub revenue: f64,
    pub operating_margin: f64,
    /// Millions.
    pub net_income: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub ticker: String,
    pub category: String,
    pub sector: String,
    pub region: String,
    pub pinned: bool,
    pub series: Vec<QuarterlyMetrics>,
}

impl Entity {
    pub fn latest(&self) -> Option<&QuarterlyMetrics> {
        self.series.last()
    }

    pub fn metrics_for(&self, quarter: Quarter) -> Option<&QuarterlyMetrics> {
        self.series.iter().find(|m| m.quarter == quarter)
    }

    /// Quarter-on-quarter revenue growth ending at `quarter`, if there is a prior quarter.
    pub fn revenue_growth(&self, quarter: Quarter) -> Option<f64> {
        let idx = self.series.iter().position(|m| m.quarter == quarter)?;
        let prev = self.series.get(idx.checked_sub(1)?)?;
        let current = &self.series[idx];
        if prev.revenue == 0.0 {
            return None;
        }
        Some(current.revenue / prev.revenue - 1.0)
    }
}

/// The generated entities, pinned ones first, in generation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityUniverse {
    entities: Vec<Entity>,
}

impl EntityUniverse {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Entity> {
        let needle = name.trim();
        self.entities
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(needle))
    }

    pub fn pinned(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(|e| e.pinned)
    }

    /// Names the validator may rely on: every pinned entity, or the first
    /// generated entity when nothing is pinned.
    pub fn guaranteed_names(&self) -> Vec<String> {
        let pinned: Vec<String> = self.pinned().map(|e| e.name.clone()).collect();
        if !pinned.is_empty() {
            return pinned;
        }
        self.entities.first().map(|e| vec![e.name.clone()]).unwrap_or_default()
    }
}

pub struct EntityGenerator<'a> {
    config: &'a PipelineConfig,
    quarters: Vec<Quarter>,
}

impl<'a> EntityGenerator<'a> {
    /// Validates the configuration up front; nothing is generated on error.
    pub fn new(config: &'a PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let quarters = config.quarters()?;
        Ok(Self { config, quarters })
    }

    pub fn generate(&self, rng: &mut DeterministicRng) -> EntityUniverse {
        let weights: Vec<f64> = self.config.categories.iter().map(|c| c.weight).collect();
        let mut entities = Vec::with_capacity(self.config.entity_count);
        let mut taken_names: BTreeSet<String> = BTreeSet::new();
        let mut taken_tickers: BTreeSet<String> = BTreeSet::new();

        for pinned in &self.config.must_exist {
            let name = pinned.name.trim().to_string();
            let category = match &pinned.category {
                Some(c) => self.category_by_name(c),
                None => self.pick_category(rng, &weights),
            };
            let sector = match &pinned.sector {
                Some(s) => s.clone(),
                None => pick(rng, SECTORS),
            };
            taken_names.insert(name.to_lowercase());
            let entity = self.build_entity(rng, name, category, sector, true, &mut taken_tickers);
            entities.push(entity);
        }

        let mut candidates: Vec<String> = NAME_PREFIXES
            .iter()
            .flat_map(|p| NAME_SUFFIXES.iter().map(move |s| format!("{p} {s}")))
            .collect();
        rng.shuffle(&mut candidates);

        let mut candidates = candidates.into_iter();
        while entities.len() < self.config.entity_count {
            let Some(name) = candidates.next() else {
                // Unreachable after `validate`, which bounds entity_count by name capacity.
                tracing::warn!(
                    generated = entities.len(),
                    requested = self.config.entity_count,
                    "entity name pool exhausted"
                );
                break;
            };
            if !taken_names.insert(name.to_lowercase()) {
                continue;
            }
            let category = self.pick_category(rng, &weights);
            let sector = pick(rng, SECTORS);
            let entity = self.build_entity(rng, name, category, sector, false, &mut taken_tickers);
            entities.push(entity);
        }

        tracing::debug!(
            entities = entities.len(),
            pinned = self.config.must_exist.len(),
            quarters = self.quarters.len(),
            "generated entity universe"
        );
        EntityUniverse::new(entities)
    }

    fn category_by_name(&self, name: &str) -> &'a CategoryConfig {
        // `validate` guarantees the category exists and the list is non-empty.
        self.config
            .category(name)
            .unwrap_or(&self.config.categories[0])
    }

    fn pick_category(&self, rng: &mut DeterministicRng, weights: &[f64]) -> &'a CategoryConfig {
        let idx = rng.weighted_index(weights).unwrap_or(0);
        &self.config.categories[idx]
    }

    fn build_entity(
        &self,
        rng: &mut DeterministicRng,
        name: String,
        category: &CategoryConfig,
        sector: String,
        pinned: bool,
        taken_tickers: &mut BTreeSet<String>,
    ) -> Entity {
        let region = pick(rng, REGIONS);
        let ticker = unique_ticker(&name, taken_tickers);
        let series = self.series(rng, category);
        Entity {
            id: entity_id_for(&name),
            name,
            ticker,
            category: category.name.clone(),
            sector,
            region,
            pinned,
            series,
        }
    }

    fn series(&self, rng: &mut DeterministicRng, category: &CategoryConfig) -> Vec<QuarterlyMetrics> {
        let mut revenue = category.base_revenue * (0.5 + rng.next_f64());
        let mut margin = category.margin + rng.normal() * 0.02;
        let mut smoothed_shock = 0.0;

        let mut out = Vec::with_capacity(self.quarters.len());
        for (i, quarter) in self.quarters.iter().enumerate() {
            smoothed_shock = SHOCK_SMOOTHING * rng.normal() + (1.0 - SHOCK_SMOOTHING) * smoothed_shock;
            if i > 0 {
                let growth = (category.drift + category.volatility * smoothed_shock).max(-0.6);
                revenue *= 1.0 + growth;
            }
            margin += MARGIN_REVERSION * (category.margin - margin)
                + 0.5 * category.volatility * rng.normal();
            margin = margin.clamp(-0.5, 0.6);

            let operating_income = revenue * margin;
            let net_income = if operating_income > 0.0 {
                operating_income * (1.0 - TAX_RATE)
            } else {
                operating_income
            };
            out.push(QuarterlyMetrics {
                quarter: *quarter,
                revenue: round2(revenue),
                operating_margin: round4(margin),
                net_income: round2(net_income),
            });
        }
        out
    }
}

fn pick(rng: &mut DeterministicRng, items: &[&str]) -> String {
    rng.choose(items).copied().unwrap_or_default().to_string()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn unique_ticker(name: &str, taken: &mut BTreeSet<String>) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    let mut base: String = if words.len() >= 2 {
        let first: String = words[0].chars().filter(|c| c.is_ascii_alphabetic()).take(2).collect();
        let rest: String = words[1..]
            .iter()
            .filter_map(|w| w.chars().find(|c| c.is_ascii_alphabetic()))
            .take(2)
            .collect();
        first + &rest
    } else {
        name.chars().filter(|c| c.is_ascii_alphabetic()).take(4).collect()
    };
    base = base.to_ascii_uppercase();
    if base.is_empty() {
        base = "ENT".to_string();
    }

    if taken.insert(base.clone()) {
        return base;
    }
    let mut n = 1u32;
    loop {
        n += 1;
        let candidate = format!("{base}{n}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
    }
}
