//! Readiness Validator
//!
//! Probes every index and view with canary queries built from the
//! guaranteed entities. A probe passes when it returns at least
//! `validation.min_hits` relevant results; for entity canaries a hit is
//! relevant only if it matches every token of the entity name.

use chrono::{DateTime, Utc};
use demogen_core::records::ENTITIES_TABLE;
use demogen_core::{CanarySpec, EntityRow, PipelineConfig};
use demogen_index::text::tokenize;
use demogen_index::{AnalyticService, SearchService, ViewQuery};
use demogen_storage::Warehouse;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::provision::{call_timeout, COMPANY_FINANCIALS_VIEW, ENTITY_DIRECTORY_VIEW};
use crate::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    SearchIndex,
    AnalyticView,
}

/// Outcome of one canary probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub target: String,
    pub kind: TargetKind,
    pub canary: String,
    pub hits: usize,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\" ({} hits)", self.target, self.canary, self.hits)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Probe {
    Search {
        index: String,
        query: String,
        /// Tokens every relevant hit must match.
        required: Vec<String>,
    },
    View {
        view: String,
        metric: String,
        company: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Canary {
    probe: Probe,
}

impl Canary {
    pub fn target(&self) -> &str {
        match &self.probe {
            Probe::Search { index, .. } => index,
            Probe::View { view, .. } => view,
        }
    }

    pub fn query(&self) -> String {
        match &self.probe {
            Probe::Search { query, .. } => query.clone(),
            Probe::View { company, metric, .. } => format!("{metric} where company = {company}"),
        }
    }
}

pub struct ReadinessValidator<'a> {
    config: &'a PipelineConfig,
    search: &'a dyn SearchService,
    analytic: &'a dyn AnalyticService,
}

impl<'a> ReadinessValidator<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        search: &'a dyn SearchService,
        analytic: &'a dyn AnalyticService,
    ) -> Self {
        Self {
            config,
            search,
            analytic,
        }
    }

    /// Canary queries for every index and view, in configuration order.
    pub fn canaries(&self, guaranteed: &[String]) -> Vec<Canary> {
        let suffix = self
            .config
            .validation
            .canary_suffix
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let mut out = Vec::new();
        for source in &self.config.sources {
            match &source.canary {
                CanarySpec::Entity => {
                    for name in guaranteed {
                        let query = match suffix {
                            Some(suffix) => format!("{name} {suffix}"),
                            None => name.clone(),
                        };
                        out.push(Canary {
                            probe: Probe::Search {
                                index: source.index_name(),
                                query,
                                required: tokenize(name),
                            },
                        });
                    }
                }
                CanarySpec::Term { query } => out.push(Canary {
                    probe: Probe::Search {
                        index: source.index_name(),
                        query: query.clone(),
                        required: Vec::new(),
                    },
                }),
            }
        }

        for (view, metric) in [
            (COMPANY_FINANCIALS_VIEW, "total_revenue"),
            (ENTITY_DIRECTORY_VIEW, "company_count"),
        ] {
            for name in guaranteed {
                out.push(Canary {
                    probe: Probe::View {
                        view: view.to_string(),
                        metric: metric.to_string(),
                        company: name.clone(),
                    },
                });
            }
        }
        out
    }

    /// Run every canary. Probe errors are recorded as failures, not raised.
    pub async fn run(&self, guaranteed: &[String]) -> Vec<ValidationResult> {
        let mut results = Vec::new();
        for canary in self.canaries(guaranteed) {
            let result = self.check(&canary).await;
            if result.passed {
                tracing::info!(target_object = %result.target, canary = %result.canary, hits = result.hits, "canary passed");
            } else {
                tracing::warn!(
                    target_object = %result.target,
                    canary = %result.canary,
                    hits = result.hits,
                    detail = result.detail.as_deref().unwrap_or(""),
                    "canary failed"
                );
            }
            results.push(result);
        }
        results
    }

    pub async fn check(&self, canary: &Canary) -> ValidationResult {
        let min_hits = self.config.validation.min_hits;
        let timeout = call_timeout(self.config);
        let (kind, outcome) = match &canary.probe {
            Probe::Search {
                index,
                query,
                required,
            } => {
                let limit = self.config.validation.result_limit;
                let outcome = tokio::time::timeout(timeout, self.search.preview(index, query, limit))
                    .await
                    .map_err(|_| format!("preview timed out after {timeout:?}"))
                    .and_then(|r| r.map_err(|e| e.to_string()))
                    .map(|hits| {
                        hits.iter()
                            .filter(|h| required.iter().all(|t| h.matched_tokens.contains(t)))
                            .count()
                    });
                (TargetKind::SearchIndex, outcome)
            }
            Probe::View {
                view,
                metric,
                company,
            } => {
                let query = ViewQuery {
                    dimensions: vec!["company".to_string()],
                    metrics: vec![metric.clone()],
                    filters: vec![("company".to_string(), company.clone())],
                    limit: None,
                };
                let outcome = tokio::time::timeout(timeout, self.analytic.query_view(view, &query))
                    .await
                    .map_err(|_| format!("view query timed out after {timeout:?}"))
                    .and_then(|r| r.map_err(|e| e.to_string()))
                    .map(|result| result.len());
                (TargetKind::AnalyticView, outcome)
            }
        };

        let (hits, detail) = match outcome {
            Ok(hits) if hits >= min_hits => (hits, None),
            Ok(hits) => (hits, Some(format!("expected at least {min_hits} hits"))),
            Err(error) => (0, Some(error)),
        };
        ValidationResult {
            target: canary.target().to_string(),
            kind,
            canary: canary.query(),
            hits,
            passed: detail.is_none(),
            detail,
            checked_at: Utc::now(),
        }
    }
}

/// Guaranteed names recorded in an existing warehouse: the pinned entities,
/// or the first entity when nothing was pinned.
pub fn guaranteed_names_from(warehouse: &Warehouse) -> Result<Vec<String>, PipelineError> {
    let rows: Vec<EntityRow> = warehouse.table(ENTITIES_TABLE)?.records()?;
    let pinned: Vec<String> = rows
        .iter()
        .filter(|r| r.pinned)
        .map(|r| r.name.clone())
        .collect();
    if !pinned.is_empty() {
        return Ok(pinned);
    }
    Ok(rows.first().map(|r| vec![r.name.clone()]).unwrap_or_default())
}
