//! Index/View Provisioner
//!
//! Replaces one search index per source collection and the analytic views
//! over the structured tables, then prunes objects that no longer belong to
//! the configuration. Every call runs under the provisioning timeout.

use demogen_core::records::{ENTITIES_TABLE, FINANCIALS_TABLE, PROMPTS_TABLE};
use demogen_core::{DocumentStatus, PipelineConfig, SourceConfig};
use demogen_index::{
    Aggregation, AnalyticService, AnalyticViewDef, Dimension, IndexHandle, IndexSpec,
    LogicalTable, Metric, ProvisioningError, Relationship, RowFilter, SearchService, ViewHandle,
};
use demogen_storage::{ObjectKind, Warehouse};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

pub const COMPANY_FINANCIALS_VIEW: &str = "company_financials";
pub const ENTITY_DIRECTORY_VIEW: &str = "entity_directory";

/// Columns every document table exposes for citation and filtering.
const DOCUMENT_ATTRIBUTE_COLUMNS: &[&str] = &[
    "source_type",
    "publication_date",
    "entity_id",
    "language",
    "prompt_instance_id",
];

pub struct Provisioner<'a> {
    config: &'a PipelineConfig,
    search: &'a dyn SearchService,
    analytic: &'a dyn AnalyticService,
}

#[derive(Debug, Default)]
pub struct ProvisioningReport {
    pub indices: Vec<IndexHandle>,
    pub views: Vec<ViewHandle>,
    pub pruned: Vec<String>,
}

impl<'a> Provisioner<'a> {
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

    pub fn index_spec(&self, source: &SourceConfig) -> IndexSpec {
        let mut attribute_columns: Vec<String> = DOCUMENT_ATTRIBUTE_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .collect();
        for attr in &source.attributes {
            if !attribute_columns.contains(attr) {
                attribute_columns.push(attr.clone());
            }
        }
        IndexSpec {
            name: source.index_name(),
            source_table: source.table_name(),
            id_column: "id".to_string(),
            title_column: "title".to_string(),
            content_column: "content".to_string(),
            attribute_columns,
            filter: Some(RowFilter {
                column: "status".to_string(),
                equals: DocumentStatus::Generated.as_str().to_string(),
            }),
            target_lag_secs: source
                .target_lag_secs
                .unwrap_or(self.config.provisioning.refresh_interval_secs),
        }
    }

    /// Replace every index and view, then drop orphans. Stops at the first error.
    pub async fn provision_all(
        &self,
        warehouse: &Warehouse,
    ) -> Result<ProvisioningReport, ProvisioningError> {
        let mut report = ProvisioningReport::default();

        for source in &self.config.sources {
            let spec = self.index_spec(source);
            let name = spec.name.clone();
            let handle = self
                .timed(&name, self.search.create_or_replace_index(spec))
                .await?;
            report.indices.push(handle);
        }

        for def in structured_views() {
            let name = def.name.clone();
            let handle = self
                .timed(&name, self.analytic.create_or_replace_view(def))
                .await?;
            report.views.push(handle);
        }

        report.pruned = self.prune(warehouse)?;
        Ok(report)
    }

    async fn timed<T, F>(&self, object: &str, call: F) -> Result<T, ProvisioningError>
    where
        F: Future<Output = Result<T, ProvisioningError>>,
    {
        let after = self.config.provisioning.call_timeout();
        match tokio::time::timeout(after, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(object = %object, timeout_secs = after.as_secs(), "provisioning call timed out");
                Err(ProvisioningError::Timeout {
                    object: object.to_string(),
                    after,
                })
            }
        }
    }

    /// Drop tables, indices and views the current configuration does not produce.
    fn prune(&self, warehouse: &Warehouse) -> Result<Vec<String>, ProvisioningError> {
        let mut tables: BTreeSet<String> = [ENTITIES_TABLE, FINANCIALS_TABLE, PROMPTS_TABLE]
            .iter()
            .map(|t| t.to_string())
            .collect();
        tables.extend(self.config.sources.iter().map(SourceConfig::table_name));
        let indices: BTreeSet<String> = self
            .config
            .sources
            .iter()
            .map(SourceConfig::index_name)
            .collect();
        let views: BTreeSet<String> = [COMPANY_FINANCIALS_VIEW, ENTITY_DIRECTORY_VIEW]
            .iter()
            .map(|v| v.to_string())
            .collect();

        let mut pruned = warehouse.prune(ObjectKind::SearchIndex, &indices)?;
        pruned.extend(warehouse.prune(ObjectKind::AnalyticView, &views)?);
        pruned.extend(warehouse.prune(ObjectKind::Table, &tables)?);
        for name in &pruned {
            tracing::info!(object = %name, "pruned orphaned object");
        }
        Ok(pruned)
    }
}

/// Probe calls share the provisioning timeout.
pub(crate) fn call_timeout(config: &PipelineConfig) -> Duration {
    config.provisioning.call_timeout()
}

// ============================================================================
// View definitions
// ============================================================================

fn text(s: &str) -> String {
    s.to_string()
}

fn dimension(name: &str, table: &str, column: &str, synonyms: &[&str]) -> Dimension {
    Dimension {
        name: text(name),
        table: text(table),
        column: text(column),
        synonyms: synonyms.iter().map(|s| text(s)).collect(),
    }
}

fn metric(name: &str, table: &str, column: &str, aggregation: Aggregation, synonyms: &[&str]) -> Metric {
    Metric {
        name: text(name),
        table: text(table),
        column: text(column),
        aggregation,
        synonyms: synonyms.iter().map(|s| text(s)).collect(),
    }
}

/// Views over `quarterly_financials` and `entities`.
pub fn structured_views() -> Vec<AnalyticViewDef> {
    vec![
        AnalyticViewDef {
            name: text(COMPANY_FINANCIALS_VIEW),
            description: text("Quarterly financial results per company"),
            tables: vec![
                LogicalTable {
                    alias: text("financials"),
                    table: text(FINANCIALS_TABLE),
                },
                LogicalTable {
                    alias: text("companies"),
                    table: text(ENTITIES_TABLE),
                },
            ],
            relationships: vec![Relationship {
                from: text("financials"),
                from_column: text("entity_id"),
                to: text("companies"),
                to_column: text("entity_id"),
            }],
            dimensions: vec![
                dimension("company", "companies", "name", &["company name", "issuer", "client"]),
                dimension("ticker", "companies", "ticker", &["symbol"]),
                dimension("sector", "companies", "sector", &["industry"]),
                dimension("category", "companies", "category", &["segment", "size"]),
                dimension("region", "companies", "region", &["geography"]),
                dimension("quarter", "financials", "quarter", &["period", "fiscal quarter"]),
                dimension("fiscal_year", "financials", "fiscal_year", &["year"]),
            ],
            metrics: vec![
                metric("total_revenue", "financials", "revenue", Aggregation::Sum, &["revenue", "sales", "turnover"]),
                metric("avg_operating_margin", "financials", "operating_margin", Aggregation::Avg, &["operating margin", "margin"]),
                metric("total_operating_income", "financials", "operating_income", Aggregation::Sum, &["operating income", "ebit"]),
                metric("total_net_income", "financials", "net_income", Aggregation::Sum, &["net income", "profit", "earnings"]),
                metric("quarters_reported", "financials", "quarter", Aggregation::Count, &["periods"]),
            ],
        },
        AnalyticViewDef {
            name: text(ENTITY_DIRECTORY_VIEW),
            description: text("Companies in the demo universe"),
            tables: vec![LogicalTable {
                alias: text("companies"),
                table: text(ENTITIES_TABLE),
            }],
            relationships: Vec::new(),
            dimensions: vec![
                dimension("company", "companies", "name", &["company name", "issuer", "client"]),
                dimension("sector", "companies", "sector", &["industry"]),
                dimension("category", "companies", "category", &["segment"]),
                dimension("region", "companies", "region", &["geography"]),
            ],
            metrics: vec![metric("company_count", "companies", "entity_id", Aggregation::Count, &["companies", "number of companies"])],
        },
    ]
}
