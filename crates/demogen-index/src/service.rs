//! Provisioning boundaries and their warehouse-backed implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use demogen_storage::{ObjectKind, StorageError, Table, Warehouse};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::search::{IndexSpec, SearchIndex, Snippet};
use crate::view::{AnalyticViewDef, ViewQuery, ViewResult};
use crate::ProvisioningError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHandle {
    pub name: String,
    pub source_table: String,
    pub documents: usize,
    pub built_at: DateTime<Utc>,
    pub target_lag_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewHandle {
    pub name: String,
    pub tables: Vec<String>,
    pub dimensions: usize,
    pub metrics: usize,
}

#[async_trait]
pub trait SearchService: Send + Sync {
    /// Create or fully redefine an index.
    async fn create_or_replace_index(&self, spec: IndexSpec) -> Result<IndexHandle, ProvisioningError>;

    /// Ranked snippets for a free-text query.
    async fn preview(&self, index: &str, query: &str, limit: usize) -> Result<Vec<Snippet>, ProvisioningError>;

    /// Rebuild every index older than its target lag. Returns the rebuilt names.
    async fn refresh_due(&self, now: DateTime<Utc>) -> Result<Vec<String>, ProvisioningError>;
}

#[async_trait]
pub trait AnalyticService: Send + Sync {
    async fn create_or_replace_view(&self, def: AnalyticViewDef) -> Result<ViewHandle, ProvisioningError>;

    async fn query_view(&self, view: &str, query: &ViewQuery) -> Result<ViewResult, ProvisioningError>;
}

fn load_source(warehouse: &Warehouse, object: &str, table: &str) -> Result<Table, ProvisioningError> {
    warehouse.table(table).map_err(|e| match e {
        StorageError::NotFound(_) => ProvisioningError::SourceNotFound {
            object: object.to_string(),
            table: table.to_string(),
        },
        other => ProvisioningError::Storage(other),
    })
}

// ============================================================================
// Search
// ============================================================================

/// Indices persisted in the warehouse, with an in-memory cache keyed by the
/// catalog's replace time.
pub struct LocalSearchService {
    warehouse: Arc<Warehouse>,
    cache: RwLock<HashMap<String, (DateTime<Utc>, Arc<SearchIndex>)>>,
}

impl LocalSearchService {
    pub fn new(warehouse: Arc<Warehouse>) -> Self {
        Self {
            warehouse,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn build(&self, spec: IndexSpec) -> Result<IndexHandle, ProvisioningError> {
        let table = load_source(&self.warehouse, &spec.name, &spec.source_table)?;
        let index = SearchIndex::build(spec, &table, Utc::now())?;
        self.warehouse
            .put_definition(ObjectKind::SearchIndex, index.name(), &index)?;
        self.cache.write().remove(index.name());

        tracing::info!(
            index = %index.name(),
            table = %index.spec.source_table,
            documents = index.len(),
            "search index replaced"
        );
        Ok(IndexHandle {
            name: index.spec.name.clone(),
            source_table: index.spec.source_table.clone(),
            documents: index.len(),
            built_at: index.built_at,
            target_lag_secs: index.spec.target_lag_secs,
        })
    }

    fn load(&self, name: &str) -> Result<Arc<SearchIndex>, ProvisioningError> {
        let entry = self
            .warehouse
            .entry(name)
            .filter(|e| e.kind == ObjectKind::SearchIndex)
            .ok_or_else(|| ProvisioningError::IndexNotFound(name.to_string()))?;

        if let Some((stamp, index)) = self.cache.read().get(name) {
            if *stamp == entry.replaced_at {
                return Ok(Arc::clone(index));
            }
        }

        let index: SearchIndex = self.warehouse.definition(ObjectKind::SearchIndex, name)?;
        let index = Arc::new(index);
        self.cache
            .write()
            .insert(name.to_string(), (entry.replaced_at, Arc::clone(&index)));
        Ok(index)
    }
}

#[async_trait]
impl SearchService for LocalSearchService {
    async fn create_or_replace_index(&self, spec: IndexSpec) -> Result<IndexHandle, ProvisioningError> {
        self.build(spec)
    }

    async fn preview(&self, index: &str, query: &str, limit: usize) -> Result<Vec<Snippet>, ProvisioningError> {
        Ok(self.load(index)?.query(query, limit))
    }

    async fn refresh_due(&self, now: DateTime<Utc>) -> Result<Vec<String>, ProvisioningError> {
        let mut rebuilt = Vec::new();
        for entry in self.warehouse.objects(ObjectKind::SearchIndex) {
            let index = self.load(&entry.name)?;
            if index.is_stale(now) {
                tracing::debug!(index = %entry.name, built_at = %index.built_at, "index due for refresh");
                self.build(index.spec.clone())?;
                rebuilt.push(entry.name);
            }
        }
        Ok(rebuilt)
    }
}

// ============================================================================
// Analytic Views
// ============================================================================

pub struct LocalAnalyticService {
    warehouse: Arc<Warehouse>,
}

impl LocalAnalyticService {
    pub fn new(warehouse: Arc<Warehouse>) -> Self {
        Self { warehouse }
    }
}

#[async_trait]
impl AnalyticService for LocalAnalyticService {
    async fn create_or_replace_view(&self, def: AnalyticViewDef) -> Result<ViewHandle, ProvisioningError> {
        def.validate(&self.warehouse)?;
        self.warehouse
            .put_definition(ObjectKind::AnalyticView, &def.name, &def)?;

        tracing::info!(
            view = %def.name,
            tables = def.tables.len(),
            dimensions = def.dimensions.len(),
            metrics = def.metrics.len(),
            "analytic view replaced"
        );
        Ok(ViewHandle {
            name: def.name.clone(),
            tables: def.tables.iter().map(|t| t.table.clone()).collect(),
            dimensions: def.dimensions.len(),
            metrics: def.metrics.len(),
        })
    }

    async fn query_view(&self, view: &str, query: &ViewQuery) -> Result<ViewResult, ProvisioningError> {
        let def: AnalyticViewDef = self
            .warehouse
            .definition(ObjectKind::AnalyticView, view)
            .map_err(|e| match e {
                StorageError::NotFound(_) => ProvisioningError::ViewNotFound(view.to_string()),
                other => ProvisioningError::Storage(other),
            })?;

        let mut tables = HashMap::new();
        for t in &def.tables {
            tables.insert(t.alias.clone(), load_source(&self.warehouse, view, &t.table)?);
        }
        Ok(def.execute(&tables, query)?)
    }
}
