//! Demogen Warehouse
//!
//! A directory-backed stand-in for the analytics warehouse the pipeline
//! populates:
//!
//! ```text
//! <root>/
//! ├── catalog.json          name → kind, file, row count, run id
//! ├── tables/<name>.json    rows of one table
//! ├── indexes/<name>.json   search index definition and build
//! ├── views/<name>.json     analytic view definition
//! ├── runs/latest.json      last run summary
//! └── .demogen.lock         present while a run owns the warehouse
//! ```
//!
//! ## Key Properties
//!
//! - **Replace, never alter**: every write redefines the object wholesale
//! - **Atomic**: files are written to a temp path and renamed into place
//! - **Single writer**: [`RunLock`] rejects a second concurrent run

mod lock;

#[cfg(test)]
mod tests;

pub use lock::RunLock;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to (de)serialize `{name}`: {source}")]
    Serde {
        name: String,
        source: serde_json::Error,
    },
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("`{name}` already exists as a {existing}; refusing to replace it with a {requested}")]
    KindConflict {
        name: String,
        existing: ObjectKind,
        requested: ObjectKind,
    },
    #[error("invalid object name `{0}` (expected lowercase letters, digits and `_`)")]
    InvalidName(String),
    #[error("warehouse is locked by `{owner}` ({path})")]
    Locked { owner: String, path: PathBuf },
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn serde_err(name: &str) -> impl FnOnce(serde_json::Error) -> StorageError + '_ {
    move |source| StorageError::Serde {
        name: name.to_string(),
        source,
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    SearchIndex,
    AnalyticView,
}

impl ObjectKind {
    fn dir(&self) -> &'static str {
        match self {
            ObjectKind::Table => "tables",
            ObjectKind::SearchIndex => "indexes",
            ObjectKind::AnalyticView => "views",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ObjectKind::Table => "table",
            ObjectKind::SearchIndex => "search index",
            ObjectKind::AnalyticView => "analytic view",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub kind: ObjectKind,
    /// Path relative to the warehouse root.
    pub file: String,
    pub row_count: Option<usize>,
    pub replaced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    objects: BTreeMap<String, CatalogEntry>,
}

// ============================================================================
// Tables
// ============================================================================

/// Rows keyed by column name. Column order is the first row's field order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from serializable records; each record must serialize to a JSON object.
    pub fn from_records<T: Serialize>(name: &str, records: &[T]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let value = serde_json::to_value(record).map_err(serde_err(name))?;
            let Value::Object(row) = value else {
                return Err(StorageError::Serde {
                    name: name.to_string(),
                    source: serde::de::Error::custom("record is not a JSON object"),
                });
            };
            for key in row.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
            rows.push(row);
        }
        Ok(Self {
            name: name.to_string(),
            columns,
            rows,
        })
    }

    pub fn records<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.rows
            .iter()
            .map(|row| {
                serde_json::from_value(Value::Object(row.clone())).map_err(serde_err(&self.name))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

// ============================================================================
// Warehouse
// ============================================================================

pub struct Warehouse {
    root: PathBuf,
    catalog: Arc<RwLock<Catalog>>,
}

impl std::fmt::Debug for Warehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warehouse")
            .field("root", &self.root)
            .field("objects", &self.catalog.read().objects.len())
            .finish()
    }
}

const CATALOG_FILE: &str = "catalog.json";
const RUNS_DIR: &str = "runs";
const LATEST_RUN: &str = "latest.json";

impl Warehouse {
    /// Open (or initialize) the warehouse rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(io_err(&root))?;

        let catalog_path = root.join(CATALOG_FILE);
        let catalog = if catalog_path.exists() {
            let contents = std::fs::read_to_string(&catalog_path).map_err(io_err(&catalog_path))?;
            serde_json::from_str(&contents).map_err(serde_err(CATALOG_FILE))?
        } else {
            Catalog::default()
        };

        Ok(Self {
            root,
            catalog: Arc::new(RwLock::new(catalog)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the single-writer lock for a run.
    pub fn lock(&self, owner: &str) -> Result<RunLock> {
        RunLock::acquire(&self.root, owner)
    }

    // ========================================================================
    // Write Operations
    // ========================================================================

    /// Drop-and-recreate `table`.
    pub fn create_or_replace_table(&self, table: &Table) -> Result<()> {
        self.write_object(&table.name, ObjectKind::Table, table, Some(table.len()))?;
        tracing::debug!(table = %table.name, rows = table.len(), "replaced table");
        Ok(())
    }

    /// Store (replacing) a search index or analytic view definition.
    pub fn put_definition<T: Serialize>(&self, kind: ObjectKind, name: &str, def: &T) -> Result<()> {
        self.write_object(name, kind, def, None)?;
        tracing::debug!(object = %name, kind = %kind, "replaced definition");
        Ok(())
    }

    /// Remove an object and its file. Returns whether it existed.
    pub fn drop_object(&self, name: &str) -> Result<bool> {
        let mut catalog = self.catalog.write();
        let Some(entry) = catalog.objects.remove(name) else {
            return Ok(false);
        };
        let path = self.root.join(&entry.file);
        if path.exists() {
            std::fs::remove_file(&path).map_err(io_err(&path))?;
        }
        self.save_catalog(&catalog)?;
        tracing::info!(object = %name, kind = %entry.kind, "dropped object");
        Ok(true)
    }

    /// Drop every object of `kind` not named in `keep`. Returns the dropped names.
    pub fn prune(&self, kind: ObjectKind, keep: &BTreeSet<String>) -> Result<Vec<String>> {
        let orphans: Vec<String> = self
            .objects(kind)
            .into_iter()
            .map(|e| e.name)
            .filter(|name| !keep.contains(name))
            .collect();
        for name in &orphans {
            self.drop_object(name)?;
        }
        Ok(orphans)
    }

    fn write_object<T: Serialize>(
        &self,
        name: &str,
        kind: ObjectKind,
        value: &T,
        row_count: Option<usize>,
    ) -> Result<()> {
        validate_name(name)?;
        let mut catalog = self.catalog.write();
        if let Some(existing) = catalog.objects.get(name) {
            if existing.kind != kind {
                return Err(StorageError::KindConflict {
                    name: name.to_string(),
                    existing: existing.kind,
                    requested: kind,
                });
            }
        }

        let file = format!("{}/{}.json", kind.dir(), name);
        let bytes = serde_json::to_vec(value).map_err(serde_err(name))?;
        write_atomic(&self.root.join(&file), &bytes)?;

        catalog.objects.insert(
            name.to_string(),
            CatalogEntry {
                name: name.to_string(),
                kind,
                file,
                row_count,
                replaced_at: Utc::now(),
            },
        );
        self.save_catalog(&catalog)
    }

    fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        let json = serde_json::to_vec_pretty(catalog).map_err(serde_err(CATALOG_FILE))?;
        write_atomic(&self.root.join(CATALOG_FILE), &json)
    }

    // ========================================================================
    // Read Operations
    // ========================================================================

    pub fn table(&self, name: &str) -> Result<Table> {
        self.read_object(name, ObjectKind::Table)
    }

    pub fn definition<T: DeserializeOwned>(&self, kind: ObjectKind, name: &str) -> Result<T> {
        self.read_object(name, kind)
    }

    fn read_object<T: DeserializeOwned>(&self, name: &str, kind: ObjectKind) -> Result<T> {
        let entry = self
            .entry(name)
            .filter(|e| e.kind == kind)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        let path = self.root.join(&entry.file);
        let bytes = std::fs::read(&path).map_err(io_err(&path))?;
        serde_json::from_slice(&bytes).map_err(serde_err(name))
    }

    pub fn entry(&self, name: &str) -> Option<CatalogEntry> {
        self.catalog.read().objects.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.catalog.read().objects.contains_key(name)
    }

    /// Catalog entries of one kind, ordered by name.
    pub fn objects(&self, kind: ObjectKind) -> Vec<CatalogEntry> {
        self.catalog
            .read()
            .objects
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    // ========================================================================
    // Run Summaries
    // ========================================================================

    /// Persist a run summary as `runs/<run_id>.json` and `runs/latest.json`.
    pub fn write_run_summary<T: Serialize>(&self, run_id: &str, summary: &T) -> Result<PathBuf> {
        let json = serde_json::to_vec_pretty(summary).map_err(serde_err(run_id))?;
        let dir = self.root.join(RUNS_DIR);
        let path = dir.join(format!("{run_id}.json"));
        write_atomic(&path, &json)?;
        write_atomic(&dir.join(LATEST_RUN), &json)?;
        Ok(path)
    }

    pub fn read_latest_run<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let path = self.root.join(RUNS_DIR).join(LATEST_RUN);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(io_err(&path))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(serde_err(LATEST_RUN))
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// Write to `<path>.tmp` and rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    std::fs::rename(&tmp, path).map_err(io_err(path))
}
