use demogen_storage::StorageError;
use std::time::Duration;

/// An index or view could not be created, replaced or queried.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("refusing to create index `{index}`: `{table}` has no rows to index")]
    EmptyCollection { index: String, table: String },
    #[error("`{object}`: source table `{table}` does not exist")]
    SourceNotFound { object: String, table: String },
    #[error("`{object}`: table `{table}` has no column `{column}`")]
    MissingColumn {
        object: String,
        table: String,
        column: String,
    },
    #[error("`{index}`: row {row} has no `{column}` value required for citation")]
    MissingCitation {
        index: String,
        row: usize,
        column: String,
    },
    #[error("index `{0}` does not exist")]
    IndexNotFound(String),
    #[error("view `{0}` does not exist")]
    ViewNotFound(String),
    #[error("provisioning `{object}` timed out after {after:?}")]
    Timeout { object: String, after: Duration },
    #[error(transparent)]
    Definition(#[from] ViewDefinitionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// An analytic view definition or query does not fit the warehouse.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ViewDefinitionError {
    #[error("view `{view}` declares no tables")]
    NoTables { view: String },
    #[error("view `{view}` declares no metrics")]
    NoMetrics { view: String },
    #[error("view `{view}`: unknown table alias `{alias}`")]
    UnknownAlias { view: String, alias: String },
    #[error("view `{view}`: table `{table}` does not exist")]
    UnknownTable { view: String, table: String },
    #[error("view `{view}`: `{table}` has no column `{column}`")]
    UnknownColumn {
        view: String,
        table: String,
        column: String,
    },
    #[error("view `{view}`: name `{name}` is declared more than once")]
    DuplicateName { view: String, name: String },
    #[error("view `{view}`: table `{alias}` is not reachable from `{base}` through relationships")]
    Unreachable {
        view: String,
        alias: String,
        base: String,
    },
    #[error("view `{view}`: unknown dimension or metric `{name}`")]
    UnknownField { view: String, name: String },
}
