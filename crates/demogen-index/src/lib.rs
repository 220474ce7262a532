//! Demogen Index
//!
//! The two downstream surfaces a conversational agent consumes:
//!
//! - **Search indices** ([`SearchService`]): one per source collection,
//!   scoped to the content column, exposing id/title/attribute columns for
//!   citation, with a query-preview returning ranked snippets.
//! - **Analytic views** ([`AnalyticService`]): dimensions, metrics and
//!   synonyms over the structured tables.
//!
//! Both are defined, never altered: every provisioning call replaces the
//! object wholesale.

mod error;
pub mod search;
pub mod service;
pub mod text;
pub mod view;

pub use error::{ProvisioningError, ViewDefinitionError};
pub use search::{IndexSpec, RowFilter, SearchIndex, Snippet};
pub use service::{
    AnalyticService, IndexHandle, LocalAnalyticService, LocalSearchService, SearchService,
    ViewHandle,
};
pub use view::{
    Aggregation, AnalyticViewDef, Dimension, LogicalTable, Metric, Relationship, ViewQuery,
    ViewResult,
};
