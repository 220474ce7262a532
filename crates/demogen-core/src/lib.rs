//! Demogen Core
//!
//! Everything that happens before the first completion call:
//!
//! ```text
//! ┌────────────────┐     ┌──────────────────┐     ┌───────────────────┐
//! │ PipelineConfig │────►│ EntityGenerator  │────►│ TemplateRenderer  │────► PromptInstance[]
//! │ (toml + env)   │     │ (EntityUniverse) │     │ (per source plan) │
//! └────────────────┘     └──────────────────┘     └───────────────────┘
//!         │                       ▲                       ▲
//!         └──── seed ──► DeterministicRng::fork("entities" / "prompts/<source>")
//! ```
//!
//! ## Key Properties
//!
//! - **Deterministic**: identical config and seed give byte-identical entities and prompts
//! - **Pinned entities**: must-exist names are always present and never truncated
//! - **Fail loud**: config problems and unresolved placeholders are errors, never partial output

mod builtin;
pub mod config;
pub mod entity;
mod error;
pub mod prompt;
pub mod quarter;
pub mod records;
pub mod rng;
pub mod template;

pub use config::{
    CanarySpec, CategoryConfig, CompletionConfig, PinnedEntity, PipelineConfig, PlanScope,
    ProvisioningConfig, SourceConfig, ValidationConfig,
};
pub use entity::{Entity, EntityGenerator, EntityUniverse, QuarterlyMetrics};
pub use error::{ConfigError, GenerationError};
pub use prompt::{PromptInstance, TemplateRenderer};
pub use quarter::Quarter;
pub use records::{DocumentStatus, EntityRow, FinancialRow, GeneratedDocument, PromptRow};
pub use rng::DeterministicRng;
pub use template::{Bindings, PromptTemplate};

/// Label of the entity stream forked from the run seed.
pub const ENTITY_STREAM: &str = "entities";
