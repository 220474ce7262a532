//! Demogen Pipeline
//!
//! Drives one regeneration of the demo environment end to end:
//!
//! ```text
//! ┌────────────┐   ┌───────────┐   ┌────────────┐   ┌──────────────┐
//! │  entities  │──►│  prompts  │──►│ completion │──►│ materializer │
//! └────────────┘   └───────────┘   └────────────┘   └──────┬───────┘
//!       │                                                  │
//!       ▼                                                  ▼
//!  entities / quarterly_financials            <source>_documents tables
//!       │                                                  │
//!       └──────────────► provisioner ◄─────────────────────┘
//!                            │  indices + views
//!                            ▼
//!                        validator ──► READY | FAILED
//! ```
//!
//! ## Key Properties
//!
//! - **Deterministic**: same seed and configuration, same entities and
//!   byte-identical prompts.
//! - **No silent drops**: every prompt yields a document or a `FAILED`
//!   placeholder.
//! - **Idempotent**: every object is replaced wholesale; orphans from earlier
//!   runs are pruned.
//! - **Gated**: `READY` only after every canary passes.
//! - **Exclusive**: a run holds the warehouse lock for its whole duration.

mod error;
pub mod events;
pub mod materialize;
pub mod provision;
pub mod run;
pub mod summary;
pub mod tables;
pub mod validate;

pub use error::{MaterializationError, PipelineError};
pub use events::{PipelineEvent, PipelineEventHandler};
pub use materialize::DocumentMaterializer;
pub use provision::{Provisioner, ProvisioningReport};
pub use run::{
    completion_policy, generate_universe, render_prompts, CancellationFlag, Pipeline,
};
pub use summary::{RunStatus, RunSummary, SourceSummary, Stage, StageRecord};
pub use validate::{ReadinessValidator, TargetKind, ValidationResult};
