use demogen_core::{ConfigError, GenerationError};
use demogen_index::ProvisioningError;
use demogen_storage::StorageError;

/// A completed row could not become a document.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MaterializationError {
    #[error("document for prompt `{prompt_instance_id}` has no id")]
    MissingId { prompt_instance_id: String },
    #[error("document `{document_id}` has no title")]
    MissingTitle { document_id: String },
    #[error("no completion outcome recorded for prompt `{0}`")]
    MissingOutcome(String),
}

/// Stage-terminal failure of a run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),
    #[error("completion exhausted retries: {failed} of {total} prompts failed (limit {max_ratio})")]
    Completion {
        failed: usize,
        total: usize,
        max_ratio: f64,
    },
    #[error("materialization error: {0}")]
    Materialization(#[from] MaterializationError),
    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),
    #[error("validation failed: {} canary queries did not pass ({})", .failed.len(), .failed.join(", "))]
    Validation { failed: Vec<String> },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("run cancelled before {0}")]
    Cancelled(String),
}

impl PipelineError {
    /// Short taxonomy name, used in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "ConfigurationError",
            PipelineError::Generation(_) => "GenerationError",
            PipelineError::Completion { .. } => "CompletionError",
            PipelineError::Materialization(_) => "MaterializationError",
            PipelineError::Provisioning(_) => "ProvisioningError",
            PipelineError::Validation { .. } => "ValidationFailure",
            PipelineError::Storage(_) => "StorageError",
            PipelineError::Cancelled(_) => "Cancelled",
        }
    }
}
