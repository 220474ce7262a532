//! Errors raised before any completion call is made.
//!
//! Both kinds are fatal for a run: a [`ConfigError`] is raised while the
//! configuration is checked at run start, a [`GenerationError`] while prompt
//! templates are rendered.

/// Invalid or conflicting generation parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("entity_count must be > 0")]
    ZeroEntities,
    #[error(
        "entity_count ({count}) is smaller than the number of must-exist entities ({pinned}); \
         pinned entities are never truncated"
    )]
    PinnedExceedsCount { count: usize, pinned: usize },
    #[error("entity_count ({requested}) exceeds the {available} distinct names the generator can produce")]
    TooManyEntities { requested: usize, available: usize },
    #[error("duplicate must-exist entity `{0}`")]
    DuplicatePinned(String),
    #[error("must-exist entity name must not be empty")]
    EmptyPinnedName,
    #[error("invalid category config: {0}")]
    InvalidCategory(String),
    #[error("unknown category `{category}` for must-exist entity `{entity}`")]
    UnknownCategory { entity: String, category: String },
    #[error("invalid date range: {0}")]
    InvalidDateRange(String),
    #[error("invalid language mix: {0}")]
    InvalidLanguageMix(String),
    #[error("invalid source `{name}`: {reason}")]
    InvalidSource { name: String, reason: String },
    #[error("invalid completion settings: {0}")]
    InvalidCompletion(String),
    #[error("invalid validation settings: {0}")]
    InvalidValidation(String),
    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid environment override {key}: {message}")]
    Env { key: String, message: String },
}

/// A template could not be turned into a concrete prompt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("template `{template}` has unresolved placeholder `{{{placeholder}}}`")]
    UnresolvedPlaceholder { template: String, placeholder: String },
    #[error("template `{template}` is malformed at byte {offset}: {reason}")]
    MalformedTemplate {
        template: String,
        offset: usize,
        reason: &'static str,
    },
    #[error("source `{source_type}` has no templates")]
    NoTemplates { source_type: String },
}
