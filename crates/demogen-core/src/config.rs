//! Pipeline configuration.
//!
//! One explicit struct, enumerated once at run start. Every section has
//! documented defaults so an empty file (or no file at all) is a valid demo
//! configuration.
//!
//! Loading order:
//! 1. defaults,
//! 2. TOML file (`PipelineConfig::from_file`),
//! 3. `DEMOGEN_*` environment overrides (`PipelineConfig::apply_env_overrides`).
//!
//! Supported overrides:
//! - `DEMOGEN_SEED` → `seed`
//! - `DEMOGEN_ENTITY_COUNT` → `entity_count`
//! - `DEMOGEN_HISTORY_QUARTERS` → `history_quarters`
//! - `DEMOGEN_START_QUARTER` → `start_quarter`
//! - `DEMOGEN_MUST_EXIST` → `must_exist` (comma separated names)
//! - `DEMOGEN_DEFAULT_MODEL` → `default_model`
//! - `DEMOGEN_WAREHOUSE_DIR` → `warehouse_dir`

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::builtin;
use crate::entity::{in_name_pool, name_capacity};
use crate::template::{parse_placeholders, PromptTemplate, KNOWN_BINDINGS};
use crate::{ConfigError, Quarter};

/// Languages a document may be requested in, with the name used in prompts.
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("de", "German"),
    ("en", "English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("nl", "Dutch"),
    ("pt", "Portuguese"),
    ("zh", "Chinese"),
];

const MAX_HISTORY_QUARTERS: usize = 80;

pub fn language_name(code: &str) -> Option<&'static str> {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root seed for every random choice in the run.
    pub seed: u64,
    /// Total entities, pinned ones included.
    pub entity_count: usize,
    /// Points in each quarterly series.
    pub history_quarters: usize,
    /// First quarter of the series, e.g. `2023Q1`.
    pub start_quarter: String,
    /// Entities that must exist after every regeneration.
    pub must_exist: Vec<PinnedEntity>,
    /// Model used by sources that do not name one.
    pub default_model: String,
    /// Directory holding tables, index/view definitions and run summaries.
    pub warehouse_dir: PathBuf,
    pub categories: Vec<CategoryConfig>,
    /// Language code → relative share of generated documents.
    pub language_mix: BTreeMap<String, f64>,
    pub completion: CompletionConfig,
    pub provisioning: ProvisioningConfig,
    pub validation: ValidationConfig,
    pub sources: Vec<SourceConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            entity_count: 12,
            history_quarters: 8,
            start_quarter: "2023Q1".to_string(),
            must_exist: Vec::new(),
            default_model: "llama3.1-70b".to_string(),
            warehouse_dir: PathBuf::from("./warehouse"),
            categories: builtin::default_categories(),
            language_mix: BTreeMap::from([("en".to_string(), 1.0)]),
            completion: CompletionConfig::default(),
            provisioning: ProvisioningConfig::default(),
            validation: ValidationConfig::default(),
            sources: builtin::default_sources(),
        }
    }
}

/// An entity a demo script refers to by name.
///
/// In TOML either a bare string (`must_exist = ["Acme Freight"]`) or a table
/// (`{ name = "Acme Freight", category = "private" }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PinnedEntityRepr")]
pub struct PinnedEntity {
    pub name: String,
    pub category: Option<String>,
    pub sector: Option<String>,
}

impl PinnedEntity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            sector: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PinnedEntityRepr {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        sector: Option<String>,
    },
}

impl From<PinnedEntityRepr> for PinnedEntity {
    fn from(repr: PinnedEntityRepr) -> Self {
        match repr {
            PinnedEntityRepr::Name(name) => PinnedEntity::named(name),
            PinnedEntityRepr::Detailed {
                name,
                category,
                sector,
            } => PinnedEntity {
                name,
                category,
                sector,
            },
        }
    }
}

/// Shape of the synthetic series for one class of entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    /// Relative share of generated (non-pinned) entities.
    pub weight: f64,
    /// Typical quarterly revenue in millions.
    pub base_revenue: f64,
    /// Mean quarter-on-quarter growth.
    pub drift: f64,
    /// Scale of the smoothed growth shocks.
    pub volatility: f64,
    /// Long-run operating margin the margin walk reverts to.
    pub margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Attempts for a whole-batch call before the batch degrades to per-row calls.
    pub max_batch_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Attempts for each per-row fallback call.
    pub row_attempts: u32,
    /// Timeout for a single completion.
    pub request_timeout_secs: u64,
    /// Timeout for one bulk call; unset scales the single-call timeout by
    /// the round-trips the batch needs.
    pub batch_timeout_secs: Option<u64>,
    /// Concurrent per-row fallback calls within one model group.
    pub fallback_concurrency: usize,
    /// Failed fraction of all prompts above which the run fails.
    pub max_failure_ratio: f64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_batch_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            row_attempts: 2,
            request_timeout_secs: 120,
            batch_timeout_secs: None,
            fallback_concurrency: 4,
            max_failure_ratio: 0.5,
        }
    }
}

impl CompletionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.map(Duration::from_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Timeout for each index/view provisioning or probe call.
    pub call_timeout_secs: u64,
    /// Default freshness policy (target lag) for search indices.
    pub refresh_interval_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 60,
            refresh_interval_secs: 3_600,
        }
    }
}

impl ProvisioningConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Appended to entity names to form canary queries, e.g. `pricing`.
    pub canary_suffix: Option<String>,
    /// Hits a canary needs to pass.
    pub min_hits: usize,
    /// Snippets requested per canary query.
    pub result_limit: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            canary_suffix: None,
            min_hits: 1,
            result_limit: 10,
        }
    }
}

/// One simulated external provider: a document table plus its search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source-type tag, also the stem of its table and index names.
    pub name: String,
    /// Human label used in prompts and titles.
    pub label: String,
    /// Overrides `default_model`.
    #[serde(default)]
    pub model: Option<String>,
    pub scope: PlanScope,
    /// Whether documents carry a link to the entity they were generated for.
    #[serde(default = "default_true")]
    pub link_entity: bool,
    pub templates: Vec<PromptTemplate>,
    /// Bindings copied onto each document as filterable attribute columns.
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub canary: CanarySpec,
    /// Overrides `provisioning.refresh_interval_secs` for this index.
    #[serde(default)]
    pub target_lag_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    pub fn table_name(&self) -> String {
        format!("{}_documents", self.name)
    }

    pub fn index_name(&self) -> String {
        format!("{}_search", self.name)
    }

    pub fn model<'a>(&'a self, default_model: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(default_model)
    }
}

/// Which prompts a source type needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanScope {
    /// `documents_per_entity` prompts for every entity.
    PerEntity { documents_per_entity: usize },
    /// One prompt per entity for each of the most recent quarters.
    PerEntityQuarter { recent_quarters: usize },
    /// `count` prompts not bound to a single entity.
    Global { count: usize },
}

/// Known-answer query used to check the source's index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanarySpec {
    /// One query per guaranteed entity, built from its name.
    #[default]
    Entity,
    /// A fixed query expected to return hits.
    Term { query: String },
}

impl PipelineConfig {
    /// Load a TOML file and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
                key: key.to_string(),
                message: e.to_string(),
            })
        }

        if let Some(v) = lookup("DEMOGEN_SEED") {
            self.seed = parse("DEMOGEN_SEED", &v)?;
        }
        if let Some(v) = lookup("DEMOGEN_ENTITY_COUNT") {
            self.entity_count = parse("DEMOGEN_ENTITY_COUNT", &v)?;
        }
        if let Some(v) = lookup("DEMOGEN_HISTORY_QUARTERS") {
            self.history_quarters = parse("DEMOGEN_HISTORY_QUARTERS", &v)?;
        }
        if let Some(v) = lookup("DEMOGEN_START_QUARTER") {
            self.start_quarter = v.trim().to_string();
        }
        if let Some(v) = lookup("DEMOGEN_MUST_EXIST") {
            self.must_exist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PinnedEntity::named)
                .collect();
        }
        if let Some(v) = lookup("DEMOGEN_DEFAULT_MODEL") {
            self.default_model = v.trim().to_string();
        }
        if let Some(v) = lookup("DEMOGEN_WAREHOUSE_DIR") {
            self.warehouse_dir = PathBuf::from(v.trim());
        }
        Ok(())
    }

    pub fn start(&self) -> Result<Quarter, ConfigError> {
        self.start_quarter.parse()
    }

    /// All quarters of the configured history.
    pub fn quarters(&self) -> Result<Vec<Quarter>, ConfigError> {
        Ok(self.start()?.series(self.history_quarters))
    }

    pub fn category(&self, name: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Reject invalid or conflicting parameters before anything is generated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_entities()?;
        self.validate_categories()?;
        self.validate_dates()?;
        self.validate_language_mix()?;
        self.validate_completion()?;
        self.validate_sources()?;

        if self.validation.min_hits == 0 {
            return Err(ConfigError::InvalidValidation(
                "validation.min_hits must be > 0".to_string(),
            ));
        }
        if self.validation.result_limit < self.validation.min_hits {
            return Err(ConfigError::InvalidValidation(format!(
                "validation.result_limit ({}) must be >= validation.min_hits ({})",
                self.validation.result_limit, self.validation.min_hits
            )));
        }
        Ok(())
    }

    fn validate_entities(&self) -> Result<(), ConfigError> {
        if self.entity_count == 0 {
            return Err(ConfigError::ZeroEntities);
        }
        if self.entity_count < self.must_exist.len() {
            return Err(ConfigError::PinnedExceedsCount {
                count: self.entity_count,
                pinned: self.must_exist.len(),
            });
        }

        let mut seen = BTreeSet::new();
        for pinned in &self.must_exist {
            let key = pinned.name.trim().to_lowercase();
            if key.is_empty() {
                return Err(ConfigError::EmptyPinnedName);
            }
            if !seen.insert(key) {
                return Err(ConfigError::DuplicatePinned(pinned.name.clone()));
            }
            if let Some(category) = &pinned.category {
                if self.category(category).is_none() {
                    return Err(ConfigError::UnknownCategory {
                        entity: pinned.name.clone(),
                        category: category.clone(),
                    });
                }
            }
        }

        let random = self.entity_count - self.must_exist.len();
        let colliding = self
            .must_exist
            .iter()
            .filter(|p| in_name_pool(&p.name))
            .count();
        let available = name_capacity() - colliding;
        if random > available {
            return Err(ConfigError::TooManyEntities {
                requested: self.entity_count,
                available: available + self.must_exist.len(),
            });
        }
        Ok(())
    }

    fn validate_categories(&self) -> Result<(), ConfigError> {
        if self.categories.is_empty() {
            return Err(ConfigError::InvalidCategory(
                "at least one category is required".to_string(),
            ));
        }
        let mut names = BTreeSet::new();
        for c in &self.categories {
            if c.name.trim().is_empty() {
                return Err(ConfigError::InvalidCategory(
                    "category name must not be empty".to_string(),
                ));
            }
            if !names.insert(c.name.as_str()) {
                return Err(ConfigError::InvalidCategory(format!(
                    "duplicate category `{}`",
                    c.name
                )));
            }
            if !(c.weight.is_finite() && c.weight > 0.0) {
                return Err(ConfigError::InvalidCategory(format!(
                    "category `{}` weight must be > 0 (got {})",
                    c.name, c.weight
                )));
            }
            if !(c.base_revenue.is_finite() && c.base_revenue > 0.0) {
                return Err(ConfigError::InvalidCategory(format!(
                    "category `{}` base_revenue must be > 0 (got {})",
                    c.name, c.base_revenue
                )));
            }
            if !(c.volatility.is_finite() && c.volatility >= 0.0) {
                return Err(ConfigError::InvalidCategory(format!(
                    "category `{}` volatility must be >= 0 (got {})",
                    c.name, c.volatility
                )));
            }
            if !c.drift.is_finite() || c.drift.abs() >= 1.0 {
                return Err(ConfigError::InvalidCategory(format!(
                    "category `{}` drift must be within (-1, 1) (got {})",
                    c.name, c.drift
                )));
            }
            if !c.margin.is_finite() || !(-1.0..1.0).contains(&c.margin) {
                return Err(ConfigError::InvalidCategory(format!(
                    "category `{}` margin must be within [-1, 1) (got {})",
                    c.name, c.margin
                )));
            }
        }
        Ok(())
    }

    fn validate_dates(&self) -> Result<(), ConfigError> {
        if self.history_quarters == 0 || self.history_quarters > MAX_HISTORY_QUARTERS {
            return Err(ConfigError::InvalidDateRange(format!(
                "history_quarters must be within 1..={MAX_HISTORY_QUARTERS} (got {})",
                self.history_quarters
            )));
        }
        let start = self.start()?;
        // The last quarter must also be representable.
        let mut last = start;
        for _ in 1..self.history_quarters {
            last = last.next();
        }
        Quarter::new(last.year(), last.number())?;
        Ok(())
    }

    fn validate_language_mix(&self) -> Result<(), ConfigError> {
        if self.language_mix.is_empty() {
            return Err(ConfigError::InvalidLanguageMix(
                "at least one language is required".to_string(),
            ));
        }
        let mut total = 0.0;
        for (code, ratio) in &self.language_mix {
            if language_name(code).is_none() {
                return Err(ConfigError::InvalidLanguageMix(format!(
                    "unsupported language `{code}`"
                )));
            }
            if !(ratio.is_finite() && *ratio >= 0.0) {
                return Err(ConfigError::InvalidLanguageMix(format!(
                    "ratio for `{code}` must be >= 0 (got {ratio})"
                )));
            }
            total += ratio;
        }
        if total <= 0.0 {
            return Err(ConfigError::InvalidLanguageMix(
                "ratios must not all be zero".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_completion(&self) -> Result<(), ConfigError> {
        let c = &self.completion;
        if c.max_batch_attempts == 0 {
            return Err(ConfigError::InvalidCompletion(
                "max_batch_attempts must be > 0".to_string(),
            ));
        }
        if c.row_attempts == 0 {
            return Err(ConfigError::InvalidCompletion(
                "row_attempts must be > 0".to_string(),
            ));
        }
        if c.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidCompletion(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }
        if c.batch_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidCompletion(
                "batch_timeout_secs must be > 0 when set".to_string(),
            ));
        }
        if c.fallback_concurrency == 0 {
            return Err(ConfigError::InvalidCompletion(
                "fallback_concurrency must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&c.max_failure_ratio) {
            return Err(ConfigError::InvalidCompletion(format!(
                "max_failure_ratio must be within [0, 1] (got {})",
                c.max_failure_ratio
            )));
        }
        if c.backoff_max_ms < c.backoff_base_ms {
            return Err(ConfigError::InvalidCompletion(
                "backoff_max_ms must be >= backoff_base_ms".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_sources(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::InvalidSource {
                name: "<none>".to_string(),
                reason: "at least one source is required".to_string(),
            });
        }
        let mut names = BTreeSet::new();
        let mut template_ids = BTreeSet::new();
        for source in &self.sources {
            let invalid = |reason: String| ConfigError::InvalidSource {
                name: source.name.clone(),
                reason,
            };
            let name_ok = !source.name.is_empty()
                && source
                    .name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !name_ok {
                return Err(invalid(
                    "name must be non-empty lowercase ascii, digits or `_`".to_string(),
                ));
            }
            if !names.insert(source.name.as_str()) {
                return Err(invalid("duplicate source name".to_string()));
            }
            if source.templates.is_empty() {
                return Err(invalid("no templates".to_string()));
            }
            if source.model(&self.default_model).trim().is_empty() {
                return Err(invalid("no model configured".to_string()));
            }
            match &source.scope {
                PlanScope::PerEntity {
                    documents_per_entity: 0,
                }
                | PlanScope::PerEntityQuarter { recent_quarters: 0 }
                | PlanScope::Global { count: 0 } => {
                    return Err(invalid("plan produces no prompts".to_string()));
                }
                _ => {}
            }
            if let CanarySpec::Term { query } = &source.canary {
                if query.trim().is_empty() {
                    return Err(invalid("canary term must not be empty".to_string()));
                }
            }
            for attr in &source.attributes {
                if !KNOWN_BINDINGS.contains(&attr.as_str()) {
                    return Err(invalid(format!("unknown attribute `{attr}`")));
                }
            }
            for template in &source.templates {
                if !template_ids.insert(template.id.as_str()) {
                    return Err(invalid(format!("duplicate template id `{}`", template.id)));
                }
                for text in [&template.text, &template.title] {
                    let placeholders = parse_placeholders(&template.id, text)
                        .map_err(|e| invalid(e.to_string()))?;
                    for p in placeholders {
                        if !KNOWN_BINDINGS.contains(&p.as_str()) {
                            return Err(invalid(format!(
                                "template `{}` uses unknown placeholder `{{{p}}}`",
                                template.id
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
