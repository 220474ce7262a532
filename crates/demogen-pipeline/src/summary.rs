//! The structured run report: per-stage timing, per-source counts, failed
//! canaries and the terminal status.

use chrono::{DateTime, Utc};
use demogen_llm::GroupReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::validate::ValidationResult;

/// Run state machine.
///
/// ```text
/// GeneratingEntities → RenderingPrompts → Completing → Materializing
///        → Provisioning → Validating → { Ready | Failed }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    GeneratingEntities,
    RenderingPrompts,
    Completing,
    Materializing,
    Provisioning,
    Validating,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::GeneratingEntities,
        Stage::RenderingPrompts,
        Stage::Completing,
        Stage::Materializing,
        Stage::Provisioning,
        Stage::Validating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::GeneratingEntities => "GENERATING_ENTITIES",
            Stage::RenderingPrompts => "RENDERING_PROMPTS",
            Stage::Completing => "COMPLETING",
            Stage::Materializing => "MATERIALIZING",
            Stage::Provisioning => "PROVISIONING",
            Stage::Validating => "VALIDATING",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Ready,
    Failed {
        stage: Stage,
        /// Taxonomy name of the error, e.g. `ProvisioningError`.
        kind: String,
        cause: String,
    },
}

impl RunStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, RunStatus::Ready)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ready => f.write_str("READY"),
            RunStatus::Failed { stage, .. } => write!(f, "FAILED ({stage})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub succeeded: bool,
}

/// Corpus accounting for one source type: `prompts == generated + failed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub table: String,
    pub index: String,
    pub model: String,
    pub prompts: usize,
    pub generated: usize,
    pub failed: usize,
    /// Documents served by the index after provisioning.
    #[serde(default)]
    pub indexed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub entities: usize,
    pub financial_rows: usize,
    pub stages: Vec<StageRecord>,
    pub sources: BTreeMap<String, SourceSummary>,
    pub completion_groups: Vec<GroupReport>,
    pub views: Vec<String>,
    /// Objects left over from earlier runs and dropped by this one.
    pub pruned: Vec<String>,
    pub validation: Vec<ValidationResult>,
}

impl RunSummary {
    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    pub fn failed_canaries(&self) -> Vec<&ValidationResult> {
        self.validation.iter().filter(|r| !r.passed).collect()
    }

    pub fn prompts(&self) -> usize {
        self.sources.values().map(|s| s.prompts).sum()
    }

    pub fn generated(&self) -> usize {
        self.sources.values().map(|s| s.generated).sum()
    }

    pub fn failed_documents(&self) -> usize {
        self.sources.values().map(|s| s.failed).sum()
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Accumulates a summary while the run advances through its stages.
pub(crate) struct RunRecorder {
    summary: RunSummary,
    current: Option<(Stage, DateTime<Utc>)>,
}

impl RunRecorder {
    pub(crate) fn new(run_id: String, seed: u64) -> Self {
        let now = Utc::now();
        Self {
            summary: RunSummary {
                run_id,
                seed,
                started_at: now,
                finished_at: now,
                status: RunStatus::Ready,
                entities: 0,
                financial_rows: 0,
                stages: Vec::new(),
                sources: BTreeMap::new(),
                completion_groups: Vec::new(),
                views: Vec::new(),
                pruned: Vec::new(),
                validation: Vec::new(),
            },
            current: None,
        }
    }

    pub(crate) fn summary_mut(&mut self) -> &mut RunSummary {
        &mut self.summary
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        self.close(true);
        self.current = Some((stage, Utc::now()));
    }

    pub(crate) fn current_stage(&self) -> Stage {
        self.current
            .map(|(stage, _)| stage)
            .unwrap_or(Stage::GeneratingEntities)
    }

    fn close(&mut self, succeeded: bool) {
        if let Some((stage, started_at)) = self.current.take() {
            let elapsed = Utc::now().signed_duration_since(started_at);
            self.summary.stages.push(StageRecord {
                stage,
                started_at,
                elapsed_ms: elapsed.num_milliseconds().max(0) as u64,
                succeeded,
            });
        }
    }

    pub(crate) fn finish(mut self, status: RunStatus) -> RunSummary {
        self.close(status.is_ready());
        self.summary.status = status;
        self.summary.finished_at = Utc::now();
        self.summary
    }
}
