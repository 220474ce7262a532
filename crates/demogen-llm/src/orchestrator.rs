//! Completion Orchestrator
//!
//! Groups tasks by model and issues one bulk call per group; groups run
//! concurrently. Failure policy:
//!
//! ```text
//! bulk call ──ok──► rows ok ─────────────────────────────► Completed (Batch)
//!    │               └─ row failed ─► per-row fallback ──► Completed (RowFallback)
//!    │                                     └─ exhausted ─► Failed
//!    └─err─► retry with backoff (max_batch_attempts)
//!               └─ exhausted ─► every row to per-row fallback
//! ```
//!
//! Partial failures go straight to per-row fallback; whole-batch failures
//! use the batch retry budget first. Results are keyed by task id, never by
//! position.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::{CompletionError, CompletionService, RowResult};

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct CompletionPolicy {
    pub max_batch_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Attempts per row once a row falls back to single calls.
    pub row_attempts: u32,
    /// Timeout applied to each single call.
    pub request_timeout: Duration,
    /// Timeout for one bulk call. `None` scales `request_timeout` by the
    /// round-trips a fanned-out batch needs.
    pub batch_timeout: Option<Duration>,
    pub fallback_concurrency: usize,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            max_batch_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
            row_attempts: 2,
            request_timeout: Duration::from_secs(120),
            batch_timeout: None,
            fallback_concurrency: 4,
        }
    }
}

impl CompletionPolicy {
    /// `base * 2^retry`, capped at `backoff_max`. `retry` counts from 0.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Timeout for a bulk call of `rows` prompts served `concurrency` at a time.
    pub fn batch_timeout_for(&self, rows: usize, concurrency: usize) -> Duration {
        self.batch_timeout.unwrap_or_else(|| {
            let round_trips = rows.div_ceil(concurrency.max(1)).max(1);
            self.request_timeout
                .saturating_mul(u32::try_from(round_trips).unwrap_or(u32::MAX))
        })
    }

    /// Delay before the next attempt, honouring a server retry hint.
    fn delay_after(&self, error: &CompletionError, retry: u32) -> Duration {
        error
            .retry_after()
            .map(|hint| hint.min(self.backoff_max))
            .unwrap_or_else(|| self.backoff(retry))
    }
}

// ============================================================================
// Tasks and Outcomes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionTask {
    pub id: String,
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPath {
    Batch,
    RowFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed { text: String, path: CompletionPath },
    Failed { reason: String, attempts: u32 },
}

impl CompletionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CompletionOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub model: String,
    pub rows: usize,
    pub batch_attempts: u32,
    /// True when every bulk attempt failed and all rows fell back.
    pub batch_exhausted: bool,
    pub completed_in_batch: usize,
    pub completed_by_fallback: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub outcomes: BTreeMap<String, CompletionOutcome>,
    pub groups: Vec<GroupReport>,
}

impl CompletionReport {
    pub fn outcome(&self, task_id: &str) -> Option<&CompletionOutcome> {
        self.outcomes.get(task_id)
    }

    pub fn completed_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_completed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.completed_count()
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failed_count() as f64 / self.outcomes.len() as f64
        }
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    BatchStarted {
        model: String,
        rows: usize,
        attempt: u32,
    },
    BatchRetry {
        model: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    RowFallback {
        model: String,
        task_id: String,
        reason: String,
    },
    RowFailed {
        model: String,
        task_id: String,
        attempts: u32,
        error: String,
    },
}

pub type OrchestratorEventHandler = Box<dyn Fn(OrchestratorEvent) + Send + Sync>;

// ============================================================================
// Orchestrator
// ============================================================================

pub struct CompletionOrchestrator {
    service: Arc<dyn CompletionService>,
    policy: CompletionPolicy,
    handlers: Vec<OrchestratorEventHandler>,
}

impl CompletionOrchestrator {
    pub fn new(service: Arc<dyn CompletionService>, policy: CompletionPolicy) -> Self {
        Self {
            service,
            policy,
            handlers: Vec::new(),
        }
    }

    pub fn on_event(&mut self, handler: OrchestratorEventHandler) {
        self.handlers.push(handler);
    }

    fn emit(&self, event: OrchestratorEvent) {
        for handler in &self.handlers {
            handler(event.clone());
        }
    }

    /// Complete every task. Never fails as a whole: each task ends up
    /// `Completed` or `Failed`.
    pub async fn run(&self, tasks: Vec<CompletionTask>) -> CompletionReport {
        let mut groups: BTreeMap<String, Vec<CompletionTask>> = BTreeMap::new();
        for task in tasks {
            groups.entry(task.model.clone()).or_default().push(task);
        }

        let results =
            futures::future::join_all(groups.into_iter().map(|(model, tasks)| self.run_group(model, tasks)))
                .await;

        let mut report = CompletionReport::default();
        for (group, outcomes) in results {
            report.outcomes.extend(outcomes);
            report.groups.push(group);
        }
        report
    }

    async fn run_group(
        &self,
        model: String,
        tasks: Vec<CompletionTask>,
    ) -> (GroupReport, Vec<(String, CompletionOutcome)>) {
        let mut group = GroupReport {
            model: model.clone(),
            rows: tasks.len(),
            ..Default::default()
        };
        let prompts: Vec<String> = tasks.iter().map(|t| t.prompt.clone()).collect();

        let (rows, attempts) = self.bulk_with_retry(&model, &prompts).await;
        group.batch_attempts = attempts;

        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut fallback: Vec<(&CompletionTask, String)> = Vec::new();
        match rows {
            Ok(rows) => {
                for (task, row) in tasks.iter().zip(rows) {
                    match row {
                        Ok(text) if !text.trim().is_empty() => {
                            group.completed_in_batch += 1;
                            outcomes.push((
                                task.id.clone(),
                                CompletionOutcome::Completed {
                                    text,
                                    path: CompletionPath::Batch,
                                },
                            ));
                        }
                        Ok(_) => fallback.push((task, CompletionError::Empty.to_string())),
                        Err(e) => fallback.push((task, e.to_string())),
                    }
                }
            }
            Err(e) => {
                group.batch_exhausted = true;
                tracing::warn!(
                    model = %model,
                    attempts = attempts,
                    rows = tasks.len(),
                    error = %e,
                    "batch retries exhausted, falling back to per-row calls"
                );
                let reason = format!("batch failed after {attempts} attempts: {e}");
                fallback.extend(tasks.iter().map(|t| (t, reason.clone())));
            }
        }

        if !fallback.is_empty() {
            let concurrency = self.policy.fallback_concurrency.max(1);
            let fallback_outcomes: Vec<(String, CompletionOutcome)> = futures::stream::iter(fallback)
                .map(|(task, reason)| self.complete_row(&model, task, reason))
                .buffer_unordered(concurrency)
                .collect()
                .await;
            for (id, outcome) in fallback_outcomes {
                match &outcome {
                    CompletionOutcome::Completed { .. } => group.completed_by_fallback += 1,
                    CompletionOutcome::Failed { .. } => group.failed += 1,
                }
                outcomes.push((id, outcome));
            }
        }

        tracing::info!(
            model = %model,
            rows = group.rows,
            batch_attempts = group.batch_attempts,
            in_batch = group.completed_in_batch,
            by_fallback = group.completed_by_fallback,
            failed = group.failed,
            "completion group finished"
        );
        (group, outcomes)
    }

    /// Bulk call with whole-batch retries. Returns the rows (or the last
    /// error) and the number of attempts made.
    async fn bulk_with_retry(
        &self,
        model: &str,
        prompts: &[String],
    ) -> (Result<Vec<RowResult>, CompletionError>, u32) {
        let max_attempts = self.policy.max_batch_attempts.max(1);
        let timeout = self
            .policy
            .batch_timeout_for(prompts.len(), self.service.max_concurrency());
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.emit(OrchestratorEvent::BatchStarted {
                model: model.to_string(),
                rows: prompts.len(),
                attempt,
            });
            tracing::debug!(model = %model, rows = prompts.len(), attempt = attempt, "issuing bulk completion");

            let result = match tokio::time::timeout(
                timeout,
                self.service.complete_batch(model, prompts),
            )
            .await
            {
                Ok(Ok(rows)) if rows.len() == prompts.len() => return (Ok(rows), attempt),
                Ok(Ok(rows)) => CompletionError::InvalidResponse(format!(
                    "bulk call returned {} rows for {} prompts",
                    rows.len(),
                    prompts.len()
                )),
                Ok(Err(e)) => e,
                Err(_) => CompletionError::Timeout(timeout),
            };

            if attempt >= max_attempts {
                return (Err(result), attempt);
            }

            let delay = self.policy.delay_after(&result, attempt - 1);
            tracing::warn!(
                model = %model,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %result,
                "bulk completion failed, retrying"
            );
            self.emit(OrchestratorEvent::BatchRetry {
                model: model.to_string(),
                attempt,
                delay,
                error: result.to_string(),
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn complete_row(
        &self,
        model: &str,
        task: &CompletionTask,
        reason: String,
    ) -> (String, CompletionOutcome) {
        tracing::debug!(model = %model, task = %task.id, reason = %reason, "row fallback");
        self.emit(OrchestratorEvent::RowFallback {
            model: model.to_string(),
            task_id: task.id.clone(),
            reason,
        });

        let attempts = self.policy.row_attempts.max(1);
        let mut last_error = CompletionError::Empty;
        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                self.policy.request_timeout,
                self.service.complete(model, &task.prompt),
            )
            .await;
            match result {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    return (
                        task.id.clone(),
                        CompletionOutcome::Completed {
                            text,
                            path: CompletionPath::RowFallback,
                        },
                    );
                }
                Ok(Ok(_)) => last_error = CompletionError::Empty,
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = CompletionError::Timeout(self.policy.request_timeout),
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.delay_after(&last_error, attempt - 1)).await;
            }
        }

        tracing::warn!(
            model = %model,
            task = %task.id,
            attempts = attempts,
            error = %last_error,
            "row failed after fallback"
        );
        self.emit(OrchestratorEvent::RowFailed {
            model: model.to_string(),
            task_id: task.id.clone(),
            attempts,
            error: last_error.to_string(),
        });
        (
            task.id.clone(),
            CompletionOutcome::Failed {
                reason: last_error.to_string(),
                attempts,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = CompletionPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn batch_timeout_scales_with_round_trips() {
        let policy = CompletionPolicy {
            request_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(policy.batch_timeout_for(8, 2), Duration::from_secs(40));
        assert_eq!(policy.batch_timeout_for(3, 4), Duration::from_secs(10));
        assert_eq!(policy.batch_timeout_for(0, 4), Duration::from_secs(10));
        assert_eq!(policy.batch_timeout_for(5, 0), Duration::from_secs(50));

        let fixed = CompletionPolicy {
            batch_timeout: Some(Duration::from_secs(30)),
            ..policy
        };
        assert_eq!(fixed.batch_timeout_for(100, 1), Duration::from_secs(30));
    }

    #[test]
    fn rate_limit_hint_is_capped() {
        let policy = CompletionPolicy {
            backoff_max: Duration::from_secs(2),
            ..Default::default()
        };
        let err = CompletionError::RateLimited {
            retry_after_ms: 60_000,
        };
        assert_eq!(policy.delay_after(&err, 0), Duration::from_secs(2));
    }

    #[test]
    fn report_ratios() {
        let mut report = CompletionReport::default();
        assert_eq!(report.failure_ratio(), 0.0);
        report.outcomes.insert(
            "a".into(),
            CompletionOutcome::Completed {
                text: "x".into(),
                path: CompletionPath::Batch,
            },
        );
        report.outcomes.insert(
            "b".into(),
            CompletionOutcome::Failed {
                reason: "boom".into(),
                attempts: 2,
            },
        );
        assert_eq!(report.completed_count(), 1);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.failure_ratio(), 0.5);
    }
}
