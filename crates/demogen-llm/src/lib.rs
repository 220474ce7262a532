//! Completion Service Boundary
//!
//! Input is a model name and prompt text; output is generated text or an
//! error. Everything else (batching, retries, fallback) lives in the
//! [`orchestrator`].
//!
//! Implementations:
//! - [`providers`]: OpenAI chat-completions, Anthropic messages, local OpenAI-compatible servers
//! - [`OfflineCompletionService`]: deterministic markdown documents, no network
//! - [`ScriptedCompletionService`]: scriptable failures for exercising retry paths

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

mod offline;
pub mod orchestrator;
pub mod providers;
mod scripted;

pub use offline::OfflineCompletionService;
pub use orchestrator::{
    CompletionOrchestrator, CompletionOutcome, CompletionPath, CompletionPolicy, CompletionReport,
    CompletionTask, GroupReport, OrchestratorEvent,
};
pub use scripted::ScriptedCompletionService;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompletionError {
    #[error("API error: {0}")]
    Api(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("empty completion")]
    Empty,
}

impl CompletionError {
    /// Errors worth retrying as-is (as opposed to a rejected prompt).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionError::RateLimited { .. }
                | CompletionError::Unavailable(_)
                | CompletionError::Network(_)
                | CompletionError::Timeout(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CompletionError::RateLimited { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

/// Outcome of one row inside a bulk call.
pub type RowResult = Result<String, CompletionError>;

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    /// Complete a single prompt.
    async fn complete(&self, model: &str, prompt: &str) -> Result<String, CompletionError>;

    /// Upper bound on in-flight requests a bulk call fans out to.
    fn max_concurrency(&self) -> usize {
        4
    }

    /// One bulk call for a whole batch.
    ///
    /// `Err` means the batch as a whole failed. `Ok` carries one result per
    /// prompt, in prompt order; individual rows may still have failed.
    async fn complete_batch(
        &self,
        model: &str,
        prompts: &[String],
    ) -> Result<Vec<RowResult>, CompletionError> {
        let calls: Vec<_> = prompts
            .iter()
            .map(|prompt| self.complete(model, prompt))
            .collect();
        let results: Vec<RowResult> = futures::stream::iter(calls)
            .buffered(self.max_concurrency().max(1))
            .collect()
            .await;

        // Every row failing for transport reasons is the service being down.
        let all_transient = !results.is_empty()
            && results
                .iter()
                .all(|r| matches!(r, Err(e) if e.is_transient()));
        if all_transient {
            if let Some(Err(e)) = results.into_iter().next() {
                return Err(e);
            }
            return Err(CompletionError::Unavailable("all rows failed".to_string()));
        }
        Ok(results)
    }
}

#[async_trait]
impl<T: CompletionService + ?Sized> CompletionService for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String, CompletionError> {
        (**self).complete(model, prompt).await
    }

    fn max_concurrency(&self) -> usize {
        (**self).max_concurrency()
    }

    async fn complete_batch(
        &self,
        model: &str,
        prompts: &[String],
    ) -> Result<Vec<RowResult>, CompletionError> {
        (**self).complete_batch(model, prompts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        fail_all: bool,
    }

    #[async_trait]
    impl CompletionService for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _model: &str, prompt: &str) -> Result<String, CompletionError> {
            if self.fail_all {
                Err(CompletionError::Network("connection refused".to_string()))
            } else if prompt.contains("bad") {
                Err(CompletionError::Api("content rejected".to_string()))
            } else {
                Ok(format!("ok: {prompt}"))
            }
        }
    }

    fn prompts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn default_batch_keeps_prompt_order_and_row_errors() {
        let svc = Flaky { fail_all: false };
        let rows = svc
            .complete_batch("m", &prompts(&["a", "bad", "c"]))
            .await
            .unwrap();
        assert_eq!(rows[0], Ok("ok: a".to_string()));
        assert!(matches!(rows[1], Err(CompletionError::Api(_))));
        assert_eq!(rows[2], Ok("ok: c".to_string()));
    }

    #[tokio::test]
    async fn all_transient_rows_fail_the_batch() {
        let svc = Flaky { fail_all: true };
        let err = svc
            .complete_batch("m", &prompts(&["a", "b"]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        assert_eq!(
            CompletionError::RateLimited { retry_after_ms: 1500 }.retry_after(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(CompletionError::Empty.retry_after(), None);
        assert!(!CompletionError::Api("x".into()).is_transient());
    }
}
