//! Batch / retry / fallback behaviour of the completion orchestrator
//!
//! Every scenario runs against the scripted service, so no network is used.

use demogen_llm::{
    CompletionOrchestrator, CompletionOutcome, CompletionPath, CompletionPolicy, CompletionService,
    CompletionTask, OrchestratorEvent, ScriptedCompletionService,
};
use async_trait::async_trait;
use demogen_llm::{CompletionError, OfflineCompletionService};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Collects events emitted from concurrent groups.
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<OrchestratorEvent>>>);

impl EventLog {
    fn push(&self, event: OrchestratorEvent) {
        self.0.lock().push(event);
    }

    fn events(&self) -> Vec<OrchestratorEvent> {
        self.0.lock().clone()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fast_policy() -> CompletionPolicy {
    CompletionPolicy {
        max_batch_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        row_attempts: 2,
        request_timeout: Duration::from_secs(5),
        batch_timeout: None,
        fallback_concurrency: 4,
    }
}

fn tasks(model: &str, n: usize) -> Vec<CompletionTask> {
    (0..n)
        .map(|i| CompletionTask {
            id: format!("{model}-{i}"),
            model: model.to_string(),
            prompt: format!("Write about row {i} for {model}.\n\nTitle: Row {i}\nFormat: Markdown."),
        })
        .collect()
}

fn orchestrator(service: Arc<ScriptedCompletionService>) -> (CompletionOrchestrator, EventLog) {
    let log = EventLog::default();
    let mut orch = CompletionOrchestrator::new(service, fast_policy());
    let sink = log.clone();
    orch.on_event(Box::new(move |e| sink.push(e)));
    (orch, log)
}

fn path_of(outcome: Option<&CompletionOutcome>) -> Option<CompletionPath> {
    match outcome {
        Some(CompletionOutcome::Completed { path, .. }) => Some(*path),
        _ => None,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn one_bulk_call_per_model() {
    let service = Arc::new(ScriptedCompletionService::new());
    let (orch, _) = orchestrator(service.clone());

    let mut all = tasks("big", 5);
    all.extend(tasks("small", 3));
    let report = orch.run(all).await;

    assert_eq!(service.batch_calls(), 2);
    assert_eq!(service.batch_calls_for("big"), 1);
    assert_eq!(service.batch_calls_for("small"), 1);
    assert_eq!(service.single_calls(), 0);
    assert_eq!(report.completed_count(), 8);
    assert_eq!(report.groups.len(), 2);
    assert!(report
        .outcomes
        .values()
        .all(|o| matches!(o, CompletionOutcome::Completed { path: CompletionPath::Batch, .. })));
}

#[tokio::test]
async fn whole_batch_failure_is_retried_then_succeeds() {
    let service = Arc::new(ScriptedCompletionService::new().fail_batches(2));
    let (orch, log) = orchestrator(service.clone());

    let report = orch.run(tasks("m", 4)).await;

    assert_eq!(service.batch_calls(), 3);
    assert_eq!(service.single_calls(), 0);
    assert_eq!(report.completed_count(), 4);
    assert_eq!(report.groups[0].batch_attempts, 3);
    assert!(!report.groups[0].batch_exhausted);

    let retries = log
        .events()
        .into_iter()
        .filter(|e| matches!(e, OrchestratorEvent::BatchRetry { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn exhausted_batch_falls_back_to_rows() {
    let service = Arc::new(ScriptedCompletionService::new().fail_batches(10));
    let (orch, _) = orchestrator(service.clone());

    let report = orch.run(tasks("m", 3)).await;

    assert_eq!(service.batch_calls(), 3);
    assert_eq!(service.single_calls(), 3);
    assert!(report.groups[0].batch_exhausted);
    assert_eq!(report.groups[0].completed_by_fallback, 3);
    for id in ["m-0", "m-1", "m-2"] {
        assert_eq!(path_of(report.outcome(id)), Some(CompletionPath::RowFallback));
    }
}

#[tokio::test]
async fn partial_failure_falls_back_immediately_for_failed_rows_only() {
    let service = Arc::new(ScriptedCompletionService::new().fail_rows_containing("row 1 "));
    let (orch, log) = orchestrator(service.clone());

    let report = orch.run(tasks("m", 4)).await;

    assert_eq!(service.batch_calls(), 1, "no batch retry on partial failure");
    assert_eq!(service.single_calls(), 1);
    assert_eq!(path_of(report.outcome("m-1")), Some(CompletionPath::RowFallback));
    assert_eq!(path_of(report.outcome("m-0")), Some(CompletionPath::Batch));

    let fallbacks: Vec<_> = log
        .events()
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::RowFallback { task_id, .. } => Some(task_id),
            _ => None,
        })
        .collect();
    assert_eq!(fallbacks, vec!["m-1".to_string()]);
}

#[tokio::test]
async fn row_that_keeps_failing_is_recorded_not_dropped() {
    let service = Arc::new(
        ScriptedCompletionService::new()
            .fail_rows_containing("row 2 ")
            .fail_single_calls("row 2 ", usize::MAX),
    );
    let (orch, log) = orchestrator(service.clone());

    let report = orch.run(tasks("m", 4)).await;

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.failed_count(), 1);
    assert_eq!(service.single_calls(), 2, "row_attempts bounds single calls");
    match report.outcome("m-2") {
        Some(CompletionOutcome::Failed { attempts, reason }) => {
            assert_eq!(*attempts, 2);
            assert!(reason.contains("scripted failure"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(log
        .events()
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::RowFailed { task_id, .. } if task_id == "m-2")));
}

#[tokio::test]
async fn row_recovers_on_second_single_attempt() {
    let service = Arc::new(
        ScriptedCompletionService::new()
            .fail_rows_containing("row 0 ")
            .fail_single_calls("row 0 ", 1),
    );
    let (orch, _) = orchestrator(service.clone());

    let report = orch.run(tasks("m", 2)).await;

    assert_eq!(report.failed_count(), 0);
    assert_eq!(service.single_calls(), 2);
    assert_eq!(path_of(report.outcome("m-0")), Some(CompletionPath::RowFallback));
}

#[tokio::test]
async fn blank_completions_count_as_failures() {
    let service = Arc::new(
        ScriptedCompletionService::new()
            .fail_rows_containing("row 0 ")
            .empty_single_calls("row 0 "),
    );
    let (orch, _) = orchestrator(service);

    let report = orch.run(tasks("m", 1)).await;
    assert!(matches!(
        report.outcome("m-0"),
        Some(CompletionOutcome::Failed { reason, .. }) if reason == "empty completion"
    ));
}

#[tokio::test]
async fn one_model_failing_does_not_affect_another() {
    let service = Arc::new(ScriptedCompletionService::new().fail_model_batches("flaky", 1));
    let (orch, _) = orchestrator(service.clone());

    let mut all = tasks("flaky", 2);
    all.extend(tasks("steady", 2));
    let report = orch.run(all).await;

    assert_eq!(report.completed_count(), 4);
    assert_eq!(service.batch_calls_for("flaky"), 2);
    assert_eq!(service.batch_calls_for("steady"), 1);
}

#[tokio::test]
async fn slow_bulk_calls_time_out_and_fall_back() {
    let service = Arc::new(ScriptedCompletionService::new().with_batch_delay(Duration::from_millis(200)));
    let policy = CompletionPolicy {
        max_batch_attempts: 2,
        request_timeout: Duration::from_millis(20),
        ..fast_policy()
    };
    let orch = CompletionOrchestrator::new(service.clone(), policy);

    let report = orch.run(tasks("m", 2)).await;

    assert!(report.groups[0].batch_exhausted);
    assert_eq!(report.completed_count(), 2, "single calls are not delayed");
    assert_eq!(service.name(), "scripted");
}

/// Healthy but slow: every single call takes `delay`, bulk calls use the
/// default fan-out.
struct SlowService {
    delay: Duration,
    concurrency: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionService for SlowService {
    fn name(&self) -> &str {
        "slow"
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }

    async fn complete(&self, _model: &str, prompt: &str) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(OfflineCompletionService::render(prompt))
    }
}

#[tokio::test]
async fn slow_healthy_batch_completes_in_one_bulk_call() {
    let service = Arc::new(SlowService {
        delay: Duration::from_millis(60),
        concurrency: 2,
        calls: AtomicUsize::new(0),
    });
    let policy = CompletionPolicy {
        request_timeout: Duration::from_millis(150),
        ..fast_policy()
    };
    let orch = CompletionOrchestrator::new(service.clone(), policy);

    let report = orch.run(tasks("m", 8)).await;

    let group = &report.groups[0];
    assert_eq!(group.batch_attempts, 1);
    assert!(!group.batch_exhausted);
    assert_eq!(group.completed_in_batch, 8);
    assert_eq!(group.completed_by_fallback, 0);
    assert_eq!(service.calls.load(Ordering::SeqCst), 8);
    assert!(report.outcomes.values().all(|o| matches!(
        o,
        CompletionOutcome::Completed {
            path: CompletionPath::Batch,
            ..
        }
    )));
}
