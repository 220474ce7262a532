//! End-to-end runs against a throwaway warehouse.
//!
//! Completions come from the offline renderer or the scripted service, so
//! every scenario is deterministic and needs no network.

use demogen_core::records::{ENTITIES_TABLE, FINANCIALS_TABLE, PROMPTS_TABLE};
use demogen_core::{CanarySpec, EntityRow, FinancialRow, PinnedEntity, PipelineConfig};
use demogen_index::ViewQuery;
use demogen_llm::{CompletionService, OfflineCompletionService, ScriptedCompletionService};
use demogen_pipeline::*;
use demogen_storage::{ObjectKind, Table, Warehouse};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

/// seed=42, must-exist "Acme Freight", 12 entities, canaries suffixed with "pricing".
fn demo_config(dir: &TempDir) -> PipelineConfig {
    let mut config = PipelineConfig {
        seed: 42,
        entity_count: 12,
        must_exist: vec![PinnedEntity::named("Acme Freight")],
        warehouse_dir: dir.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    config.validation.canary_suffix = Some("pricing".to_string());
    config.completion.backoff_base_ms = 1;
    config.completion.backoff_max_ms = 5;
    config
}

fn offline() -> Arc<dyn CompletionService> {
    Arc::new(OfflineCompletionService::new())
}

fn pipeline(config: PipelineConfig, service: Arc<dyn CompletionService>) -> Pipeline {
    Pipeline::new(config, service).unwrap()
}

fn record_events(pipeline: &mut Pipeline) -> Arc<Mutex<Vec<PipelineEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    pipeline.on_event(Box::new(move |e| sink.lock().push(e)));
    log
}

fn names(warehouse: &Warehouse, kind: ObjectKind) -> BTreeSet<String> {
    warehouse.objects(kind).into_iter().map(|e| e.name).collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn assert_failed(summary: &RunSummary, expected_stage: Stage, expected_kind: &str) {
    match &summary.status {
        RunStatus::Failed { stage, kind, .. } => {
            assert_eq!(*stage, expected_stage, "{:?}", summary.status);
            assert_eq!(kind, expected_kind, "{:?}", summary.status);
        }
        RunStatus::Ready => panic!("expected FAILED at {expected_stage}, run was READY"),
    }
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn acme_freight_demo_is_ready() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline(demo_config(&dir), offline());
    let events = record_events(&mut pipeline);

    let summary = pipeline.run().await;
    assert!(summary.is_ready(), "{:?}", summary.status);
    assert_eq!(summary.entities, 12);
    assert!(summary.failed_canaries().is_empty());

    // Structured record for the pinned entity.
    let warehouse = pipeline.warehouse();
    let entities: Vec<EntityRow> = warehouse.table(ENTITIES_TABLE).unwrap().records().unwrap();
    let acme = entities.iter().find(|e| e.name == "Acme Freight").unwrap();
    assert!(acme.pinned);
    let financials: Vec<FinancialRow> = warehouse.table(FINANCIALS_TABLE).unwrap().records().unwrap();
    assert!(financials.iter().any(|f| f.entity_id == acme.entity_id));

    // Document search answers the scripted demo question.
    let hits = pipeline
        .search_service()
        .preview("broker_research_search", "Acme Freight pricing", 10)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits
        .iter()
        .any(|h| h.attributes.get("entity_id") == Some(&acme.entity_id)));

    // Analytic view answers by company name or synonym.
    let result = pipeline
        .analytic_service()
        .query_view(
            "company_financials",
            &ViewQuery {
                dimensions: vec!["issuer".to_string()],
                metrics: vec!["revenue".to_string()],
                filters: vec![("company".to_string(), "acme freight".to_string())],
                limit: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.len(), 1);

    // Stages ran in order.
    let stages: Vec<Stage> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StageEntered { stage } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(stages, Stage::ALL.to_vec());
    assert!(matches!(
        events.lock().last(),
        Some(PipelineEvent::Finished {
            status: RunStatus::Ready
        })
    ));

    // The summary is persisted.
    let latest: RunSummary = warehouse.read_latest_run().unwrap().unwrap();
    assert_eq!(latest.run_id, summary.run_id);
}

#[tokio::test]
async fn every_prompt_is_accounted_for() {
    let dir = TempDir::new().unwrap();
    let config = demo_config(&dir);
    let pipeline = pipeline(config.clone(), offline());
    let summary = pipeline.run().await;
    assert!(summary.is_ready(), "{:?}", summary.status);

    let prompts = pipeline.warehouse().table(PROMPTS_TABLE).unwrap();
    assert_eq!(summary.prompts(), prompts.len());
    assert_eq!(summary.prompts(), summary.generated() + summary.failed_documents());

    for source in &config.sources {
        let table = pipeline.warehouse().table(&source.table_name()).unwrap();
        let counts = &summary.sources[&source.name];
        assert_eq!(table.len(), counts.prompts);
        for row in &table.rows {
            assert!(row["id"].as_str().is_some_and(|s| !s.is_empty()));
            assert!(row["title"].as_str().is_some_and(|s| !s.is_empty()));
        }
        if source.link_entity {
            assert!(table.rows.iter().all(|r| r["entity_id"].is_string()));
        } else {
            assert!(table.rows.iter().all(|r| r["entity_id"].is_null()));
        }
    }
}

// ============================================================================
// Completion failures
// ============================================================================

#[tokio::test]
async fn failed_rows_become_placeholders() {
    let dir = TempDir::new().unwrap();
    // Latest-quarter transcripts fail in the batch and in every fallback call.
    let marker = "excerpt of the 2024Q4 earnings call";
    let service = Arc::new(
        ScriptedCompletionService::new()
            .fail_rows_containing(marker)
            .fail_single_calls(marker, usize::MAX),
    );
    let mut pipeline = pipeline(demo_config(&dir), service);
    let events = record_events(&mut pipeline);

    let summary = pipeline.run().await;
    assert!(summary.is_ready(), "{:?}", summary.status);

    let transcripts = &summary.sources["earnings_call"];
    assert_eq!(transcripts.prompts, 24);
    assert_eq!(transcripts.failed, 12);
    assert_eq!(transcripts.generated, 12);
    assert_eq!(transcripts.indexed, 12);
    assert_eq!(summary.prompts(), summary.generated() + summary.failed_documents());

    let table = pipeline.warehouse().table("earnings_call_documents").unwrap();
    let placeholders: Vec<_> = table
        .rows
        .iter()
        .filter(|r| r["status"] == "FAILED")
        .collect();
    assert_eq!(placeholders.len(), 12);
    assert!(placeholders
        .iter()
        .all(|r| r["content"] == materialize::FAILED_CONTENT));

    let failed_events = events
        .lock()
        .iter()
        .filter(|e| matches!(e, PipelineEvent::DocumentFailed { .. }))
        .count();
    assert_eq!(failed_events, 12);
}

#[tokio::test]
async fn batch_retries_and_exhausted_batches_still_complete() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(ScriptedCompletionService::new().fail_model_batches("llama3.1-8b", 3));
    let mut pipeline = pipeline(demo_config(&dir), Arc::clone(&service) as Arc<dyn CompletionService>);
    let events = record_events(&mut pipeline);

    let summary = pipeline.run().await;
    assert!(summary.is_ready(), "{:?}", summary.status);
    assert_eq!(summary.failed_documents(), 0);

    let small = summary
        .completion_groups
        .iter()
        .find(|g| g.model == "llama3.1-8b")
        .unwrap();
    assert!(small.batch_exhausted);
    assert_eq!(small.batch_attempts, 3);
    assert_eq!(small.completed_by_fallback, 24);

    let large = summary
        .completion_groups
        .iter()
        .find(|g| g.model == "llama3.1-70b")
        .unwrap();
    assert!(!large.batch_exhausted);
    assert_eq!(service.batch_calls_for("llama3.1-70b"), 1);

    let log = events.lock();
    let retries = log
        .iter()
        .filter(|e| matches!(e, PipelineEvent::BatchRetry { .. }))
        .count();
    let fallbacks = log
        .iter()
        .filter(|e| matches!(e, PipelineEvent::RowFallback { .. }))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(fallbacks, 24);
}

#[tokio::test]
async fn too_many_failures_stop_the_run_at_completion() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(
        ScriptedCompletionService::new()
            .fail_rows_containing("Title: ")
            .fail_single_calls("Title: ", usize::MAX),
    );
    let pipeline = pipeline(demo_config(&dir), service);

    let summary = pipeline.run().await;
    assert_failed(&summary, Stage::Completing, "CompletionError");
    assert_eq!(summary.generated(), 0);
    assert_eq!(summary.failed_documents(), summary.prompts());

    // Every prompt is still accounted for, as a placeholder.
    let docs = pipeline.warehouse().table("broker_research_documents").unwrap();
    assert_eq!(docs.len(), 12);
    assert!(docs.rows.iter().all(|r| r["status"] == "FAILED"));
    assert!(!pipeline.warehouse().contains("broker_research_search"));
}

#[tokio::test]
async fn failed_completion_leaves_no_stale_corpus_behind() {
    let dir = TempDir::new().unwrap();
    let first = pipeline(demo_config(&dir), offline()).run().await;
    assert!(first.is_ready(), "{:?}", first.status);

    let mut config = demo_config(&dir);
    config.seed = 43;
    let service = Arc::new(
        ScriptedCompletionService::new()
            .fail_rows_containing("Title: ")
            .fail_single_calls("Title: ", usize::MAX),
    );
    let second = pipeline(config, service);
    let summary = second.run().await;
    assert_failed(&summary, Stage::Completing, "CompletionError");

    let warehouse = second.warehouse();
    let prompt_ids: BTreeSet<String> = warehouse
        .table(PROMPTS_TABLE)
        .unwrap()
        .rows
        .iter()
        .filter_map(|r| r["prompt_instance_id"].as_str().map(str::to_string))
        .collect();
    let config = second.config();
    let mut documents = 0;
    for source in &config.sources {
        let table = warehouse.table(&source.table_name()).unwrap();
        for row in &table.rows {
            assert!(prompt_ids.contains(row["prompt_instance_id"].as_str().unwrap()));
            assert_eq!(row["status"], "FAILED");
        }
        documents += table.len();
        assert!(!warehouse.contains(&source.index_name()));
    }
    assert_eq!(documents, prompt_ids.len());
    assert!(summary.pruned.contains(&"broker_research_search".to_string()));

    // The old corpus can no longer pass readiness.
    let results = second.validate_existing().await.unwrap();
    assert!(results.iter().any(|r| !r.passed));
}

// ============================================================================
// Gating and idempotency
// ============================================================================

#[tokio::test]
async fn failing_canary_blocks_ready_without_rollback() {
    let dir = TempDir::new().unwrap();
    let mut config = demo_config(&dir);
    for source in &mut config.sources {
        if source.name == "news_digest" {
            source.canary = CanarySpec::Term {
                query: "zeppelin".to_string(),
            };
        }
    }
    let pipeline = pipeline(config, offline());

    let summary = pipeline.run().await;
    assert_failed(&summary, Stage::Validating, "ValidationFailure");
    let failed = summary.failed_canaries();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].target, "news_digest_search");
    assert_eq!(failed[0].hits, 0);

    // Provisioned objects stay for inspection.
    assert!(pipeline.warehouse().contains("news_digest_search"));
    assert!(pipeline.warehouse().contains("company_financials"));
}

#[tokio::test]
async fn reruns_replace_objects_and_prune_orphans() {
    let dir = TempDir::new().unwrap();
    let first = pipeline(demo_config(&dir), offline()).run().await;
    assert!(first.is_ready(), "{:?}", first.status);

    // A leftover table from some earlier layout.
    let warehouse = Warehouse::open(dir.path()).unwrap();
    warehouse
        .create_or_replace_table(
            &Table::from_records("stale_documents", &[serde_json::json!({"id": "x"})]).unwrap(),
        )
        .unwrap();
    drop(warehouse);

    let mut config = demo_config(&dir);
    config.sources.retain(|s| s.name != "news_digest");
    let second_pipeline = pipeline(config.clone(), offline());
    let second = second_pipeline.run().await;
    assert!(second.is_ready(), "{:?}", second.status);
    assert_eq!(
        second.pruned.iter().cloned().collect::<BTreeSet<_>>(),
        set(&["news_digest_documents", "news_digest_search", "stale_documents"])
    );

    let warehouse = second_pipeline.warehouse();
    assert_eq!(
        names(warehouse, ObjectKind::Table),
        set(&[
            "broker_research_documents",
            "earnings_call_documents",
            ENTITIES_TABLE,
            PROMPTS_TABLE,
            FINANCIALS_TABLE,
        ])
    );
    assert_eq!(
        names(warehouse, ObjectKind::SearchIndex),
        set(&["broker_research_search", "earnings_call_search"])
    );
    assert_eq!(
        names(warehouse, ObjectKind::AnalyticView),
        set(&["company_financials", "entity_directory"])
    );
    let before = warehouse.table("broker_research_documents").unwrap();

    let third = pipeline(config, offline()).run().await;
    assert!(third.is_ready(), "{:?}", third.status);
    assert!(third.pruned.is_empty());
    let after = Warehouse::open(dir.path())
        .unwrap()
        .table("broker_research_documents")
        .unwrap();
    assert_eq!(before, after);
}

// ============================================================================
// Early termination
// ============================================================================

#[tokio::test]
async fn configuration_errors_fail_before_anything_is_written() {
    let dir = TempDir::new().unwrap();
    let mut config = demo_config(&dir);
    config.entity_count = 0;
    let pipeline = pipeline(config, offline());

    let summary = pipeline.run().await;
    assert_failed(&summary, Stage::GeneratingEntities, "ConfigurationError");
    assert!(names(pipeline.warehouse(), ObjectKind::Table).is_empty());
}

#[tokio::test]
async fn pinned_entities_are_never_truncated() {
    let dir = TempDir::new().unwrap();
    let mut config = demo_config(&dir);
    config.entity_count = 1;
    config.must_exist.push(PinnedEntity::named("Borealis Energy"));
    let summary = pipeline(config, offline()).run().await;

    assert_failed(&summary, Stage::GeneratingEntities, "ConfigurationError");
    match &summary.status {
        RunStatus::Failed { cause, .. } => assert!(cause.contains("must-exist"), "{cause}"),
        RunStatus::Ready => unreachable!(),
    }
}

#[tokio::test]
async fn concurrent_run_is_refused() {
    let dir = TempDir::new().unwrap();
    let holder = Warehouse::open(dir.path()).unwrap();
    let _lock = holder.lock("someone-else").unwrap();

    let summary = pipeline(demo_config(&dir), offline()).run().await;
    assert_failed(&summary, Stage::GeneratingEntities, "StorageError");
    assert!(names(&holder, ObjectKind::Table).is_empty());
}

#[tokio::test]
async fn cancellation_takes_effect_at_the_next_stage() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = pipeline(demo_config(&dir), offline());
    let flag = pipeline.cancellation_flag();
    pipeline.on_event(Box::new(move |e| {
        if matches!(e, PipelineEvent::StageEntered { stage: Stage::Completing }) {
            flag.cancel();
        }
    }));

    let summary = pipeline.run().await;
    assert_failed(&summary, Stage::Completing, "Cancelled");
    // Completion finished, nothing after it ran.
    assert!(summary.completion_groups.iter().all(|g| g.failed == 0));
    assert!(pipeline.warehouse().contains(PROMPTS_TABLE));
    assert!(!pipeline.warehouse().contains("broker_research_documents"));
}

#[tokio::test]
async fn revalidation_reads_guaranteed_names_from_the_warehouse() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(demo_config(&dir), offline());
    assert!(pipeline.run().await.is_ready());

    let results = pipeline.validate_existing().await.unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.passed));
    assert!(results
        .iter()
        .any(|r| r.canary == "Acme Freight pricing" && r.target == "broker_research_search"));
}
