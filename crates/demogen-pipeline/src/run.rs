//! The run state machine.

use demogen_core::{
    DeterministicRng, EntityGenerator, EntityUniverse, PipelineConfig, PromptInstance,
    TemplateRenderer, ENTITY_STREAM,
};
use demogen_index::{AnalyticService, LocalAnalyticService, LocalSearchService, SearchService};
use demogen_llm::{
    CompletionOrchestrator, CompletionOutcome, CompletionPolicy, CompletionReport,
    CompletionService, CompletionTask,
};
use demogen_storage::Warehouse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::events::{EventBus, PipelineEvent, PipelineEventHandler};
use crate::materialize::DocumentMaterializer;
use crate::provision::Provisioner;
use crate::summary::{RunRecorder, RunStatus, RunSummary, SourceSummary, Stage};
use crate::tables::{write_prompt_table, write_structured_tables};
use crate::validate::{guaranteed_names_from, ReadinessValidator, ValidationResult};
use crate::PipelineError;

/// Checked before each stage starts; batches already in flight finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Validate the configuration and generate the entity universe.
pub fn generate_universe(config: &PipelineConfig) -> Result<EntityUniverse, PipelineError> {
    let generator = EntityGenerator::new(config)?;
    let root = DeterministicRng::new(config.seed);
    Ok(generator.generate(&mut root.fork(ENTITY_STREAM)))
}

/// Render every source's prompts for `universe`.
pub fn render_prompts(
    config: &PipelineConfig,
    universe: &EntityUniverse,
) -> Result<Vec<PromptInstance>, PipelineError> {
    let root = DeterministicRng::new(config.seed);
    Ok(TemplateRenderer::new(config).render_all(universe, &root)?)
}

pub fn completion_policy(config: &PipelineConfig) -> CompletionPolicy {
    let c = &config.completion;
    CompletionPolicy {
        max_batch_attempts: c.max_batch_attempts,
        backoff_base: c.backoff_base(),
        backoff_max: c.backoff_max(),
        row_attempts: c.row_attempts,
        request_timeout: c.request_timeout(),
        batch_timeout: c.batch_timeout(),
        fallback_concurrency: c.fallback_concurrency,
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    warehouse: Arc<Warehouse>,
    completion: Arc<dyn CompletionService>,
    search: Arc<dyn SearchService>,
    analytic: Arc<dyn AnalyticService>,
    cancel: CancellationFlag,
    events: EventBus,
}

impl Pipeline {
    /// Open the configured warehouse and use the local index/view services.
    pub fn new(
        config: PipelineConfig,
        completion: Arc<dyn CompletionService>,
    ) -> Result<Self, PipelineError> {
        let warehouse = Arc::new(Warehouse::open(&config.warehouse_dir)?);
        Ok(Self::with_warehouse(config, completion, warehouse))
    }

    pub fn with_warehouse(
        config: PipelineConfig,
        completion: Arc<dyn CompletionService>,
        warehouse: Arc<Warehouse>,
    ) -> Self {
        Self {
            search: Arc::new(LocalSearchService::new(Arc::clone(&warehouse))),
            analytic: Arc::new(LocalAnalyticService::new(Arc::clone(&warehouse))),
            config,
            warehouse,
            completion,
            cancel: CancellationFlag::new(),
            events: EventBus::default(),
        }
    }

    pub fn with_search_service(mut self, search: Arc<dyn SearchService>) -> Self {
        self.search = search;
        self
    }

    pub fn with_analytic_service(mut self, analytic: Arc<dyn AnalyticService>) -> Self {
        self.analytic = analytic;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &Arc<Warehouse> {
        &self.warehouse
    }

    pub fn search_service(&self) -> &Arc<dyn SearchService> {
        &self.search
    }

    pub fn analytic_service(&self) -> &Arc<dyn AnalyticService> {
        &self.analytic
    }

    /// Add an event handler
    pub fn on_event(&mut self, handler: PipelineEventHandler) {
        self.events.subscribe(handler);
    }

    pub fn cancellation_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Execute one full run. Never returns an error: a failing stage ends
    /// the run with `RunStatus::Failed` and the summary says where and why.
    pub async fn run(&self) -> RunSummary {
        let run_id = format!("run_{}", Uuid::new_v4().simple());
        let mut recorder = RunRecorder::new(run_id.clone(), self.config.seed);
        tracing::info!(
            run_id = %run_id,
            seed = self.config.seed,
            warehouse = %self.warehouse.root().display(),
            "run started"
        );

        let lock = match self.warehouse.lock(&run_id) {
            Ok(lock) => lock,
            Err(e) => {
                let error = PipelineError::Storage(e);
                tracing::error!(run_id = %run_id, error = %error, "could not acquire run lock");
                let summary = recorder.finish(failed_status(Stage::GeneratingEntities, &error));
                self.events.emit(PipelineEvent::Finished {
                    status: summary.status.clone(),
                });
                return summary;
            }
        };

        let status = match self.execute(&mut recorder).await {
            Ok(()) => RunStatus::Ready,
            Err(error) => {
                let stage = recorder.current_stage();
                tracing::error!(run_id = %run_id, stage = %stage, error = %error, "run failed");
                failed_status(stage, &error)
            }
        };
        let summary = recorder.finish(status);

        if let Err(e) = self.warehouse.write_run_summary(&summary.run_id, &summary) {
            tracing::warn!(run_id = %run_id, error = %e, "failed to persist run summary");
        }
        drop(lock);

        tracing::info!(
            run_id = %run_id,
            status = %summary.status,
            prompts = summary.prompts(),
            generated = summary.generated(),
            failed = summary.failed_documents(),
            "run finished"
        );
        self.events.emit(PipelineEvent::Finished {
            status: summary.status.clone(),
        });
        summary
    }

    /// Re-run the canaries against what is already in the warehouse.
    pub async fn validate_existing(&self) -> Result<Vec<ValidationResult>, PipelineError> {
        let guaranteed = guaranteed_names_from(&self.warehouse)?;
        let validator =
            ReadinessValidator::new(&self.config, self.search.as_ref(), self.analytic.as_ref());
        Ok(validator.run(&guaranteed).await)
    }

    fn enter(&self, recorder: &mut RunRecorder, stage: Stage) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            tracing::warn!(stage = %stage, "cancellation requested");
            return Err(PipelineError::Cancelled(stage.to_string()));
        }
        recorder.enter(stage);
        tracing::info!(stage = %stage, "stage started");
        self.events.emit(PipelineEvent::StageEntered { stage });
        Ok(())
    }

    async fn execute(&self, recorder: &mut RunRecorder) -> Result<(), PipelineError> {
        // ---- entities -------------------------------------------------------
        self.enter(recorder, Stage::GeneratingEntities)?;
        let universe = generate_universe(&self.config)?;
        let written = write_structured_tables(&self.warehouse, &universe)?;
        recorder.summary_mut().entities = universe.len();
        recorder.summary_mut().financial_rows = written.last().map(|(_, rows)| *rows).unwrap_or(0);
        for (table, rows) in written {
            self.events.emit(PipelineEvent::TableWritten { table, rows });
        }

        // ---- prompts --------------------------------------------------------
        self.enter(recorder, Stage::RenderingPrompts)?;
        let prompts = render_prompts(&self.config, &universe)?;
        let rows = write_prompt_table(&self.warehouse, &prompts)?;
        self.events.emit(PipelineEvent::TableWritten {
            table: demogen_core::records::PROMPTS_TABLE.to_string(),
            rows,
        });

        // ---- completion -----------------------------------------------------
        self.enter(recorder, Stage::Completing)?;
        let report = self.complete(&prompts).await;
        recorder.summary_mut().completion_groups = report.groups.clone();
        recorder.summary_mut().sources = self.tally(&prompts, &report);

        let failed = report.failed_count();
        let max_ratio = self.config.completion.max_failure_ratio;
        if failed > 0 && report.failure_ratio() > max_ratio {
            // The document tables must match the prompt table just written,
            // and indices built over the previous corpus must not survive it.
            recorder.summary_mut().sources = self.write_documents(&prompts, &report)?;
            recorder.summary_mut().pruned = self.drop_source_indices()?;
            return Err(PipelineError::Completion {
                failed,
                total: prompts.len(),
                max_ratio,
            });
        }

        // ---- documents ------------------------------------------------------
        self.enter(recorder, Stage::Materializing)?;
        recorder.summary_mut().sources = self.write_documents(&prompts, &report)?;

        // ---- indices and views ----------------------------------------------
        self.enter(recorder, Stage::Provisioning)?;
        let provisioner =
            Provisioner::new(&self.config, self.search.as_ref(), self.analytic.as_ref());
        let provisioned = provisioner.provision_all(&self.warehouse).await?;
        let summary = recorder.summary_mut();
        for handle in &provisioned.indices {
            if let Some(source) = summary.sources.values_mut().find(|s| s.index == handle.name) {
                source.indexed = handle.documents;
            }
            self.events.emit(PipelineEvent::IndexProvisioned {
                index: handle.name.clone(),
                documents: handle.documents,
            });
        }
        for view in &provisioned.views {
            summary.views.push(view.name.clone());
            self.events.emit(PipelineEvent::ViewProvisioned {
                view: view.name.clone(),
            });
        }
        for name in &provisioned.pruned {
            self.events.emit(PipelineEvent::ObjectPruned { name: name.clone() });
        }
        summary.pruned = provisioned.pruned;

        // ---- readiness ------------------------------------------------------
        self.enter(recorder, Stage::Validating)?;
        let validator =
            ReadinessValidator::new(&self.config, self.search.as_ref(), self.analytic.as_ref());
        let results = validator.run(&universe.guaranteed_names()).await;
        for result in &results {
            self.events.emit(PipelineEvent::CanaryChecked {
                result: result.clone(),
            });
        }
        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.to_string())
            .collect();
        recorder.summary_mut().validation = results;
        if !failed.is_empty() {
            return Err(PipelineError::Validation { failed });
        }
        Ok(())
    }

    async fn complete(&self, prompts: &[PromptInstance]) -> CompletionReport {
        let mut orchestrator =
            CompletionOrchestrator::new(Arc::clone(&self.completion), completion_policy(&self.config));
        let events = self.events.clone();
        orchestrator.on_event(Box::new(move |event| events.forward_orchestrator(event)));

        let tasks = prompts
            .iter()
            .map(|p| CompletionTask {
                id: p.id.clone(),
                model: p.model.clone(),
                prompt: p.text.clone(),
            })
            .collect();
        tracing::info!(
            prompts = prompts.len(),
            service = self.completion.name(),
            "completing prompts"
        );
        orchestrator.run(tasks).await
    }

    /// Materialize every prompt, placeholders included, into the source tables.
    fn write_documents(
        &self,
        prompts: &[PromptInstance],
        report: &CompletionReport,
    ) -> Result<BTreeMap<String, SourceSummary>, PipelineError> {
        let materializer = DocumentMaterializer::new(&self.config);
        let documents = materializer.materialize(prompts, report)?;
        for doc in documents.iter().filter(|d| !d.is_generated()) {
            self.events.emit(PipelineEvent::DocumentFailed {
                prompt_instance_id: doc.prompt_instance_id.clone(),
                reason: doc.failure_reason.clone().unwrap_or_default(),
            });
        }
        let sources = materializer.write(&self.warehouse, &documents)?;
        for summary in sources.values() {
            self.events.emit(PipelineEvent::TableWritten {
                table: summary.table.clone(),
                rows: summary.prompts,
            });
        }
        Ok(sources)
    }

    /// Drop every configured source index. Returns the names that existed.
    fn drop_source_indices(&self) -> Result<Vec<String>, PipelineError> {
        let mut dropped = Vec::new();
        for source in &self.config.sources {
            let name = source.index_name();
            if self.warehouse.drop_object(&name)? {
                tracing::warn!(index = %name, "dropped index built over a superseded corpus");
                self.events.emit(PipelineEvent::ObjectPruned { name: name.clone() });
                dropped.push(name);
            }
        }
        Ok(dropped)
    }

    /// Per-source counts straight from the completion outcomes.
    fn tally(&self, prompts: &[PromptInstance], report: &CompletionReport) -> BTreeMap<String, SourceSummary> {
        let mut out: BTreeMap<String, SourceSummary> = BTreeMap::new();
        for source in &self.config.sources {
            out.insert(
                source.name.clone(),
                SourceSummary {
                    table: source.table_name(),
                    index: source.index_name(),
                    model: source.model(&self.config.default_model).to_string(),
                    ..Default::default()
                },
            );
        }
        for prompt in prompts {
            let entry = out.entry(prompt.source_type.clone()).or_default();
            entry.prompts += 1;
            match report.outcome(&prompt.id) {
                Some(CompletionOutcome::Completed { .. }) => entry.generated += 1,
                _ => entry.failed += 1,
            }
        }
        out
    }
}

fn failed_status(stage: Stage, error: &PipelineError) -> RunStatus {
    RunStatus::Failed {
        stage,
        kind: error.kind().to_string(),
        cause: error.to_string(),
    }
}
