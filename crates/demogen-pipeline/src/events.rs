//! Run events for observers (progress bars, logs, tests).

use demogen_llm::OrchestratorEvent;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::summary::{RunStatus, Stage};
use crate::validate::ValidationResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    StageEntered {
        stage: Stage,
    },
    TableWritten {
        table: String,
        rows: usize,
    },
    BatchRetry {
        model: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    RowFallback {
        model: String,
        prompt_instance_id: String,
        reason: String,
    },
    DocumentFailed {
        prompt_instance_id: String,
        reason: String,
    },
    IndexProvisioned {
        index: String,
        documents: usize,
    },
    ViewProvisioned {
        view: String,
    },
    ObjectPruned {
        name: String,
    },
    CanaryChecked {
        result: ValidationResult,
    },
    Finished {
        status: RunStatus,
    },
}

pub type PipelineEventHandler = Box<dyn Fn(PipelineEvent) + Send + Sync>;

/// Shared handler list; cloned into the orchestrator's callbacks.
#[derive(Clone, Default)]
pub(crate) struct EventBus {
    handlers: Arc<RwLock<Vec<PipelineEventHandler>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self, handler: PipelineEventHandler) {
        self.handlers.write().push(handler);
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        for handler in self.handlers.read().iter() {
            handler(event.clone());
        }
    }

    /// Forward the orchestrator's retry and fallback events.
    pub(crate) fn forward_orchestrator(&self, event: OrchestratorEvent) {
        let mapped = match event {
            OrchestratorEvent::BatchRetry {
                model,
                attempt,
                delay,
                error,
            } => PipelineEvent::BatchRetry {
                model,
                attempt,
                delay_ms: delay.as_millis() as u64,
                error,
            },
            OrchestratorEvent::RowFallback {
                model,
                task_id,
                reason,
            } => PipelineEvent::RowFallback {
                model,
                prompt_instance_id: task_id,
                reason,
            },
            OrchestratorEvent::BatchStarted { .. } | OrchestratorEvent::RowFailed { .. } => return,
        };
        self.emit(mapped);
    }
}
