use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::{CompletionError, CompletionService, OfflineCompletionService, RowResult};

#[derive(Debug, Default)]
struct Script {
    /// Remaining whole-batch failures.
    batch_failures: usize,
    /// Remaining batch failures per model.
    model_batch_failures: BTreeMap<String, usize>,
    /// Prompts containing a marker come back as failed rows inside a batch.
    row_markers: Vec<String>,
    /// Remaining single-call failures per marker.
    single_failures: Vec<(String, usize)>,
    /// Markers whose single calls return an empty completion.
    empty_markers: Vec<String>,
    batch_delay: Option<Duration>,
}

/// Completion service with scriptable failures and call counters.
///
/// Successful completions are the offline renderer's output, so scripted runs
/// produce realistic documents.
#[derive(Debug, Default)]
pub struct ScriptedCompletionService {
    script: Mutex<Script>,
    batch_calls: AtomicUsize,
    single_calls: AtomicUsize,
    batch_calls_by_model: Mutex<BTreeMap<String, usize>>,
}

impl ScriptedCompletionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` bulk calls fail as a whole with `Unavailable`.
    pub fn fail_batches(self, n: usize) -> Self {
        self.script.lock().batch_failures = n;
        self
    }

    /// The next `n` bulk calls for `model` fail as a whole.
    pub fn fail_model_batches(self, model: &str, n: usize) -> Self {
        self.script
            .lock()
            .model_batch_failures
            .insert(model.to_string(), n);
        self
    }

    /// Rows whose prompt contains `marker` fail inside bulk calls.
    pub fn fail_rows_containing(self, marker: &str) -> Self {
        self.script.lock().row_markers.push(marker.to_string());
        self
    }

    /// The next `times` single calls whose prompt contains `marker` fail.
    /// `usize::MAX` fails them forever.
    pub fn fail_single_calls(self, marker: &str, times: usize) -> Self {
        self.script
            .lock()
            .single_failures
            .push((marker.to_string(), times));
        self
    }

    /// Single calls whose prompt contains `marker` return blank text.
    pub fn empty_single_calls(self, marker: &str) -> Self {
        self.script.lock().empty_markers.push(marker.to_string());
        self
    }

    /// Sleep this long inside every bulk call.
    pub fn with_batch_delay(self, delay: Duration) -> Self {
        self.script.lock().batch_delay = Some(delay);
        self
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls_for(&self, model: &str) -> usize {
        self.batch_calls_by_model
            .lock()
            .get(model)
            .copied()
            .unwrap_or(0)
    }

    fn take_batch_failure(&self, model: &str) -> bool {
        let mut script = self.script.lock();
        if let Some(left) = script.model_batch_failures.get_mut(model) {
            if *left > 0 {
                *left -= 1;
                return true;
            }
        }
        if script.batch_failures > 0 {
            script.batch_failures -= 1;
            return true;
        }
        false
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletionService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _model: &str, prompt: &str) -> Result<String, CompletionError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.script.lock();
            for (marker, left) in script.single_failures.iter_mut() {
                if *left > 0 && prompt.contains(marker.as_str()) {
                    if *left != usize::MAX {
                        *left -= 1;
                    }
                    return Err(CompletionError::Api(format!(
                        "scripted failure for `{marker}`"
                    )));
                }
            }
            if script.empty_markers.iter().any(|m| prompt.contains(m.as_str())) {
                return Ok("   ".to_string());
            }
        }
        Ok(OfflineCompletionService::render(prompt))
    }

    async fn complete_batch(
        &self,
        model: &str,
        prompts: &[String],
    ) -> Result<Vec<RowResult>, CompletionError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .batch_calls_by_model
            .lock()
            .entry(model.to_string())
            .or_insert(0) += 1;

        let delay = self.script.lock().batch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_batch_failure(model) {
            return Err(CompletionError::Unavailable(format!(
                "scripted batch failure for `{model}`"
            )));
        }

        let markers = self.script.lock().row_markers.clone();
        Ok(prompts
            .iter()
            .map(|p| {
                if markers.iter().any(|m| p.contains(m.as_str())) {
                    Err(CompletionError::Api("row returned null".to_string()))
                } else {
                    Ok(OfflineCompletionService::render(p))
                }
            })
            .collect())
    }
}
