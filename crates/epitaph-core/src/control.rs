//! Start, stop and observe batch runs from outside the controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{BatchConfig, BatchController, BatchSummary, ProgressHandle, TracingBatchReporter};
use crate::error::AppError;
use crate::orchestrator::EnrichmentOrchestrator;
use crate::run::{RunProgress, RunStatus};
use crate::traits::{EnrichmentStore, FallbackFetcher, RunLedger};

/// Finished runs kept in memory; older ones are served from the run ledger.
const DEFAULT_RETAINED_RUNS: usize = 16;

struct RunHandle {
    run_type: String,
    started: Instant,
    cancel: CancellationToken,
    progress: ProgressHandle,
    task: Option<JoinHandle<Result<BatchSummary, AppError>>>,
}

impl RunHandle {
    fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// In-process registry of batch runs.
pub struct BatchManager<D, FF> {
    store: D,
    orchestrator: Arc<EnrichmentOrchestrator<FF>>,
    runs: Arc<Mutex<HashMap<Uuid, RunHandle>>>,
    retained_runs: usize,
}

impl<D: Clone, FF> Clone for BatchManager<D, FF> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            orchestrator: Arc::clone(&self.orchestrator),
            runs: Arc::clone(&self.runs),
            retained_runs: self.retained_runs,
        }
    }
}

impl<D, FF> BatchManager<D, FF>
where
    D: EnrichmentStore,
    FF: FallbackFetcher + 'static,
{
    pub fn new(store: D, orchestrator: Arc<EnrichmentOrchestrator<FF>>) -> Self {
        Self {
            store,
            orchestrator,
            runs: Arc::new(Mutex::new(HashMap::new())),
            retained_runs: DEFAULT_RETAINED_RUNS,
        }
    }

    pub fn with_retained_runs(mut self, retained: usize) -> Self {
        self.retained_runs = retained;
        self
    }

    /// Spawn a run. Fails with `Conflict` if a run of the same type is active.
    pub async fn start(&self, config: BatchConfig) -> Result<Uuid, AppError> {
        let mut runs = self.runs.lock().await;
        if let Some((id, _)) = runs
            .iter()
            .find(|(_, h)| h.run_type == config.run_type && h.is_active())
        {
            return Err(AppError::Conflict(format!(
                "run {id} of type '{}' is still active",
                config.run_type
            )));
        }

        prune_finished(&mut runs, self.retained_runs);

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let progress: ProgressHandle =
            Arc::new(RwLock::new(RunProgress::new(run_id, &config.run_type)));
        let run_type = config.run_type.clone();

        let controller = BatchController::new(self.store.clone(), Arc::clone(&self.orchestrator), config);
        let task_cancel = cancel.clone();
        let task_progress = Arc::clone(&progress);
        let task = tokio::spawn(async move {
            let result = controller
                .run(run_id, task_cancel, &TracingBatchReporter, Some(Arc::clone(&task_progress)))
                .await;
            if let Err(e) = &result {
                tracing::error!(%run_id, error = %e, "Batch run failed to start");
                let mut p = task_progress.write().await;
                p.status = RunStatus::Failed;
                p.exit_reason = Some(e.to_string());
            }
            result
        });

        tracing::info!(%run_id, %run_type, "Batch run spawned");
        runs.insert(
            run_id,
            RunHandle {
                run_type,
                started: Instant::now(),
                cancel,
                progress,
                task: Some(task),
            },
        );
        Ok(run_id)
    }

    /// Request a stop. The controller finishes the current subject, flushes
    /// its checkpoint, and exits. Returns false for unknown or finished runs.
    pub async fn stop(&self, run_id: Uuid) -> bool {
        let runs = self.runs.lock().await;
        let Some(handle) = runs.get(&run_id) else {
            return false;
        };
        // The task may still be unwinding after publishing a terminal status.
        if !handle.is_active() || handle.progress.read().await.status.is_terminal() {
            return false;
        }
        tracing::info!(%run_id, "Stop requested");
        handle.cancel.cancel();
        true
    }

    /// Live progress for runs started here, persisted state otherwise.
    pub async fn progress(&self, run_id: Uuid) -> Result<Option<RunProgress>, AppError> {
        let handle_progress = {
            let runs = self.runs.lock().await;
            runs.get(&run_id).map(|h| Arc::clone(&h.progress))
        };
        if let Some(progress) = handle_progress {
            return Ok(Some(progress.read().await.clone()));
        }
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .map(|run| RunProgress::from(&run)))
    }

    /// Recent runs, live ones first.
    pub async fn list(&self, limit: usize) -> Result<Vec<RunProgress>, AppError> {
        let live: Vec<ProgressHandle> = {
            let runs = self.runs.lock().await;
            runs.values().map(|h| Arc::clone(&h.progress)).collect()
        };
        let mut out = Vec::with_capacity(live.len());
        for p in live {
            out.push(p.read().await.clone());
        }
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        for run in self.store.list_runs(limit).await? {
            if !out.iter().any(|p| p.run_id == run.id) {
                out.push(RunProgress::from(&run));
            }
        }
        out.truncate(limit);
        Ok(out)
    }

    /// Wait for a run started here to finish.
    pub async fn wait(&self, run_id: Uuid) -> Option<Result<BatchSummary, AppError>> {
        let task = {
            let mut runs = self.runs.lock().await;
            runs.get_mut(&run_id)?.task.take()?
        };
        Some(match task.await {
            Ok(result) => result,
            Err(e) => Err(AppError::Generic(format!("batch task panicked: {e}"))),
        })
    }
}

/// Drop the oldest finished handles beyond `retained`.
fn prune_finished(runs: &mut HashMap<Uuid, RunHandle>, retained: usize) {
    let mut finished: Vec<(Uuid, Instant)> = runs
        .iter()
        .filter(|(_, h)| !h.is_active())
        .map(|(id, h)| (*id, h.started))
        .collect();
    if finished.len() <= retained {
        return;
    }
    finished.sort_by_key(|(_, started)| *started);
    let excess = finished.len() - retained;
    for (id, _) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
}
