use super::finetune::{FineTuneStage, FineTuner, TrainError};
use crate::config::TrainingConfig;
use crate::store::models::{TrainingJob, TrainingSample};
use crate::store::{StoreError, TrainingStore};
use log::{error, info, warn};
use shared::JobStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("training error: {0}")]
    Train(#[from] TrainError),
}

/// Builds a fresh fine-tuner for one job's sample set. The factory runs on
/// the worker thread, so a failing build fails the job rather than the
/// trigger call.
pub type TunerFactory =
    Arc<dyn Fn(&TrainingJob, &[TrainingSample]) -> Result<Box<dyn FineTuner>, TrainError> + Send + Sync>;

struct Worker {
    handle: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
}

/// Drives retraining jobs through the stage state machine on dedicated
/// worker threads, reporting progress through the store for polling callers.
pub struct TrainingScheduler {
    store: Arc<dyn TrainingStore>,
    factory: TunerFactory,
    config: TrainingConfig,
    workers: Mutex<HashMap<Uuid, Worker>>,
}

impl TrainingScheduler {
    pub fn new(store: Arc<dyn TrainingStore>, factory: TunerFactory, config: TrainingConfig) -> Self {
        Self {
            store,
            factory,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent check-and-trigger: starts a job when the category's
    /// verified-sample count has reached its target and no other job is
    /// active for it, and no-ops otherwise. Safe to call on every sample
    /// insertion.
    pub fn maybe_start_training(&self, category_id: usize) -> Result<Option<Uuid>, SchedulerError> {
        let Some(job) = self.store.try_create_job(category_id)? else {
            return Ok(None);
        };
        let job_id = job.id;
        // Train on exactly the snapshot the job recorded at creation, not on
        // whatever has been queued since.
        let snapshot: std::collections::HashSet<Uuid> = job.sample_ids.iter().copied().collect();
        let samples: Vec<TrainingSample> = self
            .store
            .unconsumed_samples(category_id)?
            .into_iter()
            .filter(|sample| snapshot.contains(&sample.id))
            .collect();

        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = cancel.clone();
        let store = self.store.clone();
        let factory = self.factory.clone();
        let config = self.config.clone();
        let handle = std::thread::spawn(move || {
            run_job(store, factory, job, samples, config, worker_cancel);
        });

        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_id, Worker { handle, cancel });
        Ok(Some(job_id))
    }

    /// Snapshot of a job for progress polling.
    pub fn job_status(&self, job_id: Uuid) -> Result<TrainingJob, SchedulerError> {
        Ok(self.store.get_job(job_id)?)
    }

    /// Request cancellation; honored at the next epoch boundary. Returns
    /// false when the job has no live worker (already terminal).
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match workers.get(&job_id) {
            Some(worker) => {
                worker.cancel.store(true, Ordering::SeqCst);
                info!("Cancellation requested for job {job_id}");
                true
            }
            None => false,
        }
    }

    /// Block until the job's worker finishes and return the final record.
    /// Used for orderly shutdown and by tests; polling callers use
    /// `job_status` instead.
    pub fn wait(&self, job_id: Uuid) -> Result<TrainingJob, SchedulerError> {
        let worker = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&job_id);
        if let Some(worker) = worker {
            if worker.handle.join().is_err() {
                error!("Worker thread for job {job_id} panicked");
                // The job row may still be non-terminal; fail it loudly so it
                // does not look alive forever.
                if let Ok(job) = self.store.get_job(job_id) {
                    if !job.status.is_terminal() {
                        let _ = self.store.fail_job(job_id, "training worker panicked");
                    }
                }
            }
        }
        Ok(self.store.get_job(job_id)?)
    }
}

/// A failed run carries the reason recorded on the job row.
struct RunFailure {
    reason: String,
}

impl RunFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

fn run_job(
    store: Arc<dyn TrainingStore>,
    factory: TunerFactory,
    job: TrainingJob,
    samples: Vec<TrainingSample>,
    config: TrainingConfig,
    cancel: Arc<AtomicBool>,
) {
    let job_id = job.id;
    if let Err(failure) = drive(&store, &factory, &job, &samples, &config, &cancel) {
        if let Err(err) = store.fail_job(job_id, &failure.reason) {
            error!("Failed to record failure for job {job_id}: {err}");
        }
    }
}

/// Run the staged epoch loop. Completion (including the atomic version swap)
/// happens in here too, so the exported weights path never outlives the
/// tuner that produced it.
fn drive(
    store: &Arc<dyn TrainingStore>,
    factory: &TunerFactory,
    job: &TrainingJob,
    samples: &[TrainingSample],
    config: &TrainingConfig,
    cancel: &AtomicBool,
) -> Result<(), RunFailure> {
    let job_id = job.id;
    let started = Instant::now();
    let ceiling = Duration::from_secs_f64((config.max_wall_clock_hours as f64) * 3600.0);

    let mut tuner = factory(job, samples)
        .map_err(|err| RunFailure::new(format!("tuner init failed: {err}")))?;
    tuner
        .prepare(samples)
        .map_err(|err| RunFailure::new(format!("dataset preparation failed: {err}")))?;

    let mut best_accuracy = 0f32;
    let mut epochs_without_improvement = 0u32;
    let mut early_stopped = false;

    'stages: for stage in FineTuneStage::ALL {
        let status = match stage {
            FineTuneStage::FeatureExtraction => JobStatus::Stage1FeatureExtraction,
            FineTuneStage::PartialFinetune => JobStatus::Stage2PartialFinetune,
            FineTuneStage::FullFinetune => JobStatus::Stage3FullFinetune,
        };
        store
            .transition_job(job_id, status)
            .map_err(|err| RunFailure::new(format!("state transition failed: {err}")))?;
        tuner
            .begin_stage(stage)
            .map_err(|err| RunFailure::new(format!("stage {} setup failed: {err}", stage.index())))?;

        let budget = config.stage_epochs[(stage.index() - 1) as usize];
        for epoch in 1..=budget {
            // Cancellation and the wall-clock ceiling are checked at epoch
            // boundaries only; an epoch in flight always finishes.
            if cancel.load(Ordering::SeqCst) {
                return Err(RunFailure::new("cancelled"));
            }
            if started.elapsed() >= ceiling {
                return Err(RunFailure::new(format!(
                    "wall-clock limit exceeded after {:.1}h",
                    started.elapsed().as_secs_f64() / 3600.0
                )));
            }

            let metrics = tuner.run_epoch().map_err(|err| {
                RunFailure::new(format!("stage {} epoch {epoch}: {err}", stage.index()))
            })?;
            if !metrics.train_loss.is_finite() || !metrics.val_loss.is_finite() {
                // Keep the progress row pointing at the epoch that diverged.
                if let Err(err) =
                    store.update_job_progress(job_id, epoch, metrics.train_loss, best_accuracy)
                {
                    warn!("Progress write failed for job {job_id}: {err}");
                }
                return Err(RunFailure::new("divergent loss"));
            }

            if metrics.val_accuracy > best_accuracy {
                best_accuracy = metrics.val_accuracy;
                epochs_without_improvement = 0;
            } else {
                epochs_without_improvement += 1;
            }

            // Fire-and-forget progress write: a failing write must never
            // stall the training loop.
            if let Err(err) =
                store.update_job_progress(job_id, epoch, metrics.train_loss, best_accuracy)
            {
                warn!("Progress write failed for job {job_id}: {err}");
            }

            if epochs_without_improvement >= config.patience {
                info!(
                    "Job {job_id}: validation accuracy plateaued for {} epochs, stopping early \
                     in stage {}",
                    epochs_without_improvement,
                    stage.index()
                );
                early_stopped = true;
                break 'stages;
            }
        }
    }
    if early_stopped {
        info!("Job {job_id} short-cut to completion by early stopping");
    }

    let weights_path = tuner
        .export()
        .map_err(|err| RunFailure::new(format!("weight export failed: {err}")))?;
    let version = store
        .complete_job(job_id, best_accuracy, &weights_path)
        .map_err(|err| {
            error!("Completion transaction failed for job {job_id}: {err}");
            RunFailure::new(format!("completion transaction failed: {err}"))
        })?;
    info!(
        "Job {job_id} completed: model v{} active (accuracy {:.3})",
        version.version_number, best_accuracy
    );
    Ok(())
}
