pub mod memory;
pub mod models;

pub use memory::MemoryStore;
pub use models::{CustomCategory, ModelVersion, TrainingJob, TrainingSample};

use shared::JobStatus;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("category {0} not found")]
    CategoryNotFound(usize),
    #[error("category with code '{0}' already exists")]
    DuplicateCategory(String),
    #[error("training job {0} not found")]
    JobNotFound(Uuid),
    #[error("model version {0} not found")]
    VersionNotFound(Uuid),
    #[error("job {job_id} is already terminal ({status})")]
    JobAlreadyTerminal { job_id: Uuid, status: JobStatus },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The persistence layer, as consumed by the engine.
///
/// Implementations must make the documented compound operations atomic:
/// a concurrent observer sees either the state before or the state after,
/// never an intermediate one. The in-memory implementation holds everything
/// under one lock; a database-backed one maps each compound operation to a
/// transaction.
pub trait TrainingStore: Send + Sync {
    fn create_category(
        &self,
        code: &str,
        name: &str,
        severity: shared::Severity,
        target_sample_count: u32,
    ) -> Result<CustomCategory, StoreError>;

    fn get_category(&self, category_id: usize) -> Result<CustomCategory, StoreError>;

    fn list_categories(&self) -> Result<Vec<CustomCategory>, StoreError>;

    /// Insert a sample, increment the category's sample count and flip
    /// `requires_retraining` when the target is reached, all atomically.
    /// Returns the updated category.
    fn attach_sample(&self, sample: TrainingSample) -> Result<CustomCategory, StoreError>;

    fn get_sample(&self, sample_id: Uuid) -> Result<TrainingSample, StoreError>;

    /// Samples for a category that no job has consumed yet.
    fn unconsumed_samples(&self, category_id: usize) -> Result<Vec<TrainingSample>, StoreError>;

    /// Embeddings of the unconsumed samples queued for a category, used by
    /// the diversity term of priority scoring.
    fn queued_embeddings(&self, category_id: usize) -> Result<Vec<Vec<f32>>, StoreError>;

    /// Create a queued job for a category if and only if the sample count
    /// has reached the target and no non-terminal job exists for the
    /// category. Returns `None` (a no-op) otherwise, never a second row.
    fn try_create_job(&self, category_id: usize) -> Result<Option<TrainingJob>, StoreError>;

    fn get_job(&self, job_id: Uuid) -> Result<TrainingJob, StoreError>;

    fn list_jobs(&self, category_id: usize) -> Result<Vec<TrainingJob>, StoreError>;

    /// Advance the job's state machine to a new (non-terminal) state.
    fn transition_job(&self, job_id: Uuid, status: JobStatus) -> Result<TrainingJob, StoreError>;

    /// Cheap progress write from the training worker; called once per epoch.
    fn update_job_progress(
        &self,
        job_id: Uuid,
        current_epoch: u32,
        current_loss: f32,
        best_accuracy: f32,
    ) -> Result<(), StoreError>;

    /// Complete a job: create the next model version for the category,
    /// atomically flip the active pointer from the previous version, reset
    /// `requires_retraining` and mark the job's samples consumed, all in one
    /// transaction.
    fn complete_job(
        &self,
        job_id: Uuid,
        accuracy: f32,
        weights_path: &str,
    ) -> Result<ModelVersion, StoreError>;

    /// Fail a job with a reason. Samples stay unconsumed and the category
    /// keeps `requires_retraining = true` so the next trigger can retry.
    fn fail_job(&self, job_id: Uuid, reason: &str) -> Result<TrainingJob, StoreError>;

    fn active_version(&self, category_id: usize) -> Result<Option<ModelVersion>, StoreError>;

    fn list_versions(&self, category_id: usize) -> Result<Vec<ModelVersion>, StoreError>;

    /// Atomically make `version_id` the category's active version (operator
    /// rollback). Does not re-run any job.
    fn activate_version(&self, version_id: Uuid) -> Result<ModelVersion, StoreError>;
}
