use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{JobStatus, SampleSource, Severity};
use uuid::Uuid;

/// An operator-defined (or built-in) defect category tracked for retraining.
///
/// `current_sample_count` increments atomically with each attached sample;
/// `requires_retraining` flips true exactly when the count reaches
/// `target_sample_count` and flips false only when a training job for the
/// category completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomCategory {
    /// Category id doubles as the class index in the classifier's table.
    pub id: usize,
    pub code: String,
    pub name: String,
    pub severity: Severity,
    pub target_sample_count: u32,
    pub current_sample_count: u32,
    pub requires_retraining: bool,
    pub created_at: DateTime<Utc>,
}

/// A human-labeled or corrected sample queued for retraining. Never mutated
/// after consumption except to attach the consuming job's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSample {
    pub id: Uuid,
    /// Stable reference to the stored image (content hash or storage key).
    pub image_reference: String,
    pub category_id: usize,
    pub source: SampleSource,
    pub uncertainty_score: f32,
    pub diversity_score: f32,
    pub ensemble_disagreement: f32,
    pub priority_score: f32,
    /// Feature embedding captured at insertion; later candidates measure
    /// their diversity against these.
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_in_job: Option<Uuid>,
}

/// One retraining job. At most one non-terminal job exists per category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: Uuid,
    pub category_id: usize,
    pub status: JobStatus,
    /// 0 while queued, 1..=3 for the stage being (or last) run.
    pub current_stage: u32,
    /// Epoch counter within the current stage.
    pub current_epoch: u32,
    pub current_loss: f32,
    /// Best (not latest) validation accuracy seen so far.
    pub best_accuracy: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Samples snapshotted as this job's dataset at creation time. Marked
    /// consumed only on completion.
    pub sample_ids: Vec<Uuid>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrainingJob {
    pub fn new(category_id: usize, sample_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category_id,
            status: JobStatus::Queued,
            current_stage: 0,
            current_epoch: 0,
            current_loss: 0.0,
            best_accuracy: 0.0,
            failure_reason: None,
            sample_ids,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// A trained model artifact for a category. Exactly one version per category
/// is active at any time; activation is an atomic pointer flip, never an
/// in-place weight mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: Uuid,
    pub category_id: usize,
    pub version_number: u32,
    pub weights_path: String,
    pub accuracy: f32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
