use super::models::{CustomCategory, ModelVersion, TrainingJob, TrainingSample};
use super::{StoreError, TrainingStore};
use crate::model::classifier::BASE_CLASSES;
use chrono::Utc;
use log::{error, info, warn};
use shared::{JobStatus, Severity};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// In-memory `TrainingStore`. Every compound operation runs under a single
/// lock, which is what makes the count increments and the active-version swap
/// atomic here; a database-backed store maps the same operations onto
/// transactions.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    categories: HashMap<usize, CustomCategory>,
    samples: HashMap<Uuid, TrainingSample>,
    jobs: HashMap<Uuid, TrainingJob>,
    versions: HashMap<Uuid, ModelVersion>,
    next_category_id: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A store pre-seeded with the built-in weld defect classes, each
    /// tracking the same retraining target.
    pub fn with_base_classes(target_sample_count: u32) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for class in BASE_CLASSES.iter() {
                inner.categories.insert(
                    class.id,
                    CustomCategory {
                        id: class.id,
                        code: class.code.clone(),
                        name: class.name.clone(),
                        severity: class.severity,
                        target_sample_count,
                        current_sample_count: 0,
                        requires_retraining: false,
                        created_at: Utc::now(),
                    },
                );
            }
            inner.next_category_id = BASE_CLASSES.len();
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn active_job_for(&self, category_id: usize) -> Option<&TrainingJob> {
        self.jobs
            .values()
            .find(|job| job.category_id == category_id && !job.status.is_terminal())
    }
}

impl TrainingStore for MemoryStore {
    fn create_category(
        &self,
        code: &str,
        name: &str,
        severity: Severity,
        target_sample_count: u32,
    ) -> Result<CustomCategory, StoreError> {
        let mut inner = self.lock();
        if inner.categories.values().any(|c| c.code == code) {
            return Err(StoreError::DuplicateCategory(code.to_string()));
        }
        let id = inner.next_category_id;
        inner.next_category_id += 1;
        let category = CustomCategory {
            id,
            code: code.to_string(),
            name: name.to_string(),
            severity,
            target_sample_count,
            current_sample_count: 0,
            // A new category has no trained representation yet.
            requires_retraining: true,
            created_at: Utc::now(),
        };
        inner.categories.insert(id, category.clone());
        info!("Created category {} ({})", category.name, category.code);
        Ok(category)
    }

    fn get_category(&self, category_id: usize) -> Result<CustomCategory, StoreError> {
        self.lock()
            .categories
            .get(&category_id)
            .cloned()
            .ok_or(StoreError::CategoryNotFound(category_id))
    }

    fn list_categories(&self) -> Result<Vec<CustomCategory>, StoreError> {
        let mut categories: Vec<_> = self.lock().categories.values().cloned().collect();
        categories.sort_by_key(|c| c.id);
        Ok(categories)
    }

    fn attach_sample(&self, sample: TrainingSample) -> Result<CustomCategory, StoreError> {
        let mut inner = self.lock();
        let category = inner
            .categories
            .get_mut(&sample.category_id)
            .ok_or(StoreError::CategoryNotFound(sample.category_id))?;
        category.current_sample_count += 1;
        if category.current_sample_count >= category.target_sample_count
            && !category.requires_retraining
        {
            category.requires_retraining = true;
            info!(
                "Category {} reached {}/{} verified samples; flagged for retraining",
                category.code, category.current_sample_count, category.target_sample_count
            );
        }
        let updated = category.clone();
        inner.samples.insert(sample.id, sample);
        Ok(updated)
    }

    fn get_sample(&self, sample_id: Uuid) -> Result<TrainingSample, StoreError> {
        self.lock()
            .samples
            .get(&sample_id)
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("sample {sample_id} not found")))
    }

    fn unconsumed_samples(&self, category_id: usize) -> Result<Vec<TrainingSample>, StoreError> {
        let inner = self.lock();
        if !inner.categories.contains_key(&category_id) {
            return Err(StoreError::CategoryNotFound(category_id));
        }
        let mut samples: Vec<_> = inner
            .samples
            .values()
            .filter(|s| s.category_id == category_id && s.used_in_job.is_none())
            .cloned()
            .collect();
        samples.sort_by_key(|s| s.created_at);
        Ok(samples)
    }

    fn queued_embeddings(&self, category_id: usize) -> Result<Vec<Vec<f32>>, StoreError> {
        Ok(self
            .unconsumed_samples(category_id)?
            .into_iter()
            .map(|s| s.embedding)
            .collect())
    }

    fn try_create_job(&self, category_id: usize) -> Result<Option<TrainingJob>, StoreError> {
        let mut inner = self.lock();
        let category = inner
            .categories
            .get(&category_id)
            .ok_or(StoreError::CategoryNotFound(category_id))?;
        // The flag is the persistent record of a threshold crossing; it
        // resets on completion, so a finished category does not re-trigger
        // until new samples accumulate.
        if category.current_sample_count < category.target_sample_count
            || !category.requires_retraining
        {
            return Ok(None);
        }
        if let Some(active) = inner.active_job_for(category_id) {
            info!(
                "Category {} already has active job {} ({}); not starting another",
                category_id, active.id, active.status
            );
            return Ok(None);
        }
        let sample_ids: Vec<Uuid> = inner
            .samples
            .values()
            .filter(|s| s.category_id == category_id && s.used_in_job.is_none())
            .map(|s| s.id)
            .collect();
        let job = TrainingJob::new(category_id, sample_ids);
        inner.jobs.insert(job.id, job.clone());
        info!(
            "Created training job {} for category {} over {} samples",
            job.id,
            category_id,
            job.sample_ids.len()
        );
        Ok(Some(job))
    }

    fn get_job(&self, job_id: Uuid) -> Result<TrainingJob, StoreError> {
        self.lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    fn list_jobs(&self, category_id: usize) -> Result<Vec<TrainingJob>, StoreError> {
        let mut jobs: Vec<_> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.category_id == category_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs)
    }

    fn transition_job(&self, job_id: Uuid, status: JobStatus) -> Result<TrainingJob, StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(StoreError::JobAlreadyTerminal {
                job_id,
                status: job.status,
            });
        }
        job.status = status;
        if let Some(stage) = status.stage_index() {
            if stage > 0 {
                job.current_stage = stage;
                job.current_epoch = 0;
            }
        }
        Ok(job.clone())
    }

    fn update_job_progress(
        &self,
        job_id: Uuid,
        current_epoch: u32,
        current_loss: f32,
        best_accuracy: f32,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.current_epoch = current_epoch;
        job.current_loss = current_loss;
        job.best_accuracy = best_accuracy;
        Ok(())
    }

    fn complete_job(
        &self,
        job_id: Uuid,
        accuracy: f32,
        weights_path: &str,
    ) -> Result<ModelVersion, StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(StoreError::JobAlreadyTerminal {
                job_id,
                status: job.status,
            });
        }
        let category_id = job.category_id;

        let previously_active: Vec<Uuid> = inner
            .versions
            .values()
            .filter(|v| v.category_id == category_id && v.is_active)
            .map(|v| v.id)
            .collect();
        if previously_active.len() > 1 {
            error!(
                "Invariant violation: category {} has {} active versions",
                category_id,
                previously_active.len()
            );
            return Err(StoreError::InvariantViolation(format!(
                "category {category_id} has multiple active versions"
            )));
        }

        let version_number = inner
            .versions
            .values()
            .filter(|v| v.category_id == category_id)
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;
        let version = ModelVersion {
            id: Uuid::new_v4(),
            category_id,
            version_number,
            weights_path: weights_path.to_string(),
            accuracy,
            is_active: true,
            created_at: Utc::now(),
        };

        // Single critical section: deactivate the old version, activate the
        // new one, finish the job, consume its samples, reset the category
        // flag. No observer sees any intermediate state.
        for id in previously_active {
            if let Some(old) = inner.versions.get_mut(&id) {
                old.is_active = false;
            }
        }
        inner.versions.insert(version.id, version.clone());

        for sample_id in &job.sample_ids {
            if let Some(sample) = inner.samples.get_mut(sample_id) {
                sample.used_in_job = Some(job_id);
            }
        }
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.best_accuracy = accuracy;
            job.finished_at = Some(Utc::now());
        }
        if let Some(category) = inner.categories.get_mut(&category_id) {
            category.requires_retraining = false;
        }
        info!(
            "Job {} completed; activated model v{} for category {} (accuracy {:.3})",
            job_id, version.version_number, category_id, accuracy
        );
        Ok(version)
    }

    fn fail_job(&self, job_id: Uuid, reason: &str) -> Result<TrainingJob, StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(StoreError::JobAlreadyTerminal {
                job_id,
                status: job.status,
            });
        }
        job.status = JobStatus::Failed;
        job.failure_reason = Some(reason.to_string());
        job.finished_at = Some(Utc::now());
        warn!("Job {} failed: {}", job_id, reason);
        Ok(job.clone())
    }

    fn active_version(&self, category_id: usize) -> Result<Option<ModelVersion>, StoreError> {
        let inner = self.lock();
        let mut active: Vec<_> = inner
            .versions
            .values()
            .filter(|v| v.category_id == category_id && v.is_active)
            .cloned()
            .collect();
        match active.len() {
            0 => Ok(None),
            1 => Ok(active.pop()),
            n => {
                error!("Invariant violation: category {category_id} has {n} active versions");
                Err(StoreError::InvariantViolation(format!(
                    "category {category_id} has {n} active versions"
                )))
            }
        }
    }

    fn list_versions(&self, category_id: usize) -> Result<Vec<ModelVersion>, StoreError> {
        let mut versions: Vec<_> = self
            .lock()
            .versions
            .values()
            .filter(|v| v.category_id == category_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    fn activate_version(&self, version_id: Uuid) -> Result<ModelVersion, StoreError> {
        let mut inner = self.lock();
        let category_id = inner
            .versions
            .get(&version_id)
            .ok_or(StoreError::VersionNotFound(version_id))?
            .category_id;
        for version in inner.versions.values_mut() {
            if version.category_id == category_id {
                version.is_active = version.id == version_id;
            }
        }
        let activated = inner
            .versions
            .get(&version_id)
            .cloned()
            .ok_or(StoreError::VersionNotFound(version_id))?;
        info!(
            "Activated model v{} for category {}",
            activated.version_number, category_id
        );
        Ok(activated)
    }
}
