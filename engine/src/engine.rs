use crate::config::EngineConfig;
use crate::learning::queue::{QueueError, ReviewQueue, SampleCandidate};
use crate::model::classifier::{ClassRegistry, DefectClassifier};
use crate::model::network::ClassifierNetwork;
use crate::store::models::{ModelVersion, TrainingJob, TrainingSample};
use crate::store::{StoreError, TrainingStore};
use crate::training::scheduler::{SchedulerError, TrainingScheduler, TunerFactory};
use crate::xai::explainer::{ExplainError, ExplanationComposer};
use shared::ExplanationPayload;
use std::sync::Arc;
use uuid::Uuid;

/// Facade tying the three subsystems together behind the interfaces exposed
/// to external collaborators: explanation, queue insertion, training trigger
/// and job polling.
///
/// Inference and explanation are synchronous and independent per request;
/// retraining runs on worker threads owned by the scheduler and never
/// mutates the serving network's weights.
pub struct InspectionEngine {
    composer: ExplanationComposer,
    queue: ReviewQueue,
    scheduler: TrainingScheduler,
    store: Arc<dyn TrainingStore>,
}

impl InspectionEngine {
    pub fn new(
        network: Arc<dyn ClassifierNetwork>,
        store: Arc<dyn TrainingStore>,
        tuner_factory: TunerFactory,
        config: EngineConfig,
    ) -> Result<Self, StoreError> {
        let registry = ClassRegistry::with_custom(&store.list_categories()?);
        let classifier = DefectClassifier::new(network, registry, config.explain.input_size);
        let composer = ExplanationComposer::new(classifier, config.explain.clone());
        let queue = ReviewQueue::new(store.clone(), config.scoring.clone());
        let scheduler = TrainingScheduler::new(store.clone(), tuner_factory, config.training);
        Ok(Self {
            composer,
            queue,
            scheduler,
            store,
        })
    }

    /// Classify one image and explain the decision. The sole entry point for
    /// the explanation pipeline.
    pub fn explain(&self, image_data: &[u8]) -> Result<ExplanationPayload, ExplainError> {
        self.composer.explain(image_data)
    }

    pub fn composer(&self) -> &ExplanationComposer {
        &self.composer
    }

    /// Score a labeled/corrected sample and insert it into the review queue;
    /// returns the stored priority.
    pub fn score_and_enqueue(&self, candidate: SampleCandidate) -> Result<f32, QueueError> {
        Ok(self.queue.score_and_enqueue(candidate)?.priority_score)
    }

    pub fn queue(&self) -> &ReviewQueue {
        &self.queue
    }

    /// Idempotent retraining trigger; safe to call after every insertion.
    pub fn maybe_start_training(&self, category_id: usize) -> Result<Option<Uuid>, SchedulerError> {
        self.scheduler.maybe_start_training(category_id)
    }

    /// Progress snapshot for polling displays.
    pub fn get_job_status(&self, job_id: Uuid) -> Result<TrainingJob, SchedulerError> {
        self.scheduler.job_status(job_id)
    }

    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        self.scheduler.cancel(job_id)
    }

    /// Join a job's worker and return its terminal record.
    pub fn wait_for_job(&self, job_id: Uuid) -> Result<TrainingJob, SchedulerError> {
        self.scheduler.wait(job_id)
    }

    /// Operator rollback: atomically re-activate a previously trained
    /// version. Never re-runs a job.
    pub fn rollback_to_version(&self, version_id: Uuid) -> Result<ModelVersion, StoreError> {
        self.store.activate_version(version_id)
    }

    pub fn unconsumed_samples(&self, category_id: usize) -> Result<Vec<TrainingSample>, StoreError> {
        self.store.unconsumed_samples(category_id)
    }

    pub fn store(&self) -> &Arc<dyn TrainingStore> {
        &self.store
    }
}
