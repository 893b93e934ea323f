//! Wiring tests for the `InspectionEngine` facade: queue insertion, the
//! idempotent training trigger, job polling and version rollback.

use engine::config::EngineConfig;
use engine::learning::queue::SampleCandidate;
use engine::model::network::{ClassifierNetwork, ModelError};
use engine::store::{MemoryStore, TrainingStore};
use engine::training::finetune::{EpochMetrics, FineTuneStage, FineTuner, TrainError};
use engine::training::scheduler::TunerFactory;
use engine::InspectionEngine;
use shared::{JobStatus, SampleSource};
use std::sync::Arc;
use tch::Tensor;
use uuid::Uuid;

/// Network stub for flows that never run inference.
struct OfflineNet;

impl ClassifierNetwork for OfflineNet {
    fn forward(&self, _input: &Tensor) -> Result<Tensor, ModelError> {
        Err(ModelError::EmptyOutput)
    }
    fn forward_features(&self, _input: &Tensor) -> Result<Tensor, ModelError> {
        Err(ModelError::EmptyOutput)
    }
    fn forward_head(&self, _features: &Tensor) -> Result<Tensor, ModelError> {
        Err(ModelError::EmptyOutput)
    }
    fn embed(&self, _input: &Tensor) -> Result<Vec<f32>, ModelError> {
        Ok(vec![0.0; 4])
    }
    fn num_classes(&self) -> usize {
        4
    }
}

struct InstantTuner {
    accuracy: f32,
}

impl FineTuner for InstantTuner {
    fn prepare(&mut self, _samples: &[engine::store::TrainingSample]) -> Result<(), TrainError> {
        Ok(())
    }
    fn begin_stage(&mut self, _stage: FineTuneStage) -> Result<(), TrainError> {
        Ok(())
    }
    fn run_epoch(&mut self) -> Result<EpochMetrics, TrainError> {
        Ok(EpochMetrics {
            train_loss: 0.3,
            val_loss: 0.3,
            val_accuracy: self.accuracy,
        })
    }
    fn export(&mut self) -> Result<String, TrainError> {
        Ok("models/test/facade.ot".to_string())
    }
}

fn engine_with_target(target: u32) -> (InspectionEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::with_base_classes(target));
    let factory: TunerFactory =
        Arc::new(|_job, _samples| Ok(Box::new(InstantTuner { accuracy: 0.9 }) as Box<dyn FineTuner>));
    let mut config = EngineConfig::default();
    config.training.patience = 2;
    let engine = InspectionEngine::new(
        Arc::new(OfflineNet),
        store.clone(),
        factory,
        config,
    )
    .unwrap();
    (engine, store)
}

fn candidate(category_id: usize) -> SampleCandidate {
    SampleCandidate {
        image_reference: "facade-test".to_string(),
        category_id,
        source: SampleSource::ActiveLearning,
        probabilities: vec![0.4, 0.3, 0.2, 0.1],
        embedding: vec![1.0, 0.0],
        snapshot_probabilities: vec![vec![0.9, 0.1, 0.0, 0.0], vec![0.2, 0.7, 0.1, 0.0]],
    }
}

#[test]
fn enqueue_then_trigger_then_poll_then_rollback() {
    let (engine, store) = engine_with_target(2);

    // Below target: trigger no-ops.
    let priority = engine.score_and_enqueue(candidate(1)).unwrap();
    assert!((0.0..=1.0).contains(&priority));
    assert!(engine.maybe_start_training(1).unwrap().is_none());

    // At target: exactly one job starts.
    engine.score_and_enqueue(candidate(1)).unwrap();
    let job_id = engine.maybe_start_training(1).unwrap().unwrap();
    assert!(engine.maybe_start_training(1).unwrap().is_none());

    let finished = engine.wait_for_job(job_id).unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(engine.get_job_status(job_id).unwrap().status, JobStatus::Completed);
    assert!(engine.unconsumed_samples(1).unwrap().is_empty());

    // Second round produces v2; rollback flips back to v1.
    engine.score_and_enqueue(candidate(1)).unwrap();
    engine.score_and_enqueue(candidate(1)).unwrap();
    let second = engine.maybe_start_training(1).unwrap().unwrap();
    engine.wait_for_job(second).unwrap();

    let versions = store.list_versions(1).unwrap();
    assert_eq!(versions.len(), 2);
    let v1 = versions.iter().find(|v| v.version_number == 1).unwrap();
    let rolled_back = engine.rollback_to_version(v1.id).unwrap();
    assert!(rolled_back.is_active);
    assert_eq!(store.active_version(1).unwrap().unwrap().id, v1.id);
}

#[test]
fn cancel_is_false_for_unknown_jobs() {
    let (engine, _) = engine_with_target(10);
    assert!(!engine.cancel_job(Uuid::new_v4()));
}

#[test]
fn job_status_for_missing_job_is_an_error() {
    let (engine, _) = engine_with_target(10);
    assert!(engine.get_job_status(Uuid::new_v4()).is_err());
}
