use super::scorer::{PriorityBreakdown, PriorityScorer};
use crate::config::ScoringConfig;
use crate::store::models::TrainingSample;
use crate::store::{StoreError, TrainingStore};
use chrono::Utc;
use log::info;
use sha2::{Digest, Sha256};
use shared::SampleSource;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("candidate has an empty probability vector")]
    EmptyProbabilities,
    #[error("candidate probabilities contain non-finite values")]
    NonFiniteProbabilities,
}

/// A labeled or corrected sample proposed for the review/training queue.
#[derive(Debug, Clone)]
pub struct SampleCandidate {
    /// Stable reference to the stored image (content hash or storage key).
    pub image_reference: String,
    pub category_id: usize,
    pub source: SampleSource,
    /// Class probabilities the model produced for this image.
    pub probabilities: Vec<f32>,
    /// Feature embedding from the network's penultimate layer.
    pub embedding: Vec<f32>,
    /// Probability vectors from recent model snapshots, when an ensemble is
    /// available; empty otherwise.
    pub snapshot_probabilities: Vec<Vec<f32>>,
}

/// Why a sample was (or was not) suggested for human review.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub suggest: bool,
    pub priority: f32,
    pub criterion: &'static str,
}

/// Scores candidates against the current queue snapshot and inserts them
/// through the store.
pub struct ReviewQueue {
    store: Arc<dyn TrainingStore>,
    scorer: PriorityScorer,
    config: ScoringConfig,
}

impl ReviewQueue {
    pub fn new(store: Arc<dyn TrainingStore>, config: ScoringConfig) -> Self {
        let scorer = PriorityScorer::new(&config);
        Self {
            store,
            scorer,
            config,
        }
    }

    /// Stable content hash for referencing an uploaded image.
    pub fn image_hash(image_data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image_data);
        hex::encode(hasher.finalize())
    }

    /// Score the candidate against the queue as it stands right now, persist
    /// it, and return the stored sample. The priority is computed exactly
    /// once here; it is stored rather than recomputed on later reads.
    pub fn score_and_enqueue(
        &self,
        candidate: SampleCandidate,
    ) -> Result<TrainingSample, QueueError> {
        self.validate(&candidate)?;
        let queued = self.store.queued_embeddings(candidate.category_id)?;
        let breakdown = self.scorer.score(
            &candidate.probabilities,
            &candidate.embedding,
            &queued,
            &candidate.snapshot_probabilities,
        );

        let sample = TrainingSample {
            id: Uuid::new_v4(),
            image_reference: candidate.image_reference,
            category_id: candidate.category_id,
            source: candidate.source,
            uncertainty_score: breakdown.uncertainty,
            diversity_score: breakdown.diversity,
            ensemble_disagreement: breakdown.disagreement,
            priority_score: breakdown.priority,
            embedding: candidate.embedding,
            created_at: Utc::now(),
            used_in_job: None,
        };
        let category = self.store.attach_sample(sample.clone())?;
        info!(
            "Enqueued {} sample for category {} at priority {:.3} ({}/{} toward retraining)",
            sample.source,
            category.code,
            breakdown.priority,
            category.current_sample_count,
            category.target_sample_count
        );
        Ok(sample)
    }

    /// Decide whether an unlabeled image is worth a reviewer's time, and by
    /// which criterion: uncertainty, ensemble disagreement or novelty.
    pub fn should_suggest(
        &self,
        probabilities: &[f32],
        embedding: &[f32],
        category_id: usize,
        snapshot_probabilities: &[Vec<f32>],
    ) -> Result<Suggestion, QueueError> {
        let queued = self.store.queued_embeddings(category_id)?;
        let breakdown: PriorityBreakdown =
            self.scorer
                .score(probabilities, embedding, &queued, snapshot_probabilities);

        let criterion = if breakdown.uncertainty >= self.config.suggest_uncertainty_threshold {
            "uncertainty"
        } else if breakdown.disagreement >= self.config.suggest_disagreement_threshold {
            "disagreement"
        } else if breakdown.diversity >= self.config.suggest_diversity_threshold {
            "diversity"
        } else {
            return Ok(Suggestion {
                suggest: false,
                priority: 0.0,
                criterion: "none",
            });
        };
        Ok(Suggestion {
            suggest: true,
            priority: breakdown.priority,
            criterion,
        })
    }

    fn validate(&self, candidate: &SampleCandidate) -> Result<(), QueueError> {
        if candidate.probabilities.is_empty() {
            return Err(QueueError::EmptyProbabilities);
        }
        if candidate.probabilities.iter().any(|p| !p.is_finite()) {
            return Err(QueueError::NonFiniteProbabilities);
        }
        Ok(())
    }
}
