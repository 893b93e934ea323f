use super::uncertainty::{strategy_from_name, UncertaintyStrategy};
use crate::config::ScoringConfig;
use log::debug;

/// Individual terms behind a priority score, kept for diagnostics and stored
/// on the sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityBreakdown {
    pub uncertainty: f32,
    pub diversity: f32,
    pub disagreement: f32,
    pub priority: f32,
}

/// Combines prediction uncertainty, feature-space diversity and ensemble
/// disagreement into one active-learning priority in [0, 1].
///
/// The score is computed once at insertion time against a snapshot of the
/// queue and stored; recomputing later would chase a moving target and break
/// the queue's ordering guarantees.
pub struct PriorityScorer {
    strategy: Box<dyn UncertaintyStrategy>,
    uncertainty_weight: f32,
    diversity_weight: f32,
    disagreement_weight: f32,
}

impl PriorityScorer {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            strategy: strategy_from_name(&config.uncertainty_strategy),
            uncertainty_weight: config.uncertainty_weight,
            diversity_weight: config.diversity_weight,
            disagreement_weight: config.disagreement_weight,
        }
    }

    pub fn with_strategy(config: &ScoringConfig, strategy: Box<dyn UncertaintyStrategy>) -> Self {
        Self {
            strategy,
            uncertainty_weight: config.uncertainty_weight,
            diversity_weight: config.diversity_weight,
            disagreement_weight: config.disagreement_weight,
        }
    }

    pub fn uncertainty(&self, probabilities: &[f32]) -> f32 {
        self.strategy.score(probabilities)
    }

    /// Cosine distance between the candidate embedding and the centroid of
    /// the embeddings already queued for the same category. An empty queue
    /// yields exactly 1.0: anything is diverse against nothing.
    pub fn diversity(&self, embedding: &[f32], queued: &[Vec<f32>]) -> f32 {
        if queued.is_empty() {
            return 1.0;
        }
        let dim = embedding.len();
        if dim == 0 {
            return 1.0;
        }
        let mut centroid = vec![0f32; dim];
        let mut counted = 0usize;
        for other in queued {
            if other.len() != dim {
                continue;
            }
            for (c, v) in centroid.iter_mut().zip(other) {
                *c += v;
            }
            counted += 1;
        }
        if counted == 0 {
            return 1.0;
        }
        for c in centroid.iter_mut() {
            *c /= counted as f32;
        }
        (1.0 - cosine_similarity(embedding, &centroid)).clamp(0.0, 1.0)
    }

    /// Mean per-class variance of the probability vectors across model
    /// snapshots, normalized by the 0.25 maximum (half predicting 0, half
    /// predicting 1). Fewer than two snapshots means no ensemble and no
    /// disagreement.
    pub fn disagreement(&self, snapshot_probabilities: &[Vec<f32>]) -> f32 {
        if snapshot_probabilities.len() < 2 {
            return 0.0;
        }
        let num_classes = snapshot_probabilities[0].len();
        if num_classes == 0
            || snapshot_probabilities
                .iter()
                .any(|p| p.len() != num_classes)
        {
            return 0.0;
        }
        let n = snapshot_probabilities.len() as f32;
        let mut variance_sum = 0f32;
        for class in 0..num_classes {
            let mean: f32 = snapshot_probabilities.iter().map(|p| p[class]).sum::<f32>() / n;
            let variance: f32 = snapshot_probabilities
                .iter()
                .map(|p| (p[class] - mean).powi(2))
                .sum::<f32>()
                / n;
            variance_sum += variance;
        }
        let avg_variance = variance_sum / num_classes as f32;
        (avg_variance / 0.25).clamp(0.0, 1.0)
    }

    /// Full weighted combination; every term is bounded before combination
    /// and the result is clamped to [0, 1].
    pub fn score(
        &self,
        probabilities: &[f32],
        embedding: &[f32],
        queued: &[Vec<f32>],
        snapshot_probabilities: &[Vec<f32>],
    ) -> PriorityBreakdown {
        let uncertainty = self.uncertainty(probabilities).clamp(0.0, 1.0);
        let diversity = self.diversity(embedding, queued);
        let disagreement = self.disagreement(snapshot_probabilities);
        let priority = (self.uncertainty_weight * uncertainty
            + self.diversity_weight * diversity
            + self.disagreement_weight * disagreement)
            .clamp(0.0, 1.0);
        debug!(
            "Priority {:.3} (uncertainty {:.3} via {}, diversity {:.3}, disagreement {:.3})",
            priority,
            uncertainty,
            self.strategy.name(),
            diversity,
            disagreement
        );
        PriorityBreakdown {
            uncertainty,
            diversity,
            disagreement,
            priority,
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> PriorityScorer {
        PriorityScorer::new(&ScoringConfig::default())
    }

    #[test]
    fn empty_queue_diversity_is_exactly_one() {
        assert_eq!(scorer().diversity(&[0.3, 0.4], &[]), 1.0);
    }

    #[test]
    fn identical_embedding_has_zero_diversity() {
        let queued = vec![vec![0.6, 0.8], vec![0.6, 0.8]];
        let diversity = scorer().diversity(&[0.6, 0.8], &queued);
        assert!(diversity < 1e-6, "got {diversity}");
    }

    #[test]
    fn orthogonal_embedding_is_maximally_diverse() {
        let queued = vec![vec![1.0, 0.0]];
        let diversity = scorer().diversity(&[0.0, 1.0], &queued);
        assert!((diversity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn single_snapshot_means_no_disagreement() {
        assert_eq!(scorer().disagreement(&[vec![0.9, 0.1]]), 0.0);
        assert_eq!(scorer().disagreement(&[]), 0.0);
    }

    #[test]
    fn opposed_snapshots_disagree_maximally() {
        let snapshots = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let disagreement = scorer().disagreement(&snapshots);
        assert!((disagreement - 1.0).abs() < 1e-6, "got {disagreement}");
    }

    #[test]
    fn agreeing_snapshots_do_not_disagree() {
        let snapshots = vec![vec![0.8, 0.2], vec![0.8, 0.2], vec![0.8, 0.2]];
        assert!(scorer().disagreement(&snapshots) < 1e-6);
    }

    #[test]
    fn priority_is_always_bounded() {
        let scorer = scorer();
        let cases: [(&[f32], &[f32]); 3] = [
            (&[0.25, 0.25, 0.25, 0.25], &[1.0, 0.0]),
            (&[0.97, 0.01, 0.01, 0.01], &[0.5, 0.5]),
            (&[0.5, 0.5], &[0.0, 0.0]),
        ];
        let queued = vec![vec![1.0, 0.0]];
        let snapshots = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        for (probs, embedding) in cases {
            let breakdown = scorer.score(probs, embedding, &queued, &snapshots);
            assert!((0.0..=1.0).contains(&breakdown.priority));
            assert!((0.0..=1.0).contains(&breakdown.uncertainty));
            assert!((0.0..=1.0).contains(&breakdown.diversity));
            assert!((0.0..=1.0).contains(&breakdown.disagreement));
        }
    }

    #[test]
    fn maximally_ambiguous_sample_scores_one() {
        // Uniform probabilities, empty queue and a fully split ensemble
        // saturate every term.
        let breakdown = scorer().score(
            &[0.5, 0.5],
            &[0.1, 0.2],
            &[],
            &[vec![1.0, 0.0], vec![0.0, 1.0]],
        );
        assert!((breakdown.priority - 1.0).abs() < 1e-4, "{breakdown:?}");
    }

    #[test]
    fn weights_follow_configuration() {
        // Only the uncertainty term fires: uniform probs, zero-distance
        // embedding, agreeing ensemble.
        let queued = vec![vec![1.0, 1.0]];
        let snapshots = vec![vec![0.5, 0.5], vec![0.5, 0.5]];
        let breakdown = scorer().score(&[0.5, 0.5], &[1.0, 1.0], &queued, &snapshots);
        assert!((breakdown.priority - 0.4).abs() < 1e-4, "{breakdown:?}");
    }
}
