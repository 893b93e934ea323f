/// Prediction-uncertainty estimate over a class-probability distribution,
/// swappable without touching callers of the priority scorer.
pub trait UncertaintyStrategy: Send + Sync {
    /// Returns a score in [0, 1]: 0 = certain, 1 = maximally uncertain.
    fn score(&self, probabilities: &[f32]) -> f32;

    fn name(&self) -> &'static str;
}

/// Shannon entropy normalized by `ln(num_classes)`.
pub struct Entropy;

impl UncertaintyStrategy for Entropy {
    fn score(&self, probabilities: &[f32]) -> f32 {
        if probabilities.len() < 2 {
            return 0.0;
        }
        let entropy: f32 = probabilities
            .iter()
            .map(|&p| {
                let p = p.max(0.0) + 1e-10;
                -p * p.ln()
            })
            .sum();
        let max_entropy = (probabilities.len() as f32).ln();
        (entropy / max_entropy).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "entropy"
    }
}

/// Inverted margin between the top two probabilities: a small margin means
/// high uncertainty.
pub struct Margin;

impl UncertaintyStrategy for Margin {
    fn score(&self, probabilities: &[f32]) -> f32 {
        if probabilities.len() < 2 {
            return 0.0;
        }
        let mut sorted = probabilities.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        (1.0 - (sorted[0] - sorted[1])).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "margin"
    }
}

/// One minus the winning probability.
pub struct LeastConfident;

impl UncertaintyStrategy for LeastConfident {
    fn score(&self, probabilities: &[f32]) -> f32 {
        let top = probabilities.iter().copied().fold(0.0f32, f32::max);
        (1.0 - top).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "least_confident"
    }
}

/// Resolve a strategy by its configured name; unknown names fall back to
/// entropy with a warning.
pub fn strategy_from_name(name: &str) -> Box<dyn UncertaintyStrategy> {
    match name {
        "margin" => Box::new(Margin),
        "least_confident" => Box::new(LeastConfident),
        "entropy" => Box::new(Entropy),
        other => {
            log::warn!("Unknown uncertainty strategy '{other}', using entropy");
            Box::new(Entropy)
        }
    }
}
