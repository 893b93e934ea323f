use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub explain: ExplainConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            explain: ExplainConfig::default(),
            scoring: ScoringConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.explain.cam_threshold) {
            return Err(ConfigError::Invalid(format!(
                "cam_threshold must be in [0, 1], got {}",
                self.explain.cam_threshold
            )));
        }
        let w = &self.scoring;
        let sum = w.uncertainty_weight + w.diversity_weight + w.disagreement_weight;
        if (sum - 1.0).abs() > 1e-4 {
            return Err(ConfigError::Invalid(format!(
                "scoring weights must sum to 1.0, got {sum}"
            )));
        }
        if self.training.stage_epochs.iter().any(|&e| e == 0) {
            return Err(ConfigError::Invalid(
                "every stage needs a non-zero epoch budget".to_string(),
            ));
        }
        if !(0.0 < self.training.val_split && self.training.val_split <= 0.5) {
            return Err(ConfigError::Invalid(format!(
                "val_split must be in (0.0, 0.5], got {}",
                self.training.val_split
            )));
        }
        Ok(())
    }
}

/// Knobs for the explanation pipeline (§ gradient tap, region extraction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainConfig {
    /// Square input resolution fed to the network.
    pub input_size: u32,
    /// Importance-map cutoff for region extraction.
    pub cam_threshold: f32,
    /// Components below this pixel area are treated as noise.
    pub min_region_area: usize,
    /// Heatmap blending factor for the overlay image.
    pub overlay_alpha: f32,
    /// Whether the payload carries the blended overlay in addition to the
    /// raw heatmap.
    pub include_overlay: bool,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            cam_threshold: 0.5,
            min_region_area: 50,
            overlay_alpha: 0.4,
            include_overlay: true,
        }
    }
}

/// Active-learning priority weights and suggestion thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub uncertainty_weight: f32,
    pub diversity_weight: f32,
    pub disagreement_weight: f32,
    /// Uncertainty strategy name: "entropy", "margin" or "least_confident".
    pub uncertainty_strategy: String,
    /// Samples at or above this uncertainty are suggested for review.
    pub suggest_uncertainty_threshold: f32,
    pub suggest_disagreement_threshold: f32,
    pub suggest_diversity_threshold: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            uncertainty_weight: 0.4,
            diversity_weight: 0.3,
            disagreement_weight: 0.3,
            uncertainty_strategy: "entropy".to_string(),
            suggest_uncertainty_threshold: 0.3,
            suggest_disagreement_threshold: 0.4,
            suggest_diversity_threshold: 0.7,
        }
    }
}

/// Staged fine-tuning budgets and safety limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Epoch budget per stage: feature extraction, partial, full fine-tune.
    pub stage_epochs: [u32; 3],
    /// Learning rate per stage; deeper stages use smaller steps.
    pub stage_learning_rates: [f64; 3],
    pub batch_size: usize,
    /// Epochs without validation-accuracy improvement before stopping early.
    pub patience: u32,
    pub val_split: f32,
    pub seed: u64,
    /// Overall wall-clock ceiling per job; exceeding it fails the job.
    pub max_wall_clock_hours: f32,
    /// Variable-name prefixes treated as the classifier head (trainable from
    /// stage 1 onward).
    pub head_prefixes: Vec<String>,
    /// Backbone variable-name prefixes additionally unfrozen in stage 2.
    pub stage2_unfreeze_prefixes: Vec<String>,
    /// Directory where exported fine-tuned weights are written.
    pub output_dir: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            stage_epochs: [10, 15, 25],
            stage_learning_rates: [1e-3, 5e-4, 1e-4],
            batch_size: 16,
            patience: 10,
            val_split: 0.2,
            seed: 42,
            max_wall_clock_hours: 6.0,
            head_prefixes: vec!["head".to_string(), "fc".to_string(), "classifier".to_string()],
            stage2_unfreeze_prefixes: vec!["backbone.7".to_string(), "backbone.8".to_string()],
            output_dir: "models/finetuned".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unbalanced_weights() {
        let mut config = EngineConfig::default();
        config.scoring.diversity_weight = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_epoch_stage() {
        let mut config = EngineConfig::default();
        config.training.stage_epochs = [10, 0, 25];
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let yaml = "explain:\n  input_size: 320\n  cam_threshold: 0.6\n  min_region_area: 50\n  overlay_alpha: 0.4\n  include_overlay: false\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.explain.input_size, 320);
        assert_eq!(config.training.stage_epochs, [10, 15, 25]);
    }
}
