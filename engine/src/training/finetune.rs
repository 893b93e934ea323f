use crate::config::TrainingConfig;
use crate::model::network::ModelError;
use crate::model::preprocess;
use crate::store::models::TrainingSample;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use tch::nn::{ModuleT, OptimizerConfig};
use tch::{nn, Device, Tensor, TrainableCModule};

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no training samples available")]
    EmptyDataset,
    #[error("tuner used before prepare()")]
    NotPrepared,
}

/// The three progressive fine-tuning stages. Each stage unfreezes a larger
/// fraction of the network, trading speed for adaptation depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FineTuneStage {
    /// Only the classifier head trains.
    FeatureExtraction,
    /// The last backbone blocks join in.
    PartialFinetune,
    /// The whole network trains.
    FullFinetune,
}

impl FineTuneStage {
    pub const ALL: [FineTuneStage; 3] = [
        FineTuneStage::FeatureExtraction,
        FineTuneStage::PartialFinetune,
        FineTuneStage::FullFinetune,
    ];

    /// 1-based stage index matching the job state machine.
    pub fn index(&self) -> u32 {
        match self {
            FineTuneStage::FeatureExtraction => 1,
            FineTuneStage::PartialFinetune => 2,
            FineTuneStage::FullFinetune => 3,
        }
    }
}

/// Metrics reported after each epoch for progress display and for the
/// scheduler's early-stopping and divergence checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub train_loss: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
}

/// One fine-tuning run over a fixed sample set. The scheduler drives this
/// through `prepare` → per-stage `begin_stage` → repeated `run_epoch` →
/// `export`; implementations never touch the store.
pub trait FineTuner: Send {
    fn prepare(&mut self, samples: &[TrainingSample]) -> Result<(), TrainError>;

    /// Apply the stage's freeze policy and learning rate.
    fn begin_stage(&mut self, stage: FineTuneStage) -> Result<(), TrainError>;

    fn run_epoch(&mut self) -> Result<EpochMetrics, TrainError>;

    /// Write the fine-tuned weights as a new artifact and return its path.
    /// Training never mutates the serving weights in place; activation is
    /// the store's atomic pointer flip.
    fn export(&mut self) -> Result<String, TrainError>;
}

/// tch-backed fine-tuner: loads a trainable copy of the scripted model,
/// freezes `VarStore` variables by name prefix per stage, and trains with
/// Adam and a cross-entropy objective.
pub struct TorchFineTuner {
    config: TrainingConfig,
    device: Device,
    /// Trainable TorchScript artifact to start from.
    base_artifact: PathBuf,
    /// Root directory the samples' image references resolve against.
    dataset_root: PathBuf,
    input_size: u32,
    run_tag: String,
    state: Option<TrainState>,
    epoch_counter: u32,
}

struct TrainState {
    vs: nn::VarStore,
    module: TrainableCModule,
    optimizer: nn::Optimizer,
    train_inputs: Vec<Tensor>,
    train_labels: Vec<i64>,
    val_inputs: Vec<Tensor>,
    val_labels: Vec<i64>,
}

impl TorchFineTuner {
    pub fn new(
        config: TrainingConfig,
        base_artifact: impl Into<PathBuf>,
        dataset_root: impl Into<PathBuf>,
        input_size: u32,
        run_tag: impl Into<String>,
    ) -> Self {
        Self {
            config,
            device: Device::cuda_if_available(),
            base_artifact: base_artifact.into(),
            dataset_root: dataset_root.into(),
            input_size,
            run_tag: run_tag.into(),
            state: None,
            epoch_counter: 0,
        }
    }

    fn load_sample(&self, sample: &TrainingSample) -> Result<(Tensor, i64), TrainError> {
        let path = self.dataset_root.join(&sample.image_reference);
        let bytes = std::fs::read(&path)?;
        let (tensor, _, _) = preprocess::decode_to_tensor(&bytes, self.input_size)?;
        Ok((tensor.to_device(self.device), sample.category_id as i64))
    }

    /// Deterministic shuffled split into train and validation; the val set is
    /// frozen for the whole run.
    fn split(
        &self,
        mut pairs: Vec<(Tensor, i64)>,
    ) -> (Vec<Tensor>, Vec<i64>, Vec<Tensor>, Vec<i64>) {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        pairs.shuffle(&mut rng);
        let val_count = ((pairs.len() as f32) * self.config.val_split).ceil() as usize;
        let val_count = val_count.clamp(1, pairs.len().saturating_sub(1).max(1));
        let val = pairs.split_off(pairs.len() - val_count);
        let (train_inputs, train_labels): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        let (val_inputs, val_labels): (Vec<_>, Vec<_>) = val.into_iter().unzip();
        (train_inputs, train_labels, val_inputs, val_labels)
    }

    fn is_head_variable(&self, name: &str) -> bool {
        matches_any(&self.config.head_prefixes, name)
    }

    fn is_stage2_variable(&self, name: &str) -> bool {
        matches_any(&self.config.stage2_unfreeze_prefixes, name)
    }
}

fn matches_any(prefixes: &[String], name: &str) -> bool {
    prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
}

impl FineTuner for TorchFineTuner {
    fn prepare(&mut self, samples: &[TrainingSample]) -> Result<(), TrainError> {
        if samples.is_empty() {
            return Err(TrainError::EmptyDataset);
        }
        let mut pairs = Vec::with_capacity(samples.len());
        for sample in samples {
            pairs.push(self.load_sample(sample)?);
        }
        let (train_inputs, train_labels, val_inputs, val_labels) = self.split(pairs);
        info!(
            "Prepared fine-tuning run {}: {} train / {} val samples",
            self.run_tag,
            train_inputs.len(),
            val_inputs.len()
        );

        let vs = nn::VarStore::new(self.device);
        let mut module = TrainableCModule::load(&self.base_artifact, vs.root())?;
        module.set_train();
        let optimizer = nn::Adam::default().build(&vs, self.config.stage_learning_rates[0])?;
        self.state = Some(TrainState {
            vs,
            module,
            optimizer,
            train_inputs,
            train_labels,
            val_inputs,
            val_labels,
        });
        self.epoch_counter = 0;
        Ok(())
    }

    fn begin_stage(&mut self, stage: FineTuneStage) -> Result<(), TrainError> {
        let Self { config, state, .. } = self;
        let state = state.as_mut().ok_or(TrainError::NotPrepared)?;
        let variables = state.vs.variables();
        let mut frozen = 0usize;
        for (name, variable) in &variables {
            let trainable = match stage {
                FineTuneStage::FeatureExtraction => matches_any(&config.head_prefixes, name),
                FineTuneStage::PartialFinetune => {
                    matches_any(&config.head_prefixes, name)
                        || matches_any(&config.stage2_unfreeze_prefixes, name)
                }
                FineTuneStage::FullFinetune => true,
            };
            let _ = variable.set_requires_grad(trainable);
            if !trainable {
                frozen += 1;
            }
        }
        let lr = config.stage_learning_rates[(stage.index() - 1) as usize];
        state.optimizer.set_lr(lr);
        info!(
            "Entering stage {} ({} of {} variables frozen, lr {:.1e})",
            stage.index(),
            frozen,
            variables.len(),
            lr
        );
        Ok(())
    }

    fn run_epoch(&mut self) -> Result<EpochMetrics, TrainError> {
        self.epoch_counter += 1;
        let seed = self.config.seed.wrapping_add(self.epoch_counter as u64);
        let batch_size = self.config.batch_size.max(1);
        let state = self.state.as_mut().ok_or(TrainError::NotPrepared)?;

        // Reshuffle the training set each epoch; the validation set stays
        // fixed.
        let mut order: Vec<usize> = (0..state.train_inputs.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let mut total_loss = 0f64;
        let mut seen = 0usize;
        for chunk in order.chunks(batch_size) {
            let inputs: Vec<Tensor> = chunk
                .iter()
                .map(|&i| state.train_inputs[i].shallow_clone())
                .collect();
            let labels: Vec<i64> = chunk.iter().map(|&i| state.train_labels[i]).collect();
            let batch = Tensor::f_cat(&inputs, 0)?;
            let targets = Tensor::from_slice(&labels).to_device(batch.device());

            let logits = state.module.forward_t(&batch, true);
            let loss = logits.cross_entropy_for_logits(&targets);
            state.optimizer.backward_step(&loss);

            total_loss += loss.double_value(&[]) * chunk.len() as f64;
            seen += chunk.len();
        }
        let train_loss = if seen > 0 {
            (total_loss / seen as f64) as f32
        } else {
            0.0
        };

        let (val_loss, val_accuracy) = tch::no_grad(|| -> Result<(f32, f32), TrainError> {
            let inputs: Vec<Tensor> = state
                .val_inputs
                .iter()
                .map(Tensor::shallow_clone)
                .collect();
            let batch = Tensor::f_cat(&inputs, 0)?;
            let targets = Tensor::from_slice(&state.val_labels).to_device(batch.device());
            let logits = state.module.forward_t(&batch, false);
            let loss = logits.cross_entropy_for_logits(&targets);
            let accuracy = logits.accuracy_for_logits(&targets);
            Ok((
                loss.double_value(&[]) as f32,
                accuracy.double_value(&[]) as f32,
            ))
        })?;

        debug!(
            "Epoch {}: train_loss {:.4}, val_loss {:.4}, val_acc {:.4}",
            self.epoch_counter, train_loss, val_loss, val_accuracy
        );
        Ok(EpochMetrics {
            train_loss,
            val_loss,
            val_accuracy,
        })
    }

    fn export(&mut self) -> Result<String, TrainError> {
        let state = self.state.as_ref().ok_or(TrainError::NotPrepared)?;
        let output_dir = PathBuf::from(&self.config.output_dir);
        std::fs::create_dir_all(&output_dir)?;
        let path = output_dir.join(format!("{}.ot", self.run_tag));
        state.vs.save(&path)?;
        info!("Exported fine-tuned weights to {}", path.display());
        Ok(path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_indices_are_one_based_and_ordered() {
        let indices: Vec<u32> = FineTuneStage::ALL.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn head_prefix_matching_follows_config() {
        let tuner = TorchFineTuner::new(
            TrainingConfig::default(),
            "base.pt",
            "data",
            224,
            "test-run",
        );
        assert!(tuner.is_head_variable("head.weight"));
        assert!(tuner.is_head_variable("classifier.bias"));
        assert!(!tuner.is_head_variable("backbone.0.conv.weight"));
        assert!(tuner.is_stage2_variable("backbone.7.conv.weight"));
        assert!(!tuner.is_stage2_variable("backbone.2.conv.weight"));
    }

    #[test]
    fn unprepared_tuner_refuses_to_run() {
        let mut tuner = TorchFineTuner::new(
            TrainingConfig::default(),
            "base.pt",
            "data",
            224,
            "test-run",
        );
        assert!(matches!(tuner.run_epoch(), Err(TrainError::NotPrepared)));
        assert!(matches!(
            tuner.begin_stage(FineTuneStage::FeatureExtraction),
            Err(TrainError::NotPrepared)
        ));
        assert!(matches!(tuner.export(), Err(TrainError::NotPrepared)));
    }

    #[test]
    fn empty_sample_set_is_rejected() {
        let mut tuner = TorchFineTuner::new(
            TrainingConfig::default(),
            "base.pt",
            "data",
            224,
            "test-run",
        );
        assert!(matches!(tuner.prepare(&[]), Err(TrainError::EmptyDataset)));
    }
}
