pub mod finetune;
pub mod scheduler;

pub use finetune::{EpochMetrics, FineTuneStage, FineTuner, TorchFineTuner, TrainError};
pub use scheduler::{SchedulerError, TrainingScheduler, TunerFactory};
