use log::info;
use std::path::Path;
use std::sync::Mutex;
use tch::{CModule, Device, Kind, Tensor};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected tensor shape {got:?}, expected {expected}")]
    Shape { got: Vec<i64>, expected: &'static str },
    #[error("class index {0} out of range for {1} classes")]
    ClassOutOfRange(usize, usize),
    #[error("empty probability vector")]
    EmptyOutput,
    #[error("model lock poisoned")]
    Poisoned,
}

/// The trained classification network, as consumed by this engine.
///
/// The observation point for gradient capture is the seam between
/// `forward_features` and `forward_head`: features are the activations of the
/// deepest spatially-structured layer, and the head maps them to logits.
/// Where that seam sits is an artifact-export decision, so the hooked layer
/// is configurable without code changes.
pub trait ClassifierNetwork: Send + Sync {
    /// Full forward pass producing raw logits of shape `[1, num_classes]`.
    fn forward(&self, input: &Tensor) -> Result<Tensor, ModelError>;

    /// Activations at the tap layer, shape `[1, C, H', W']`.
    fn forward_features(&self, input: &Tensor) -> Result<Tensor, ModelError>;

    /// Logits computed from tap-layer activations. Must be differentiable
    /// with respect to `features` for gradient attribution to work; an
    /// implementation that breaks the graph (in-place ops, detach) degrades
    /// the explanation to the synthetic fallback rather than erroring.
    fn forward_head(&self, features: &Tensor) -> Result<Tensor, ModelError>;

    /// Penultimate feature embedding used for diversity scoring.
    fn embed(&self, input: &Tensor) -> Result<Vec<f32>, ModelError>;

    fn num_classes(&self) -> usize;
}

/// TorchScript-backed network: the backbone and classifier head are exported
/// as separate modules (`features.pt` / `head.pt`) so the activations at the
/// split are observable from outside the scripted graph.
///
/// The scripted modules are not thread-safe, so each sits behind a mutex;
/// weights stay read-only for the lifetime of this handle.
pub struct TorchClassifier {
    features: Mutex<CModule>,
    head: Mutex<CModule>,
    device: Device,
    num_classes: usize,
}

impl TorchClassifier {
    pub fn load(model_dir: impl AsRef<Path>, num_classes: usize) -> Result<Self, ModelError> {
        let model_dir = model_dir.as_ref();
        let device = Device::cuda_if_available();
        let features = CModule::load_on_device(model_dir.join("features.pt"), device)?;
        let head = CModule::load_on_device(model_dir.join("head.pt"), device)?;
        info!(
            "Loaded classifier from {} ({} classes, device {:?})",
            model_dir.display(),
            num_classes,
            device
        );
        Ok(Self {
            features: Mutex::new(features),
            head: Mutex::new(head),
            device,
            num_classes,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl ClassifierNetwork for TorchClassifier {
    fn forward(&self, input: &Tensor) -> Result<Tensor, ModelError> {
        let features = self.forward_features(input)?;
        self.forward_head(&features)
    }

    fn forward_features(&self, input: &Tensor) -> Result<Tensor, ModelError> {
        let input = input.to_device(self.device);
        let module = self.features.lock().map_err(|_| ModelError::Poisoned)?;
        Ok(module.forward_ts(&[input])?)
    }

    fn forward_head(&self, features: &Tensor) -> Result<Tensor, ModelError> {
        let module = self.head.lock().map_err(|_| ModelError::Poisoned)?;
        Ok(module.forward_ts(&[features.shallow_clone()])?)
    }

    fn embed(&self, input: &Tensor) -> Result<Vec<f32>, ModelError> {
        let features = tch::no_grad(|| self.forward_features(input))?;
        let pooled = features
            .f_adaptive_avg_pool2d([1, 1])?
            .f_flatten(0, -1)?;
        tensor_to_vec(&pooled)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Copy a tensor of any shape into a flat `Vec<f32>`.
pub fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>, ModelError> {
    let flat = tensor
        .f_to_kind(Kind::Float)?
        .f_contiguous()?
        .f_view(-1)?;
    let numel = flat.size1()? as usize;
    let mut out = vec![0f32; numel];
    flat.copy_data(&mut out, numel);
    Ok(out)
}
