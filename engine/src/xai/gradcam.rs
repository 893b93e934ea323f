use super::heatmap::ImportanceMap;
use crate::model::network::{tensor_to_vec, ClassifierNetwork, ModelError};
use log::{debug, warn};
use ndarray::Array3;
use tch::{IndexOp, Tensor};

/// Outcome of heatmap synthesis. Callers pattern-match on the tag; assuming
/// `TrueGradient` is a bug, since gradient capture is expected to fail on
/// networks whose internal ops mutate tensors in place.
#[derive(Debug)]
pub enum Attribution {
    TrueGradient(ImportanceMap),
    Synthetic(ImportanceMap),
}

impl Attribution {
    pub fn map(&self) -> &ImportanceMap {
        match self {
            Attribution::TrueGradient(map) | Attribution::Synthetic(map) => map,
        }
    }

    pub fn into_map(self) -> ImportanceMap {
        match self {
            Attribution::TrueGradient(map) | Attribution::Synthetic(map) => map,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Attribution::Synthetic(_))
    }
}

/// Single-pass gradient capture against the network's tap layer.
///
/// Each invocation runs its own forward/backward pass over fresh tensors, so
/// concurrent explanation requests share nothing but the read-only weights.
/// The captured tensors are detached into plain arrays before this function
/// returns; no autograd reference outlives the pass.
pub struct GradientTap<'a> {
    network: &'a dyn ClassifierNetwork,
}

impl<'a> GradientTap<'a> {
    pub fn new(network: &'a dyn ClassifierNetwork) -> Self {
        Self { network }
    }

    /// Produce an importance map for `target_class`, upsampled to
    /// `(out_width, out_height)`.
    ///
    /// Failure semantics: a broken backward pass degrades to the synthetic
    /// fallback (scaled by `confidence`) with a warning; only model or shape
    /// failures on the forward path are errors.
    pub fn attribute(
        &self,
        input: &Tensor,
        target_class: usize,
        confidence: f32,
        out_width: u32,
        out_height: u32,
    ) -> Result<Attribution, ModelError> {
        match self.true_gradient(input, target_class) {
            Ok(map) => Ok(Attribution::TrueGradient(map.upsample(out_width, out_height))),
            Err(CaptureFailure::Fatal(err)) => Err(err),
            Err(CaptureFailure::Degraded(reason)) => {
                warn!(
                    "Gradient capture failed for class {target_class}: {reason}; \
                     falling back to confidence-weighted heatmap"
                );
                Ok(Attribution::Synthetic(ImportanceMap::gaussian_fallback(
                    out_height as usize,
                    out_width as usize,
                    confidence,
                )))
            }
        }
    }

    fn true_gradient(
        &self,
        input: &Tensor,
        target_class: usize,
    ) -> Result<ImportanceMap, CaptureFailure> {
        let features = self
            .network
            .forward_features(input)
            .map_err(CaptureFailure::Fatal)?;
        let features = features.set_requires_grad(true);
        let logits = self
            .network
            .forward_head(&features)
            .map_err(CaptureFailure::Fatal)?;

        let num_classes = self.network.num_classes();
        if target_class >= num_classes {
            return Err(CaptureFailure::Fatal(ModelError::ClassOutOfRange(
                target_class,
                num_classes,
            )));
        }

        let score = logits.i((0, target_class as i64));
        let gradients = Tensor::f_run_backward(&[score], &[features.shallow_clone()], false, false)
            .map_err(|e| CaptureFailure::Degraded(e.to_string()))?;
        let gradient = gradients
            .into_iter()
            .next()
            .ok_or_else(|| CaptureFailure::Degraded("no gradient returned".to_string()))?;

        let activations = to_channel_array(&features).map_err(CaptureFailure::Fatal)?;
        let gradient = to_channel_array(&gradient).map_err(CaptureFailure::Fatal)?;
        if activations.dim() != gradient.dim() {
            return Err(CaptureFailure::Degraded(format!(
                "activation/gradient shape mismatch: {:?} vs {:?}",
                activations.dim(),
                gradient.dim()
            )));
        }

        debug!(
            "Captured activations and gradients of shape {:?}",
            activations.dim()
        );
        Ok(ImportanceMap::from_gradients(
            activations.view(),
            gradient.view(),
        ))
    }
}

enum CaptureFailure {
    /// Model is unusable for this request; propagate.
    Fatal(ModelError),
    /// Backward pass unavailable; degrade to the synthetic fallback.
    Degraded(String),
}

/// Detach a `[1, C, H, W]` tensor into a `(C, H, W)` array.
fn to_channel_array(tensor: &Tensor) -> Result<Array3<f32>, ModelError> {
    let size = tensor.size();
    let (channels, height, width) = match size.as_slice() {
        [1, c, h, w] => (*c as usize, *h as usize, *w as usize),
        _ => {
            return Err(ModelError::Shape {
                got: size,
                expected: "[1, C, H, W]",
            })
        }
    };
    let flat = tensor_to_vec(&tensor.detach())?;
    Array3::from_shape_vec((channels, height, width), flat).map_err(|_| ModelError::Shape {
        got: vec![channels as i64, height as i64, width as i64],
        expected: "C*H*W elements",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Small differentiable network built from plain tensor ops: features are
    /// a 2x2 average pool of the input, the head is a spatial sum per channel
    /// projected onto `num_classes` logits.
    struct PoolNet {
        weight_data: Vec<f32>,
        classes: usize,
        break_graph: bool,
    }

    impl PoolNet {
        fn new(classes: usize, break_graph: bool) -> Self {
            let weight_data = (0..classes * 3)
                .map(|i| (i % 5) as f32 * 0.1 + 0.1)
                .collect();
            Self {
                weight_data,
                classes,
                break_graph,
            }
        }

        fn weight(&self) -> Tensor {
            Tensor::from_slice(&self.weight_data).reshape([3, self.classes as i64])
        }
    }

    impl ClassifierNetwork for PoolNet {
        fn forward(&self, input: &Tensor) -> Result<Tensor, ModelError> {
            let features = self.forward_features(input)?;
            self.forward_head(&features)
        }

        fn forward_features(&self, input: &Tensor) -> Result<Tensor, ModelError> {
            Ok(input.f_avg_pool2d([2, 2], [2, 2], [0, 0], false, true, None)?)
        }

        fn forward_head(&self, features: &Tensor) -> Result<Tensor, ModelError> {
            // A detach here severs the autograd graph the way an in-place
            // mutation inside a scripted module does.
            let features = if self.break_graph {
                features.detach()
            } else {
                features.shallow_clone()
            };
            let pooled = features.f_sum_dim_intlist(
                Some(&[2i64, 3][..]),
                false,
                tch::Kind::Float,
            )?;
            Ok(pooled.f_matmul(&self.weight())?)
        }

        fn embed(&self, input: &Tensor) -> Result<Vec<f32>, ModelError> {
            let features = self.forward_features(input)?;
            tensor_to_vec(&features.f_mean_dim(Some(&[2i64, 3][..]), false, tch::Kind::Float)?)
        }

        fn num_classes(&self) -> usize {
            self.classes
        }
    }

    fn input_tensor() -> Tensor {
        Tensor::from_slice(&(0..3 * 8 * 8).map(|i| i as f32 / 192.0).collect::<Vec<_>>())
            .reshape([1, 3, 8, 8])
    }

    #[test]
    fn healthy_network_yields_true_gradient() {
        let network: Arc<dyn ClassifierNetwork> = Arc::new(PoolNet::new(4, false));
        let tap = GradientTap::new(network.as_ref());
        let attribution = tap.attribute(&input_tensor(), 1, 0.9, 32, 32).unwrap();
        assert!(!attribution.is_synthetic());
        assert_eq!(attribution.map().dim(), (32, 32));
    }

    #[test]
    fn broken_graph_degrades_to_synthetic() {
        let network: Arc<dyn ClassifierNetwork> = Arc::new(PoolNet::new(4, true));
        let tap = GradientTap::new(network.as_ref());
        let attribution = tap.attribute(&input_tensor(), 0, 0.8, 16, 16).unwrap();
        assert!(attribution.is_synthetic());
        assert_eq!(attribution.map().dim(), (16, 16));
        assert!(attribution.map().max_value() > 0.0);
    }

    #[test]
    fn out_of_range_class_is_fatal() {
        let network: Arc<dyn ClassifierNetwork> = Arc::new(PoolNet::new(4, false));
        let tap = GradientTap::new(network.as_ref());
        let result = tap.attribute(&input_tensor(), 9, 0.8, 16, 16);
        assert!(matches!(result, Err(ModelError::ClassOutOfRange(9, 4))));
    }
}
