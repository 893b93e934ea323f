use super::gradcam::{Attribution, GradientTap};
use super::heatmap::ImportanceMap;
use super::regions::RegionExtractor;
use crate::config::ExplainConfig;
use crate::model::classifier::{ClassificationResult, DefectClassifier};
use crate::model::network::ModelError;
use crate::model::preprocess;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbImage;
use log::{info, warn};
use shared::{ClassProbability, ExplanationPayload, PredictionSummary, Severity};
use std::io::Cursor;

#[derive(Debug, thiserror::Error)]
pub enum ExplainError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("failed to encode heatmap: {0}")]
    Encode(#[from] image::ImageError),
}

/// Outcome of comparing a reviewer's corrected label against the original
/// prediction. A high-confidence misclassification is the strongest signal
/// that the model needs retraining on this kind of image.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionAnalysis {
    pub is_correction: bool,
    pub confidence_before: f32,
    pub suggests_retraining: bool,
}

/// Orchestrates gradient tap, heatmap synthesis and region extraction, and
/// assembles the payload handed to external collaborators.
pub struct ExplanationComposer {
    classifier: DefectClassifier,
    extractor: RegionExtractor,
    config: ExplainConfig,
}

impl ExplanationComposer {
    pub fn new(classifier: DefectClassifier, config: ExplainConfig) -> Self {
        let extractor = RegionExtractor::new(config.cam_threshold, config.min_region_area);
        Self {
            classifier,
            extractor,
            config,
        }
    }

    pub fn classifier(&self) -> &DefectClassifier {
        &self.classifier
    }

    /// The sole explanation entry point: one image in, one payload out.
    ///
    /// Gradient-capture failure degrades to the synthetic fallback inside the
    /// tap; only a malformed image or an unusable model is an error here.
    pub fn explain(&self, image_data: &[u8]) -> Result<ExplanationPayload, ExplainError> {
        let original = preprocess::decode_rgb(image_data)?;
        let (width, height) = original.dimensions();
        let input = preprocess::image_to_tensor(&original, self.config.input_size);

        let result = self.classifier.classify_tensor(&input)?;
        info!(
            "Explaining prediction {} ({}) at confidence {:.3}",
            result.class_name, result.class_code, result.confidence
        );

        let tap = GradientTap::new(self.classifier.network().as_ref());
        let attribution = tap.attribute(&input, result.class_id, result.confidence, width, height)?;
        if attribution.is_synthetic() {
            warn!("Serving synthetic heatmap for this request");
        }

        self.compose(result, attribution, &original)
    }

    /// Attribution for an arbitrary class index, used to compare what the
    /// network looks at for each candidate class on the same image.
    pub fn explain_class(
        &self,
        image_data: &[u8],
        target_class: usize,
    ) -> Result<Attribution, ExplainError> {
        let original = preprocess::decode_rgb(image_data)?;
        let (width, height) = original.dimensions();
        let input = preprocess::image_to_tensor(&original, self.config.input_size);
        let result = self.classifier.classify_tensor(&input)?;
        let tap = GradientTap::new(self.classifier.network().as_ref());
        Ok(tap.attribute(&input, target_class, result.confidence, width, height)?)
    }

    /// Base64 PNG heatmaps for every class in the registry, keyed by class
    /// code.
    pub fn comparison_heatmaps(
        &self,
        image_data: &[u8],
    ) -> Result<Vec<(String, String)>, ExplainError> {
        let classes: Vec<(usize, String)> = self
            .classifier
            .registry()
            .iter()
            .map(|c| (c.id, c.code.clone()))
            .collect();
        let mut heatmaps = Vec::with_capacity(classes.len());
        for (class_id, code) in classes {
            let attribution = self.explain_class(image_data, class_id)?;
            heatmaps.push((code, encode_png_base64(&attribution.map().to_rgb())?));
        }
        Ok(heatmaps)
    }

    /// Compare a reviewer's corrected label with the original prediction.
    pub fn analyze_correction(
        &self,
        original: &ClassificationResult,
        corrected_class: usize,
    ) -> CorrectionAnalysis {
        if original.class_id == corrected_class {
            return CorrectionAnalysis {
                is_correction: false,
                confidence_before: original.confidence,
                suggests_retraining: false,
            };
        }
        let suggests_retraining = original.confidence > 0.7;
        if suggests_retraining {
            warn!(
                "High confidence misclassification: predicted class {} at {:.2}, corrected to {}",
                original.class_id, original.confidence, corrected_class
            );
        }
        CorrectionAnalysis {
            is_correction: true,
            confidence_before: original.confidence,
            suggests_retraining,
        }
    }

    fn compose(
        &self,
        result: ClassificationResult,
        attribution: Attribution,
        original: &RgbImage,
    ) -> Result<ExplanationPayload, ExplainError> {
        let synthetic = attribution.is_synthetic();
        let map = attribution.into_map();
        let regions = self.extractor.extract(&map);
        let location_description = self.extractor.describe(&regions, map.dim());

        let heatmap_png_base64 = encode_png_base64(&map.to_rgb())?;
        let overlay_png_base64 = if self.config.include_overlay {
            Some(encode_png_base64(
                &map.overlay_on(original, self.config.overlay_alpha),
            )?)
        } else {
            None
        };

        let rationale = rationale(&result, !regions.is_empty(), &location_description);
        let recommendation = recommendation(result.severity).to_string();

        let probabilities = result
            .probabilities
            .iter()
            .enumerate()
            .map(|(class_id, &probability)| {
                let info = self.classifier.registry().get(class_id);
                ClassProbability {
                    class_id,
                    class_code: info.map(|i| i.code.clone()).unwrap_or_default(),
                    class_name: info.map(|i| i.name.clone()).unwrap_or_default(),
                    probability,
                }
            })
            .collect();

        Ok(ExplanationPayload {
            prediction: PredictionSummary {
                class_id: result.class_id,
                class_code: result.class_code,
                class_name: result.class_name,
                confidence: result.confidence,
                is_defect: result.is_defect,
                severity: result.severity,
            },
            probabilities,
            heatmap_png_base64,
            overlay_png_base64,
            synthetic,
            regions: regions.iter().map(|r| r.to_report()).collect(),
            location_description,
            rationale,
            recommendation,
        })
    }
}

fn rationale(result: &ClassificationResult, has_regions: bool, location: &str) -> String {
    let confidence_pct = result.confidence * 100.0;
    if !result.is_defect {
        return format!(
            "The model classified this weld as acceptable (No Defect) with {confidence_pct:.1}% \
             confidence. No significant defect indications were detected."
        );
    }
    if has_regions {
        format!(
            "The model detected {} with {confidence_pct:.1}% confidence. {location}. The \
             highlighted regions indicate where the defect characteristics are most prominent.",
            result.class_name
        )
    } else {
        format!(
            "The model classified this as {} with {confidence_pct:.1}% confidence. The defect \
             characteristics are distributed across the weld area.",
            result.class_name
        )
    }
}

/// Action recommendation keyed by severity tier.
pub fn recommendation(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => {
            "CRITICAL: This weld requires immediate attention. Recommend rejection and repair \
             according to welding procedure specifications."
        }
        Severity::Medium => {
            "MEDIUM: Assess defect density and size against acceptance criteria. May require \
             further evaluation or repair depending on standards."
        }
        Severity::Acceptable => {
            "ACCEPTABLE: Weld meets quality standards. Proceed with production or final \
             inspection."
        }
    }
}

fn encode_png_base64(image: &RgbImage) -> Result<String, ExplainError> {
    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)?;
    Ok(BASE64.encode(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::classifier::ClassRegistry;
    use crate::model::network::ClassifierNetwork;
    use crate::xai::heatmap::ImportanceMap;
    use std::sync::Arc;
    use tch::{Kind, Tensor};

    /// Deterministic stand-in network whose logits always favor a fixed
    /// class and whose gradient path can be rigged to fail.
    struct FixedNet {
        favored_class: usize,
        logit_gain: f32,
        break_graph: bool,
    }

    impl ClassifierNetwork for FixedNet {
        fn forward(&self, input: &Tensor) -> Result<Tensor, ModelError> {
            let features = self.forward_features(input)?;
            self.forward_head(&features)
        }

        fn forward_features(&self, input: &Tensor) -> Result<Tensor, ModelError> {
            Ok(input.f_avg_pool2d([4, 4], [4, 4], [0, 0], false, true, None)?)
        }

        fn forward_head(&self, features: &Tensor) -> Result<Tensor, ModelError> {
            let features = if self.break_graph {
                features.detach()
            } else {
                features.shallow_clone()
            };
            let pooled = features.f_mean_dim(Some(&[1i64, 2, 3][..]), false, Kind::Float)?;
            let mut bias = vec![0f32; 4];
            bias[self.favored_class] = self.logit_gain;
            let bias = Tensor::from_slice(&bias).reshape([1, 4]);
            Ok(pooled.f_reshape([1, 1])?.f_add(&bias)?)
        }

        fn embed(&self, _input: &Tensor) -> Result<Vec<f32>, ModelError> {
            Ok(vec![0.0; 8])
        }

        fn num_classes(&self) -> usize {
            4
        }
    }

    fn composer(favored_class: usize, logit_gain: f32, break_graph: bool) -> ExplanationComposer {
        let network: Arc<dyn ClassifierNetwork> = Arc::new(FixedNet {
            favored_class,
            logit_gain,
            break_graph,
        });
        let classifier = DefectClassifier::new(network, ClassRegistry::base(), 32);
        ExplanationComposer::new(classifier, ExplainConfig {
            input_size: 32,
            ..ExplainConfig::default()
        })
    }

    fn sample_image() -> Vec<u8> {
        let img = image::RgbImage::from_fn(48, 48, |x, y| {
            image::Rgb([(x * 5) as u8, (y * 5) as u8, 128])
        });
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn broken_gradient_path_still_returns_a_payload() {
        let composer = composer(2, 8.0, true);
        let payload = composer.explain(&sample_image()).unwrap();
        assert!(payload.synthetic);
        assert!(!payload.heatmap_png_base64.is_empty());
        assert_eq!(payload.prediction.class_code, "CR");
        assert_eq!(payload.prediction.severity, Severity::Critical);
    }

    #[test]
    fn healthy_gradient_path_is_not_synthetic() {
        let composer = composer(1, 8.0, false);
        let payload = composer.explain(&sample_image()).unwrap();
        assert!(!payload.synthetic);
        assert_eq!(payload.prediction.class_code, "PO");
        assert_eq!(payload.probabilities.len(), 4);
        let total: f32 = payload.probabilities.iter().map(|p| p.probability).sum();
        assert!((total - 1.0).abs() < 1e-3);
    }

    #[test]
    fn recommendation_follows_severity_tier() {
        assert!(recommendation(Severity::Critical).starts_with("CRITICAL"));
        assert!(recommendation(Severity::Medium).starts_with("MEDIUM"));
        assert!(recommendation(Severity::Acceptable).starts_with("ACCEPTABLE"));
    }

    #[test]
    fn medium_severity_payload_carries_medium_recommendation() {
        let composer = composer(1, 8.0, true); // PO is the medium-severity class
        let payload = composer.explain(&sample_image()).unwrap();
        assert_eq!(payload.prediction.severity, Severity::Medium);
        assert!(payload.recommendation.starts_with("MEDIUM"));
        assert!(payload
            .recommendation
            .contains("acceptance criteria"));
    }

    #[test]
    fn garbage_image_is_a_fatal_request_error() {
        let composer = composer(0, 8.0, false);
        assert!(composer.explain(&[1u8, 2, 3]).is_err());
    }

    #[test]
    fn correction_analysis_flags_confident_mistakes() {
        let composer = composer(0, 8.0, false);
        let result = ClassificationResult {
            class_id: 0,
            class_code: "LP".to_string(),
            class_name: "Lack of Penetration".to_string(),
            confidence: 0.91,
            probabilities: vec![0.91, 0.03, 0.03, 0.03],
            is_defect: true,
            severity: Severity::Critical,
        };
        let analysis = composer.analyze_correction(&result, 3);
        assert!(analysis.is_correction);
        assert!(analysis.suggests_retraining);
        assert!((analysis.confidence_before - 0.91).abs() < 1e-6);

        let agreed = composer.analyze_correction(&result, 0);
        assert!(!agreed.is_correction);
        assert!(!agreed.suggests_retraining);
    }

    #[test]
    fn rationale_mentions_class_and_location() {
        let result = ClassificationResult {
            class_id: 1,
            class_code: "PO".to_string(),
            class_name: "Porosity".to_string(),
            confidence: 0.89,
            probabilities: vec![0.05, 0.89, 0.03, 0.03],
            is_defect: true,
            severity: Severity::Medium,
        };
        let text = rationale(
            &result,
            true,
            "Primary defect indication in central region (coverage: 8.5%)",
        );
        assert!(text.contains("Porosity"));
        assert!(text.contains("89.0%"));
        assert!(text.contains("central region"));
    }

    #[test]
    fn synthetic_heatmap_brightness_tracks_confidence() {
        let dim_map = ImportanceMap::gaussian_fallback(24, 24, 0.5);
        let bright_map = ImportanceMap::gaussian_fallback(24, 24, 0.95);
        assert!(bright_map.max_value() > dim_map.max_value());
        // Sanity: both encode cleanly.
        let _ = encode_png_base64(&dim_map.to_rgb()).unwrap();
        let _ = encode_png_base64(&bright_map.to_rgb()).unwrap();
    }
}
