pub mod explainer;
pub mod gradcam;
pub mod heatmap;
pub mod regions;

pub use explainer::{CorrectionAnalysis, ExplainError, ExplanationComposer};
pub use gradcam::{Attribution, GradientTap};
pub use heatmap::ImportanceMap;
pub use regions::{DefectRegion, RegionExtractor};
