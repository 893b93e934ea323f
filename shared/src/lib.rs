use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Operational risk tier assigned to a defect category.
///
/// The mapping from category to severity is static: structural-integrity
/// defects are always critical regardless of confidence, cosmetic defects are
/// medium, and a clean weld is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum Severity {
    #[serde(rename = "CRITICAL")]
    #[strum(serialize = "CRITICAL")]
    Critical,
    #[serde(rename = "MEDIUM")]
    #[strum(serialize = "MEDIUM")]
    Medium,
    #[serde(rename = "ACCEPTABLE")]
    #[strum(serialize = "ACCEPTABLE")]
    Acceptable,
}

/// Where a training sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SampleSource {
    Manual,
    Correction,
    ActiveLearning,
}

/// Lifecycle of a retraining job. The stage states double as the state
/// machine: a job advances through the three fine-tuning stages in order,
/// and `Failed` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Stage1FeatureExtraction,
    Stage2PartialFinetune,
    Stage3FullFinetune,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Stage index for progress display: 0 while queued, 1..=3 during the
    /// fine-tuning stages. Terminal states keep the last stage they ran in
    /// on the job record instead.
    pub fn stage_index(&self) -> Option<u32> {
        match self {
            JobStatus::Queued => Some(0),
            JobStatus::Stage1FeatureExtraction => Some(1),
            JobStatus::Stage2PartialFinetune => Some(2),
            JobStatus::Stage3FullFinetune => Some(3),
            JobStatus::Completed | JobStatus::Failed => None,
        }
    }
}

/// Summary of the winning class for one inference call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSummary {
    pub class_id: usize,
    pub class_code: String,
    pub class_name: String,
    pub confidence: f32,
    pub is_defect: bool,
    pub severity: Severity,
}

/// One entry of the per-class probability vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassProbability {
    pub class_id: usize,
    pub class_code: String,
    pub class_name: String,
    pub probability: f32,
}

/// A connected high-activation region of the importance map, reported in
/// input-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionReport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub area_px: usize,
    pub coverage_ratio: f32,
    pub mean_intensity: f32,
    pub centroid_x: f32,
    pub centroid_y: f32,
}

/// The full explanation handed to external collaborators. Image maps travel
/// as embedded base64 PNGs, never as raw arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplanationPayload {
    pub prediction: PredictionSummary,
    pub probabilities: Vec<ClassProbability>,
    pub heatmap_png_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_png_base64: Option<String>,
    /// True when the heatmap is the confidence-weighted fallback rather than
    /// a true gradient attribution.
    pub synthetic: bool,
    pub regions: Vec<RegionReport>,
    pub location_description: String,
    pub rationale: String,
    pub recommendation: String,
}
