use super::network::{tensor_to_vec, ClassifierNetwork, ModelError};
use super::preprocess;
use crate::store::models::CustomCategory;
use lazy_static::lazy_static;
use log::debug;
use shared::Severity;
use std::sync::Arc;
use tch::{Kind, Tensor};

/// One row of the class table: stable id, short code, display name and the
/// static severity tier used by the explanation composer.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: usize,
    pub code: String,
    pub name: String,
    pub severity: Severity,
    pub is_defect: bool,
}

lazy_static! {
    /// Built-in weld defect classes. Structural-integrity defects are
    /// critical regardless of confidence; porosity is assessed against
    /// acceptance criteria; a clean weld is acceptable.
    pub static ref BASE_CLASSES: Vec<ClassInfo> = vec![
        ClassInfo {
            id: 0,
            code: "LP".to_string(),
            name: "Lack of Penetration".to_string(),
            severity: Severity::Critical,
            is_defect: true,
        },
        ClassInfo {
            id: 1,
            code: "PO".to_string(),
            name: "Porosity".to_string(),
            severity: Severity::Medium,
            is_defect: true,
        },
        ClassInfo {
            id: 2,
            code: "CR".to_string(),
            name: "Cracks".to_string(),
            severity: Severity::Critical,
            is_defect: true,
        },
        ClassInfo {
            id: 3,
            code: "ND".to_string(),
            name: "No Defect".to_string(),
            severity: Severity::Acceptable,
            is_defect: false,
        },
    ];
}

/// The class table the classifier resolves indices against: the built-in
/// classes plus any operator-defined categories appended after them.
#[derive(Debug, Clone)]
pub struct ClassRegistry {
    classes: Vec<ClassInfo>,
}

impl ClassRegistry {
    pub fn base() -> Self {
        Self {
            classes: BASE_CLASSES.clone(),
        }
    }

    pub fn with_custom(categories: &[CustomCategory]) -> Self {
        let mut classes = BASE_CLASSES.clone();
        for category in categories {
            if category.id < BASE_CLASSES.len() {
                continue; // base classes are fixed
            }
            classes.push(ClassInfo {
                id: category.id,
                code: category.code.clone(),
                name: category.name.clone(),
                severity: category.severity,
                is_defect: category.severity != Severity::Acceptable,
            });
        }
        classes.sort_by_key(|c| c.id);
        Self { classes }
    }

    pub fn get(&self, class_id: usize) -> Option<&ClassInfo> {
        self.classes.iter().find(|c| c.id == class_id)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter()
    }
}

/// Result of one inference call. Immutable; owned by the caller for the
/// duration of explanation generation.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub class_id: usize,
    pub class_code: String,
    pub class_name: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
    pub is_defect: bool,
    pub severity: Severity,
}

/// Thin classification wrapper around the network: preprocess, softmax,
/// argmax, class-table lookup.
#[derive(Clone)]
pub struct DefectClassifier {
    network: Arc<dyn ClassifierNetwork>,
    registry: ClassRegistry,
    input_size: u32,
}

impl DefectClassifier {
    pub fn new(network: Arc<dyn ClassifierNetwork>, registry: ClassRegistry, input_size: u32) -> Self {
        Self {
            network,
            registry,
            input_size,
        }
    }

    pub fn network(&self) -> &Arc<dyn ClassifierNetwork> {
        &self.network
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn classify(&self, image_data: &[u8]) -> Result<ClassificationResult, ModelError> {
        let (tensor, _, _) = preprocess::decode_to_tensor(image_data, self.input_size)?;
        self.classify_tensor(&tensor)
    }

    pub fn classify_tensor(&self, input: &Tensor) -> Result<ClassificationResult, ModelError> {
        let logits = tch::no_grad(|| self.network.forward(input))?;
        let probabilities = tensor_to_vec(&logits.f_softmax(-1, Kind::Float)?)?;
        self.result_from_probabilities(probabilities)
    }

    pub fn result_from_probabilities(
        &self,
        probabilities: Vec<f32>,
    ) -> Result<ClassificationResult, ModelError> {
        let (class_id, confidence) = argmax(&probabilities).ok_or(ModelError::EmptyOutput)?;
        let info = self
            .registry
            .get(class_id)
            .ok_or(ModelError::ClassOutOfRange(class_id, self.registry.len()))?;
        debug!(
            "Classified as {} ({}) with confidence {:.3}",
            info.name, info.code, confidence
        );
        Ok(ClassificationResult {
            class_id,
            class_code: info.code.clone(),
            class_name: info.name.clone(),
            confidence,
            probabilities,
            is_defect: info.is_defect,
            severity: info.severity,
        })
    }
}

fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
}
