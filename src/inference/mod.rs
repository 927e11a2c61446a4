//! Leaf-disease classification.
//!
//! Two interchangeable networks sit behind the [`Classifier`] trait. The registry in
//! [`Classifiers`] is built once at startup and shared read-only with the handlers.

mod checkpoint;
pub mod classifier;
pub mod efficientnet;
pub mod labels;
pub mod preprocess;
mod shape;
pub mod vit;

use std::{fmt, str::FromStr, sync::Arc};

use burn::{
    backend::ndarray::NdArrayDevice,
    module::Module,
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ModelConfig;
use classifier::{BurnClassifier, InferenceBackend};
use efficientnet::{EfficientNetConfig, EfficientNetV2};
use vit::{VisionTransformer, VitConfig};

/// A network mapping a `[batch, 3, H, W]` image batch to `[batch, classes]` raw scores.
pub trait Network<B: Backend>: Module<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("invalid image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("inference failed: {0}")]
    Tensor(String),

    #[error("model lock poisoned")]
    Poisoned,

    #[error("inference task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub plant_name: String,
    pub disease_name: String,
    pub confidence: f64,
}

impl Prediction {
    /// Pick the most probable class out of a softmax distribution.
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self, ClassifierError> {
        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .ok_or_else(|| ClassifierError::Tensor("empty probability vector".into()))?;
        let label = labels::class_name(index)
            .ok_or_else(|| ClassifierError::Tensor(format!("class index {index} out of range")))?;
        let (plant, disease) = labels::split_label(label);
        Ok(Self {
            plant_name: plant.to_string(),
            disease_name: disease.to_string(),
            confidence: f64::from(confidence),
        })
    }
}

pub trait Classifier: Send + Sync {
    fn classify(&self, image: &[u8]) -> Result<Prediction, ClassifierError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelVariant {
    #[default]
    Vit,
    EfficientNet,
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelVariant::Vit => "vit",
            ModelVariant::EfficientNet => "efficientnet",
        })
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vit" => Ok(ModelVariant::Vit),
            "efficientnet" => Ok(ModelVariant::EfficientNet),
            other => Err(format!("unknown model_type `{other}`")),
        }
    }
}

/// Loaded classifiers. The primary ViT is always present; the secondary may be missing.
#[derive(Clone)]
pub struct Classifiers {
    vit: Arc<dyn Classifier>,
    efficientnet: Option<Arc<dyn Classifier>>,
}

impl Classifiers {
    pub fn new(vit: Arc<dyn Classifier>, efficientnet: Option<Arc<dyn Classifier>>) -> Self {
        Self { vit, efficientnet }
    }

    pub fn get(&self, variant: ModelVariant) -> Option<Arc<dyn Classifier>> {
        match variant {
            ModelVariant::Vit => Some(self.vit.clone()),
            ModelVariant::EfficientNet => self.efficientnet.clone(),
        }
    }

    /// Load both variants with the production architectures.
    pub fn load(config: &ModelConfig) -> anyhow::Result<Self> {
        Self::load_with(config, &VitConfig::new(), &EfficientNetConfig::new())
    }

    /// Load both variants. A primary failure aborts; a secondary failure is logged and leaves
    /// that variant unavailable.
    pub fn load_with(
        config: &ModelConfig,
        vit_config: &VitConfig,
        eff_config: &EfficientNetConfig,
    ) -> anyhow::Result<Self> {
        let device = NdArrayDevice::default();

        let vit = VisionTransformer::<InferenceBackend>::from_checkpoint(
            vit_config,
            &config.vit_path,
            &device,
        )?;
        info!(path = %config.vit_path.display(), "vit model loaded");
        let vit: Arc<dyn Classifier> = Arc::new(BurnClassifier::new(
            ModelVariant::Vit,
            vit,
            vit_config.image_size,
            device.clone(),
        ));

        let efficientnet = match EfficientNetV2::<InferenceBackend>::from_checkpoint(
            eff_config,
            &config.efficientnet_path,
            &device,
        ) {
            Ok(model) => {
                info!(path = %config.efficientnet_path.display(), "efficientnet model loaded");
                Some(Arc::new(BurnClassifier::new(
                    ModelVariant::EfficientNet,
                    model,
                    eff_config.image_size,
                    device,
                )) as Arc<dyn Classifier>)
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "efficientnet model unavailable");
                None
            }
        };

        Ok(Self::new(vit, efficientnet))
    }
}

/// Run a classifier on the blocking pool so the forward pass does not stall async workers.
pub async fn classify_blocking(
    classifier: Arc<dyn Classifier>,
    image: bytes::Bytes,
) -> Result<Prediction, ClassifierError> {
    tokio::task::spawn_blocking(move || classifier.classify(&image))
        .await
        .map_err(|e| ClassifierError::Worker(e.to_string()))?
}
