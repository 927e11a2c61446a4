use std::sync::Mutex;

use burn::{
    backend::{ndarray::NdArrayDevice, NdArray},
    tensor::activation::softmax,
};
use tracing::debug;

use super::{preprocess, ClassifierError, Classifier, ModelVariant, Network, Prediction};

/// CPU backend used for serving.
pub type InferenceBackend = NdArray<f32>;

/// A loaded burn network behind the [`Classifier`] contract.
pub struct BurnClassifier<M> {
    variant: ModelVariant,
    model: Mutex<M>,
    image_size: usize,
    device: NdArrayDevice,
}

impl<M: Network<InferenceBackend>> BurnClassifier<M> {
    pub fn new(variant: ModelVariant, model: M, image_size: usize, device: NdArrayDevice) -> Self {
        Self {
            variant,
            model: Mutex::new(model),
            image_size,
            device,
        }
    }
}

impl<M: Network<InferenceBackend>> Classifier for BurnClassifier<M> {
    fn classify(&self, image: &[u8]) -> Result<Prediction, ClassifierError> {
        let chw = preprocess::image_to_chw(image, self.image_size)?;
        let input = preprocess::to_batch::<InferenceBackend>(chw, self.image_size, &self.device);

        let logits = {
            let model = self.model.lock().map_err(|_| ClassifierError::Poisoned)?;
            model.forward(input)
        };
        let probabilities = softmax(logits, 1)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Tensor(format!("{e:?}")))?;

        let prediction = Prediction::from_probabilities(&probabilities)?;
        debug!(
            variant = %self.variant,
            plant = %prediction.plant_name,
            disease = %prediction.disease_name,
            confidence = prediction.confidence,
            "prediction"
        );
        Ok(prediction)
    }
}
