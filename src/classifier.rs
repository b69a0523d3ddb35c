use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};
use ndarray::{Array, Array1, Array2, Array3, ArrayView1, ArrayView3, Axis, Ix4};
use ort::{execution_providers::CPUExecutionProvider, session::Session, value::Value};
use serde::{Deserialize, Serialize};

use crate::color_utils::symbols;
use crate::error::{KneegradeError, Result};
use crate::gradcam;
use crate::object_store::ObjectStore;
use crate::severity::SeverityGrade;

/// Name of the backbone graph output carrying the last convolutional
/// activation map. Grad-CAM is anchored to this layer; a bundle whose graph
/// does not expose it is unusable for the visual explanation deliverable.
pub const LAST_CONV_LAYER: &str = "conv5_block3_out";

/// Name of the backbone graph input.
pub const INPUT_TENSOR_NAME: &str = "input_image";

/// File names inside a model bundle directory or store prefix.
pub const BACKBONE_FILE: &str = "backbone.onnx";
pub const HEAD_FILE: &str = "head.json";

/// Serialized classification head artifact (`head.json`).
///
/// `weight` is row-major [channels][classes]; together with the bias it
/// defines the dense layer applied after global average pooling.
#[derive(Deserialize)]
struct HeadArtifact {
    weight: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

/// The classification head: global average pool, dense layer, softmax.
///
/// Kept outside the ONNX graph so the class-score gradient with respect to
/// the convolutional activations can be evaluated in closed form (see
/// `gradcam`).
pub struct ClassifierHead {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl ClassifierHead {
    /// Build a head from a dense weight matrix [channels, classes] and bias
    /// [classes].
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<ClassifierHead> {
        if weight.nrows() == 0 {
            return Err(KneegradeError::ModelNotLoaded(
                "head has an empty weight matrix".into(),
            ));
        }
        if weight.ncols() != bias.len() {
            return Err(KneegradeError::ModelNotLoaded(format!(
                "head weight has {} classes but bias has {}",
                weight.ncols(),
                bias.len()
            )));
        }
        Ok(ClassifierHead { weight, bias })
    }

    fn from_artifact(artifact: HeadArtifact) -> Result<ClassifierHead> {
        let channels = artifact.weight.len();
        if channels == 0 {
            return Err(KneegradeError::ModelNotLoaded(
                "head artifact has an empty weight matrix".into(),
            ));
        }
        let classes = artifact.bias.len();
        if classes != SeverityGrade::COUNT {
            return Err(KneegradeError::ModelNotLoaded(format!(
                "head artifact has {classes} classes, expected {}",
                SeverityGrade::COUNT
            )));
        }

        let mut flat = Vec::with_capacity(channels * classes);
        for row in &artifact.weight {
            if row.len() != classes {
                return Err(KneegradeError::ModelNotLoaded(format!(
                    "head weight row has {} entries, expected {classes}",
                    row.len()
                )));
            }
            flat.extend_from_slice(row);
        }

        let weight = Array2::from_shape_vec((channels, classes), flat)
            .map_err(|e| KneegradeError::ModelNotLoaded(e.to_string()))?;
        let bias = Array1::from_vec(artifact.bias);

        ClassifierHead::new(weight, bias)
    }

    /// Number of feature channels expected from the backbone.
    pub fn channels(&self) -> usize {
        self.weight.nrows()
    }

    pub fn class_count(&self) -> usize {
        self.weight.ncols()
    }

    /// Dense weight matrix, [channels, classes].
    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Forward pass over a conv activation map [H, W, C]: global average
    /// pool, dense layer, softmax. Returns class probabilities.
    pub fn forward(&self, features: &ArrayView3<f32>) -> Result<Array1<f32>> {
        let (h, w, c) = features.dim();
        if c != self.channels() {
            return Err(KneegradeError::Saliency(format!(
                "feature map has {c} channels, head expects {}",
                self.channels()
            )));
        }

        let spatial = (h * w) as f32;
        let pooled = features.sum_axis(Axis(0)).sum_axis(Axis(0)) / spatial;
        let logits = pooled.dot(&self.weight) + &self.bias;
        Ok(softmax(&logits))
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|z| (z - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Argmax with deterministic lowest-index tie-break, plus the max value.
pub fn argmax_confidence(probabilities: &ArrayView1<f32>) -> (usize, f32) {
    let mut best_index = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &p) in probabilities.iter().enumerate() {
        if p > best_value {
            best_value = p;
            best_index = i;
        }
    }
    (best_index, best_value)
}

/// Provenance and shape information about a loaded bundle.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub source: String,
    pub backbone_size_bytes: usize,
    pub backbone_checksum: String,
    pub feature_channels: usize,
    pub class_count: usize,
}

/// One forward pass: the last conv activation map and the class distribution
/// derived from it. Both are needed to produce a prediction plus its
/// Grad-CAM explanation from a single inference.
pub struct ForwardPass {
    /// Activation map of `LAST_CONV_LAYER`, shape [H, W, C].
    pub features: Array3<f32>,
    /// Softmax class probabilities.
    pub probabilities: Array1<f32>,
}

/// The loaded classifier: ONNX backbone plus dense head.
///
/// Constructed once at startup and shared read-only (`Arc<Classifier>`)
/// across request workers; there is no mutator, so concurrent use cannot
/// perturb the weights. The ONNX session itself requires `&mut` to run, so
/// it sits behind a mutex; everything outside the raw forward pass runs
/// lock-free with per-call buffers.
pub struct Classifier {
    session: Mutex<Session>,
    head: ClassifierHead,
    info: ModelInfo,
}

impl Classifier {
    /// Load a bundle from a local directory containing `backbone.onnx` and
    /// `head.json`. Missing or unreadable files fail here, at startup,
    /// before any traffic is served.
    pub fn load_from_dir(dir: &Path) -> Result<Classifier> {
        let backbone_path = dir.join(BACKBONE_FILE);
        let head_path = dir.join(HEAD_FILE);

        let backbone_bytes = std::fs::read(&backbone_path).map_err(|e| {
            KneegradeError::ModelNotLoaded(format!("{}: {e}", backbone_path.display()))
        })?;
        let head_bytes = std::fs::read(&head_path).map_err(|e| {
            KneegradeError::ModelNotLoaded(format!("{}: {e}", head_path.display()))
        })?;

        Classifier::from_parts(backbone_bytes, &head_bytes, dir.display().to_string())
    }

    /// Load a bundle through the object store, the way the deployment keeps
    /// its weights next to the radiograph archive.
    pub fn load_from_store<S: ObjectStore>(store: &S, prefix: &str) -> Result<Classifier> {
        let backbone_path = format!("{prefix}/{BACKBONE_FILE}");
        let head_path = format!("{prefix}/{HEAD_FILE}");

        let backbone_bytes = store
            .download(&backbone_path)
            .map_err(|e| KneegradeError::ModelNotLoaded(format!("{backbone_path}: {e}")))?;
        let head_bytes = store
            .download(&head_path)
            .map_err(|e| KneegradeError::ModelNotLoaded(format!("{head_path}: {e}")))?;

        Classifier::from_parts(backbone_bytes, &head_bytes, format!("store:{prefix}"))
    }

    fn from_parts(backbone_bytes: Vec<u8>, head_bytes: &[u8], source: String) -> Result<Classifier> {
        let artifact: HeadArtifact = serde_json::from_slice(head_bytes)
            .map_err(|e| KneegradeError::ModelNotLoaded(format!("head artifact: {e}")))?;
        let head = ClassifierHead::from_artifact(artifact)?;

        let checksum = format!("{:x}", md5::compute(&backbone_bytes));

        let session = Session::builder()
            .map_err(|e| KneegradeError::ModelNotLoaded(format!("session builder: {e}")))?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(|e| KneegradeError::ModelNotLoaded(format!("execution providers: {e}")))?
            .commit_from_memory(&backbone_bytes)
            .map_err(|e| KneegradeError::ModelNotLoaded(format!("backbone graph: {e}")))?;

        // The visual explanation is a required deliverable, so a backbone
        // that does not expose the designated conv layer is rejected up
        // front rather than failing on the first prediction.
        if !session.outputs.iter().any(|o| o.name == LAST_CONV_LAYER) {
            return Err(KneegradeError::Saliency(format!(
                "backbone graph has no output named '{LAST_CONV_LAYER}'"
            )));
        }

        let info = ModelInfo {
            source,
            backbone_size_bytes: backbone_bytes.len(),
            backbone_checksum: checksum,
            feature_channels: head.channels(),
            class_count: head.class_count(),
        };

        info!(
            "{} Model loaded from {} ({} bytes, md5 {})",
            symbols::model_loaded(),
            info.source,
            info.backbone_size_bytes,
            info.backbone_checksum
        );

        Ok(Classifier {
            session: Mutex::new(session),
            head,
            info,
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    /// Run the backbone and head over a preprocessed input tensor
    /// [1, 224, 224, 3].
    pub fn forward(&self, tensor: &Array<f32, ndarray::IxDyn>) -> Result<ForwardPass> {
        let input_value = Value::from_array(tensor.clone())
            .map_err(|e| KneegradeError::Internal(format!("input tensor: {e}")))?;

        let features = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| KneegradeError::Internal("model session poisoned".into()))?;
            let outputs = session
                .run(ort::inputs![INPUT_TENSOR_NAME => &input_value])
                .map_err(|e| KneegradeError::Internal(format!("inference failed: {e}")))?;

            let view = outputs[LAST_CONV_LAYER]
                .try_extract_array::<f32>()
                .map_err(|e| KneegradeError::Saliency(format!("extract {LAST_CONV_LAYER}: {e}")))?;
            Array::from_shape_vec(view.shape().to_vec(), view.iter().cloned().collect())
                .map_err(|e| KneegradeError::Saliency(e.to_string()))?
        };

        let features = squeeze_batch(features)?;
        debug!(
            "{} Conv features: {:?}",
            symbols::checking(),
            features.dim()
        );

        let probabilities = self.head.forward(&features.view())?;
        Ok(ForwardPass {
            features,
            probabilities,
        })
    }

    /// Predict the severity class and its confidence for a preprocessed
    /// input tensor. Pure inference, deterministic for fixed input.
    pub fn predict(&self, tensor: &Array<f32, ndarray::IxDyn>) -> Result<(usize, f32)> {
        let pass = self.forward(tensor)?;
        Ok(argmax_confidence(&pass.probabilities.view()))
    }

    /// Compute the Grad-CAM heatmap for the given class, at the spatial
    /// resolution of the last conv layer, normalized to [0, 1].
    pub fn saliency(
        &self,
        tensor: &Array<f32, ndarray::IxDyn>,
        class_index: usize,
    ) -> Result<Array2<f32>> {
        let pass = self.forward(tensor)?;
        gradcam::gradcam_heatmap(
            &pass.features,
            &self.head,
            &pass.probabilities.view(),
            class_index,
        )
    }
}

/// Drop the leading batch dimension of a [1, H, W, C] activation map.
fn squeeze_batch(features: Array<f32, ndarray::IxDyn>) -> Result<Array3<f32>> {
    let features = features.into_dimensionality::<Ix4>().map_err(|e| {
        KneegradeError::Saliency(format!("unexpected activation shape: {e}"))
    })?;
    if features.shape()[0] != 1 {
        return Err(KneegradeError::Saliency(format!(
            "expected batch size 1, got {}",
            features.shape()[0]
        )));
    }
    Ok(features.index_axis(Axis(0), 0).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array3};

    fn toy_head(channels: usize, classes: usize) -> ClassifierHead {
        let weight = Array2::from_shape_fn((channels, classes), |(c, k)| {
            ((c + 1) as f32) * 0.1 - (k as f32) * 0.05
        });
        let bias = Array1::from_elem(classes, 0.0);
        ClassifierHead::new(weight, bias).unwrap()
    }

    #[test]
    fn test_softmax_is_well_formed() {
        let probs = softmax(&arr1(&[1.0, 2.0, 3.0, 4.0, 5.0]));
        let sum: f32 = probs.sum();
        assert!((sum - 1.0).abs() < 1e-6);
        for &p in probs.iter() {
            assert!((0.0..=1.0).contains(&p));
        }
        // Monotone in the logits.
        assert!(probs[4] > probs[0]);
    }

    #[test]
    fn test_softmax_handles_large_logits() {
        let probs = softmax(&arr1(&[1000.0, 1001.0]));
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_lowest_index_wins_ties() {
        let probs = arr1(&[0.2, 0.3, 0.3, 0.1, 0.1]);
        let (index, confidence) = argmax_confidence(&probs.view());
        assert_eq!(index, 1);
        assert!((confidence - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_head_forward_distribution() {
        let head = toy_head(4, 5);
        let features = Array3::from_shape_fn((2, 2, 4), |(h, w, c)| (h + w + c) as f32 * 0.5);
        let probs = head.forward(&features.view()).unwrap();

        assert_eq!(probs.len(), 5);
        assert!((probs.sum() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_head_forward_rejects_channel_mismatch() {
        let head = toy_head(4, 5);
        let features = Array3::<f32>::zeros((2, 2, 3));
        match head.forward(&features.view()) {
            Err(KneegradeError::Saliency(_)) => {}
            other => panic!("expected saliency error, got {other:?}"),
        }
    }

    #[test]
    fn test_head_artifact_validation() {
        let bad = HeadArtifact {
            weight: vec![vec![0.0; 4]; 8],
            bias: vec![0.0; 4],
        };
        assert!(matches!(
            ClassifierHead::from_artifact(bad),
            Err(KneegradeError::ModelNotLoaded(_))
        ));

        let ragged = HeadArtifact {
            weight: vec![vec![0.0; 5], vec![0.0; 4]],
            bias: vec![0.0; 5],
        };
        assert!(matches!(
            ClassifierHead::from_artifact(ragged),
            Err(KneegradeError::ModelNotLoaded(_))
        ));
    }
}
