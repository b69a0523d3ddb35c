//! Grad-CAM heatmap computation.
//!
//! Produces the class-conditional spatial importance map from the last conv
//! layer's activations. The classifier head is global-average-pool, dense,
//! softmax, so the gradient of the selected class probability with respect
//! to an activation has the closed form
//!
//! ```text
//! d p_k / d A[h,w,c] = (p_k / (H*W)) * (W[c,k] - sum_j W[c,j] * p_j)
//! ```
//!
//! which is constant over (h, w); the spatial average of the gradient is
//! therefore that same value per channel. The weighting order is fixed:
//! spatially averaged gradients become per-channel weights, the weighted
//! channel sum is rectified, then the map is normalized by its maximum.

use ndarray::{Array1, Array2, Array3, ArrayView1};

use crate::classifier::ClassifierHead;
use crate::error::{KneegradeError, Result};

/// Compute the Grad-CAM heatmap for `class_index` over the activation map
/// `features` [H, W, C]. The result is [H, W] in [0, 1]; a degenerate
/// all-zero rectified map stays all-zero instead of dividing by zero.
pub fn gradcam_heatmap(
    features: &Array3<f32>,
    head: &ClassifierHead,
    probabilities: &ArrayView1<f32>,
    class_index: usize,
) -> Result<Array2<f32>> {
    let (height, width, channels) = features.dim();
    if channels != head.channels() {
        return Err(KneegradeError::Saliency(format!(
            "activation map has {channels} channels, head expects {}",
            head.channels()
        )));
    }
    if class_index >= probabilities.len() {
        return Err(KneegradeError::Saliency(format!(
            "class index {class_index} out of range for {} classes",
            probabilities.len()
        )));
    }

    let channel_weights = pooled_gradients(head, probabilities, class_index, height * width);

    let mut heatmap = Array2::<f32>::zeros((height, width));
    for h in 0..height {
        for w in 0..width {
            let mut acc = 0.0f32;
            for c in 0..channels {
                acc += channel_weights[c] * features[[h, w, c]];
            }
            heatmap[[h, w]] = acc.max(0.0);
        }
    }

    let max = heatmap.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        heatmap.mapv_inplace(|v| v / max);
    }
    Ok(heatmap)
}

/// Spatially averaged gradient of the class probability per channel.
///
/// `spatial` is H*W of the activation map; the softmax Jacobian row for the
/// selected class contracts the dense weights into one weight per channel.
fn pooled_gradients(
    head: &ClassifierHead,
    probabilities: &ArrayView1<f32>,
    class_index: usize,
    spatial: usize,
) -> Array1<f32> {
    let weight = head.weight();
    let p_k = probabilities[class_index];
    let scale = p_k / spatial as f32;

    Array1::from_shape_fn(weight.nrows(), |c| {
        let mut expected = 0.0f32;
        for (j, &p_j) in probabilities.iter().enumerate() {
            expected += weight[[c, j]] * p_j;
        }
        scale * (weight[[c, class_index]] - expected)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array3};

    fn head(weight: Array2<f32>, bias: Array1<f32>) -> ClassifierHead {
        ClassifierHead::new(weight, bias).unwrap()
    }

    #[test]
    fn test_heatmap_range_and_max() {
        let w = arr2(&[[1.0, -1.0], [0.5, 0.2], [-0.3, 0.9]]);
        let head = head(w, arr1(&[0.0, 0.0]));
        let features = Array3::from_shape_fn((3, 3, 3), |(h, _, c)| (h + c) as f32 * 0.25);
        let probs = head.forward(&features.view()).unwrap();

        let map = gradcam_heatmap(&features, &head, &probs.view(), 0).unwrap();
        assert_eq!(map.dim(), (3, 3));
        let max = map.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
        for &v in map.iter() {
            assert!((0.0..=1.0).contains(&v));
            assert!(v.is_finite());
        }
    }

    #[test]
    fn test_degenerate_activations_yield_zero_map() {
        // With identical per-class weights the gradient is identically zero,
        // so the rectified map has max 0 and must come back all-zero rather
        // than NaN.
        let w = arr2(&[[0.4, 0.4], [0.1, 0.1]]);
        let head = head(w, arr1(&[0.0, 0.0]));
        let features = Array3::from_elem((2, 2, 2), 1.0);
        let probs = head.forward(&features.view()).unwrap();

        let map = gradcam_heatmap(&features, &head, &probs.view(), 1).unwrap();
        for &v in map.iter() {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn test_matches_hand_computed_reference() {
        // 1x2 spatial map, 2 channels, 2 classes; equal probabilities from a
        // symmetric head make the pooled gradients easy to verify by hand:
        //   p = [0.5, 0.5]
        //   w_c = (0.5/2) * (W[c,0] - 0.5*(W[c,0]+W[c,1]))
        //   w_0 = 0.25 * (1.0 - 0.5*(1.0 - 1.0)) = 0.25
        //   w_1 = 0.25 * (-1.0 - 0.5*(-1.0 + 1.0)) = -0.25
        // cam[0,0] = relu(0.25*2 + -0.25*1) = 0.25
        // cam[0,1] = relu(0.25*4 + -0.25*1) = 0.75
        // normalized: [1/3, 1.0]
        let w = arr2(&[[1.0, -1.0], [-1.0, 1.0]]);
        let head = head(w, arr1(&[0.0, 0.0]));
        let mut features = Array3::<f32>::zeros((1, 2, 2));
        features[[0, 0, 0]] = 2.0;
        features[[0, 0, 1]] = 1.0;
        features[[0, 1, 0]] = 4.0;
        features[[0, 1, 1]] = 1.0;

        let probs = arr1(&[0.5, 0.5]);
        let map = gradcam_heatmap(&features, &head, &probs.view(), 0).unwrap();

        assert!((map[[0, 0]] - 1.0 / 3.0).abs() < 1e-6);
        assert!((map[[0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_determinism() {
        let w = arr2(&[[0.3, -0.2], [-0.1, 0.5], [0.7, 0.1]]);
        let head = head(w, arr1(&[0.1, -0.1]));
        let features = Array3::from_shape_fn((4, 4, 3), |(h, w, c)| {
            ((h * 7 + w * 3 + c) % 11) as f32 * 0.1
        });
        let probs = head.forward(&features.view()).unwrap();

        let first = gradcam_heatmap(&features, &head, &probs.view(), 1).unwrap();
        let second = gradcam_heatmap(&features, &head, &probs.view(), 1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_out_of_range_class() {
        let w = arr2(&[[1.0, 0.0]]);
        let head = head(w, arr1(&[0.0, 0.0]));
        let features = Array3::<f32>::zeros((2, 2, 1));
        let probs = arr1(&[0.5, 0.5]);

        match gradcam_heatmap(&features, &head, &probs.view(), 7) {
            Err(KneegradeError::Saliency(_)) => {}
            other => panic!("expected saliency error, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_channel_mismatch() {
        let w = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let head = head(w, arr1(&[0.0, 0.0]));
        let features = Array3::<f32>::zeros((2, 2, 3));
        let probs = arr1(&[0.5, 0.5]);

        assert!(matches!(
            gradcam_heatmap(&features, &head, &probs.view(), 0),
            Err(KneegradeError::Saliency(_))
        ));
    }
}
