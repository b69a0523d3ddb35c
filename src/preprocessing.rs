use image::{GrayImage, RgbImage};
use ndarray::Array;

use crate::error::{KneegradeError, Result};

/// Fixed spatial resolution expected by the classifier backbone.
pub const MODEL_INPUT_SIZE: u32 = 224;

/// ImageNet per-channel means in BGR order, matching the caffe-style
/// `preprocess_input` convention the pretrained ResNet50 weights expect
/// (channel swap to BGR plus mean subtraction, no std scaling).
const IMAGENET_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// Output of radiograph preprocessing.
#[derive(Debug)]
pub struct PreprocessedImage {
    /// Normalized model input, shape [1, 224, 224, 3] (NHWC, BGR channels).
    pub tensor: Array<f32, ndarray::IxDyn>,
    /// Histogram-equalized RGB image on the model's 224x224 canvas.
    ///
    /// The overlay is composited onto this image. It deliberately shares the
    /// model input's resolution: rendering the heatmap against any other
    /// canvas would misregister it relative to what the model saw.
    pub display: RgbImage,
    /// Decoded single-channel radiograph at native resolution, before
    /// equalization. Re-encoded to PNG for the archived original artifact.
    pub source_gray: GrayImage,
}

/// Decode and normalize an uploaded radiograph for inference.
///
/// Fixed step order: decode to grayscale, histogram-equalize, replicate to
/// three channels, resize to the model resolution, convert to f32 and apply
/// the backbone's input normalization. Changing this order breaks numerical
/// parity with the saved weights.
pub fn preprocess_radiograph(raw_bytes: &[u8]) -> Result<PreprocessedImage> {
    let decoded = image::load_from_memory(raw_bytes)
        .map_err(|e| KneegradeError::Decode(e.to_string()))?;
    let source_gray = decoded.to_luma8();

    let equalized = imageproc::contrast::equalize_histogram(&source_gray);
    let rgb = replicate_to_rgb(&equalized);

    let display = image::imageops::resize(
        &rgb,
        MODEL_INPUT_SIZE,
        MODEL_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );

    let tensor = normalize_for_backbone(&display)?;

    Ok(PreprocessedImage {
        tensor,
        display,
        source_gray,
    })
}

/// Expand a grayscale image to RGB by channel replication.
fn replicate_to_rgb(gray: &GrayImage) -> RgbImage {
    let (width, height) = gray.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let v = gray.get_pixel(x, y)[0];
        image::Rgb([v, v, v])
    })
}

/// Convert an RGB display image into the normalized NHWC model input.
fn normalize_for_backbone(display: &RgbImage) -> Result<Array<f32, ndarray::IxDyn>> {
    let size = MODEL_INPUT_SIZE as usize;
    let mut input_data = Vec::with_capacity(size * size * 3);

    // NHWC order; channels flipped RGB -> BGR before mean subtraction.
    for y in 0..MODEL_INPUT_SIZE {
        for x in 0..MODEL_INPUT_SIZE {
            let pixel = display.get_pixel(x, y);
            for c in 0..3 {
                let value = pixel[2 - c] as f32;
                input_data.push(value - IMAGENET_MEAN_BGR[c]);
            }
        }
    }

    Array::from_shape_vec(ndarray::IxDyn(&[1, size, size, 3]), input_data)
        .map_err(|e| KneegradeError::Internal(e.to_string()))
}

/// Encode a grayscale image as PNG bytes.
pub fn encode_png_gray(img: &GrayImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image::DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gradient_png(width: u32, height: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(width, height, |x, y| Luma([((x + y) % 256) as u8]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        bytes
    }

    #[test]
    fn test_tensor_shape_and_display_canvas() {
        let bytes = gradient_png(300, 300);
        let pre = preprocess_radiograph(&bytes).unwrap();

        assert_eq!(pre.tensor.shape(), &[1, 224, 224, 3]);
        assert_eq!(pre.display.dimensions(), (224, 224));
        assert_eq!(pre.source_gray.dimensions(), (300, 300));
    }

    #[test]
    fn test_normalization_subtracts_bgr_means() {
        let bytes = gradient_png(64, 64);
        let pre = preprocess_radiograph(&bytes).unwrap();

        // Channels are replicated from grayscale, so after the BGR swap and
        // mean subtraction each channel differs only by its mean.
        for y in 0..4 {
            for x in 0..4 {
                let b = pre.tensor[[0, y, x, 0]];
                let g = pre.tensor[[0, y, x, 1]];
                let r = pre.tensor[[0, y, x, 2]];
                assert!((b + 103.939 - (g + 116.779)).abs() < 1e-4);
                assert!((g + 116.779 - (r + 123.68)).abs() < 1e-4);
                // Raw pixel values stay within 8-bit range.
                let raw = b + 103.939;
                assert!((0.0..=255.0).contains(&raw));
            }
        }
    }

    #[test]
    fn test_equalization_preserves_intensity_order() {
        let bytes = gradient_png(64, 64);
        let pre = preprocess_radiograph(&bytes).unwrap();

        // Histogram equalization is a monotone remapping: a darker source
        // pixel never becomes brighter than a lighter one.
        let dark = pre.display.get_pixel(0, 0)[0];
        let bright = pre.display.get_pixel(100, 100)[0];
        assert!(dark <= bright);
    }

    #[test]
    fn test_invalid_bytes_fail_with_decode_error() {
        let result = preprocess_radiograph(b"definitely not an image");
        match result {
            Err(KneegradeError::Decode(_)) => {}
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_gray_png_round_trip() {
        let img = GrayImage::from_fn(10, 10, |x, _| Luma([(x * 20) as u8]));
        let bytes = encode_png_gray(&img).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (10, 10));
        assert_eq!(decoded.get_pixel(3, 0)[0], 60);
    }
}
