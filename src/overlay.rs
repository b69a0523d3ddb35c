//! Heatmap overlay rendering: upscale the saliency map to the display
//! canvas, colorize it, and blend it over the equalized radiograph.

use image::{Rgb, RgbImage};
use ndarray::Array2;

use crate::error::{KneegradeError, Result};

/// Fixed blend weights. Diagnostic readability across studies depends on
/// every overlay using the same ratio, so these are constants, not knobs.
pub const DISPLAY_WEIGHT: f32 = 0.6;
pub const HEATMAP_WEIGHT: f32 = 0.4;

/// Bilinear interpolation sampling a 2D map at fractional coordinates.
pub fn bilinear_sample(data: &Array2<f32>, u: f32, v: f32) -> f32 {
    let (rows, cols) = data.dim();

    let u = u.clamp(0.0, (cols - 1) as f32);
    let v = v.clamp(0.0, (rows - 1) as f32);

    let u0 = u.floor() as usize;
    let v0 = v.floor() as usize;
    let u1 = (u0 + 1).min(cols - 1);
    let v1 = (v0 + 1).min(rows - 1);

    let fu = u - u0 as f32;
    let fv = v - v0 as f32;

    let val00 = data[[v0, u0]];
    let val10 = data[[v0, u1]];
    let val01 = data[[v1, u0]];
    let val11 = data[[v1, u1]];

    let val0 = val00 * (1.0 - fu) + val10 * fu;
    let val1 = val01 * (1.0 - fu) + val11 * fu;

    val0 * (1.0 - fv) + val1 * fv
}

// Jet colormap (approximation): dark blue -> cyan -> green -> yellow -> dark red
fn jet_colormap(t: f32) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0);
    let r = (1.5 - (4.0 * t - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * t - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * t - 1.0).abs()).clamp(0.0, 1.0);

    Rgb([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8])
}

/// Render the Grad-CAM overlay: resize the [0,1] heatmap to the display
/// image's dimensions, scale to 8-bit, colorize, and alpha-blend at the
/// fixed 0.6/0.4 ratio.
pub fn render_overlay(heatmap: &Array2<f32>, display: &RgbImage) -> Result<RgbImage> {
    let (rows, cols) = heatmap.dim();
    if rows == 0 || cols == 0 {
        return Err(KneegradeError::Saliency("empty heatmap".into()));
    }

    let (width, height) = display.dimensions();
    let mut out = RgbImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let u = (x as f32 / width as f32) * (cols - 1) as f32;
            let v = (y as f32 / height as f32) * (rows - 1) as f32;

            let intensity = (bilinear_sample(heatmap, u, v) * 255.0).round() / 255.0;
            let heat = jet_colormap(intensity);
            let base = display.get_pixel(x, y);

            let mut blended = [0u8; 3];
            for c in 0..3 {
                let value =
                    DISPLAY_WEIGHT * base[c] as f32 + HEATMAP_WEIGHT * heat[c] as f32;
                blended[c] = value.round().clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(x, y, Rgb(blended));
        }
    }

    Ok(out)
}

/// Encode an RGB image as PNG bytes for storage.
pub fn encode_png_rgb(img: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}
