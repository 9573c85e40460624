//! Compositing deep pixels into flat RGBA values.
//!
//! This is the classic front-to-back *over* operator: walking the samples
//! from near to far, each sample contributes its premultiplied color weighted
//! by the transparency accumulated so far. Samples behind an effectively
//! opaque accumulation contribute nothing and are skipped entirely.

use crate::image::{DeepImage, FlatImage};
use crate::row::DeepRow;
use crate::sample::DeepSample;

/// Accumulated alpha at or above this threshold counts as fully opaque:
/// flattening stops early and reports an alpha of exactly one.
pub const FULL_OPACITY_THRESHOLD: f32 = 0.9999;


/// Composite a depth-ordered pixel into a single premultiplied RGBA value.
///
/// For each sample from front to back:
/// ```text
/// output_color += sample_color * (1 - output_alpha)
/// output_alpha += sample_alpha * (1 - output_alpha)
/// ```
///
/// An empty pixel yields transparent black. The accumulated alpha never
/// exceeds one. Once the accumulation reaches [`FULL_OPACITY_THRESHOLD`],
/// the alpha is clamped to exactly one and the remaining samples are ignored,
/// so a fully occluded background contributes nothing.
pub fn flatten_pixel(samples: &[DeepSample]) -> [f32; 4] {
    let mut output = [0.0_f32; 4];

    for sample in samples {
        let transparency = 1.0 - output[3];

        output[0] += sample.r * transparency;
        output[1] += sample.g * transparency;
        output[2] += sample.b * transparency;
        output[3] += sample.a * transparency;

        if output[3] >= FULL_OPACITY_THRESHOLD {
            output[3] = 1.0;
            break;
        }
    }

    output
}

/// Composite a pixel like [`flatten_pixel`], then divide the color channels
/// by the resulting alpha. Useful for display sinks that expect
/// unpremultiplied (straight) color. A pixel with nearly no coverage
/// yields black.
pub fn flatten_pixel_unpremultiplied(samples: &[DeepSample]) -> [f32; 4] {
    let [red, green, blue, alpha] = flatten_pixel(samples);

    if alpha > 1e-4 { [red / alpha, green / alpha, blue / alpha, alpha] }
    else { [0.0, 0.0, 0.0, alpha] }
}

/// Flatten every pixel of a merged row into an interleaved RGBA slice of
/// length `width * 4`.
pub fn flatten_row(row: &DeepRow, output: &mut [f32]) {
    debug_assert_eq!(output.len(), row.width() * 4);

    for (x, pixel) in output.chunks_exact_mut(4).enumerate() {
        pixel.copy_from_slice(&flatten_pixel(row.pixel_data(x)));
    }
}

/// Flatten a whole merged deep image into an RGBA raster,
/// processing the scanlines in parallel.
#[cfg(feature = "rayon")]
pub fn flatten_image(image: &DeepImage) -> FlatImage {
    use rayon::prelude::*;

    let resolution = image.resolution();
    let width = resolution.x();
    let mut data = vec![0.0_f32; resolution.area() * 4];

    data.par_chunks_exact_mut(width.max(1) * 4)
        .enumerate()
        .for_each(|(y, row_output)| {
            for (x, pixel) in row_output.chunks_exact_mut(4).enumerate() {
                pixel.copy_from_slice(&flatten_pixel(image.pixel(x, y)));
            }
        });

    FlatImage { resolution, data }
}

/// Flatten a whole merged deep image into an RGBA raster.
#[cfg(not(feature = "rayon"))]
pub fn flatten_image(image: &DeepImage) -> FlatImage {
    let resolution = image.resolution();
    let mut data = vec![0.0_f32; resolution.area() * 4];

    for y in 0 .. resolution.y() {
        for x in 0 .. resolution.x() {
            let offset = (y * resolution.x() + x) * 4;
            data[offset .. offset + 4].copy_from_slice(&flatten_pixel(image.pixel(x, y)));
        }
    }

    FlatImage { resolution, data }
}
