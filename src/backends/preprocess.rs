//! Image cleanup before local recognition.
//!
//! These are synchronous and CPU-heavy, so callers run them on the blocking
//! thread pool.

use image::{
    GrayImage, Luma,
    imageops::{self, FilterType},
};
use imageproc::{
    contrast::{ThresholdType, otsu_level, threshold},
    distance_transform::Norm,
    geometric_transformations::{Interpolation, rotate_about_center},
    morphology::close,
};

use crate::prelude::*;

/// Largest skew we try to correct, in degrees.
const MAX_SKEW_DEGREES: f32 = 10.0;

/// Step between candidate skew angles, in degrees.
const SKEW_STEP_DEGREES: f32 = 0.5;

/// Width of the thumbnail used to estimate skew.
const SKEW_SAMPLE_WIDTH: u32 = 800;

/// Load an image and convert it to a clean black-and-white page:
/// grayscale, a global Otsu threshold, then a 1-pixel closing to fill
/// speckle.
pub fn load_and_binarize(path: &Path) -> Result<GrayImage> {
    let gray = image::open(path)
        .with_context(|| format!("cannot open page image {:?}", path))?
        .into_luma8();
    Ok(binarize(&gray))
}

/// Binarize a grayscale page.
pub fn binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    trace!(level, "Otsu threshold");
    let binary = threshold(gray, level, ThresholdType::Binary);
    close(&binary, Norm::LInf, 1)
}

/// Rotate a page clockwise by a multiple of 90 degrees, as reported by
/// Tesseract's orientation detection.
pub fn rotate_clockwise(image: &GrayImage, degrees: u32) -> GrayImage {
    match degrees % 360 {
        90 => imageops::rotate90(image),
        180 => imageops::rotate180(image),
        270 => imageops::rotate270(image),
        _ => image.clone(),
    }
}

/// Estimate how far the text lines are tilted, in degrees.
///
/// We rotate a thumbnail through candidate angles and keep the one whose
/// row-by-row ink profile is sharpest. Straight text lines give tall peaks
/// separated by empty gaps.
pub fn estimate_skew(image: &GrayImage) -> f32 {
    let sample = if image.width() > SKEW_SAMPLE_WIDTH {
        let height = (u64::from(image.height()) * u64::from(SKEW_SAMPLE_WIDTH)
            / u64::from(image.width()))
        .max(1) as u32;
        imageops::resize(image, SKEW_SAMPLE_WIDTH, height, FilterType::Triangle)
    } else {
        image.clone()
    };

    let steps = (MAX_SKEW_DEGREES / SKEW_STEP_DEGREES) as i32;
    let mut best = (0.0f32, profile_sharpness(&sample));
    for step in -steps..=steps {
        if step == 0 {
            continue;
        }
        let angle = step as f32 * SKEW_STEP_DEGREES;
        let rotated = rotate(&sample, angle);
        let score = profile_sharpness(&rotated);
        if score > best.1 {
            best = (angle, score);
        }
    }
    best.0
}

/// Straighten a page by the estimated skew.
pub fn deskew(image: &GrayImage) -> GrayImage {
    let angle = estimate_skew(image);
    if angle == 0.0 {
        image.clone()
    } else {
        debug!(angle, "Deskewing page");
        rotate(image, angle)
    }
}

fn rotate(image: &GrayImage, degrees: f32) -> GrayImage {
    rotate_about_center(
        image,
        degrees.to_radians(),
        Interpolation::Nearest,
        Luma([255]),
    )
}

/// Sum of squared differences between the ink counts of adjacent rows.
fn profile_sharpness(image: &GrayImage) -> f64 {
    let rows = image
        .rows()
        .map(|row| row.filter(|px| px.0[0] < 128).count() as f64)
        .collect::<Vec<_>>();
    rows.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum()
}
