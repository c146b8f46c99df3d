//! Pair-wise motion scoring of decimated frames.

use super::{ImageError, YcbcrImage};
use image::codecs::jpeg::JpegEncoder;
use image::GrayImage;
use std::f64::consts::PI;

/// Per-pixel luma differences below this value contribute nothing to the
/// score; sensor noise sits well under it.
pub const Y_DIFF_MIN_THRESHOLD: u8 = 20;

fn polarize(x: u8, y: u8) -> (f64, f64) {
    let xf = x as f64;
    let yf = y as f64;
    ((xf * xf + yf * yf).sqrt(), yf.atan2(xf))
}

fn check_pair(a: &YcbcrImage, b: &YcbcrImage) -> Result<(), ImageError> {
    if a.y_stride != b.y_stride {
        return Err(ImageError::Mismatch(format!(
            "y stride {} != {}",
            a.y_stride, b.y_stride
        )));
    }
    if a.c_stride != b.c_stride {
        return Err(ImageError::Mismatch(format!(
            "chroma stride {} != {}",
            a.c_stride, b.c_stride
        )));
    }
    if a.subsample != b.subsample {
        return Err(ImageError::Mismatch(format!(
            "subsample {:?} != {:?}",
            a.subsample, b.subsample
        )));
    }
    if (a.width, a.height) != (b.width, b.height) {
        return Err(ImageError::Mismatch(format!(
            "{}x{} != {}x{}",
            a.width, a.height, b.width, b.height
        )));
    }
    Ok(())
}

/// Two-channel difference score between decimated frames.
///
/// Luma: sum of per-pixel absolute differences at or above
/// [`Y_DIFF_MIN_THRESHOLD`], normalized by `255 * W * H`. Chroma: per-pixel
/// polar (Cb, Cr) distance, angle normalized by `2 pi` and radius by the
/// maximum chroma radius, averaged over the chroma plane. The angle term
/// uses the raw `|a - b|` difference without wrap-around folding.
///
/// Returns NaN for degenerate (zero-area chroma) inputs; callers treat NaN
/// as "no motion observed".
pub fn diff_score(a: &YcbcrImage, b: &YcbcrImage) -> Result<f64, ImageError> {
    check_pair(a, b)?;

    let mut y_diff: u64 = 0;
    for y in 0..a.height {
        let by = a.y_stride * y;
        for x in 0..a.width {
            let d = (a.y[by + x] as i32 - b.y[by + x] as i32).unsigned_abs();
            if d >= Y_DIFF_MIN_THRESHOLD as u32 {
                y_diff += d as u64;
            }
        }
    }
    let y_score = y_diff as f64 / (255.0 * (a.width * a.height) as f64);

    let cwidth = a.chroma_width();
    let cheight = a.chroma_height();
    let (r_max, _) = polarize(255, 255);
    let mut c_sum = 0.0;
    for y in 0..cheight {
        let by = a.c_stride * y;
        for x in 0..cwidth {
            let (ar, ath) = polarize(a.cb[by + x], a.cr[by + x]);
            let (br, bth) = polarize(b.cb[by + x], b.cr[by + x]);
            let mut cs = (ath - bth).abs() / (2.0 * PI);
            cs += (ar - br).abs() / r_max;
            c_sum += cs;
        }
    }
    let c_score = c_sum / (cheight * cwidth) as f64;

    Ok(y_score + c_score)
}

/// Renders the per-pixel luma delta between two decimated frames as an
/// 8-bit grayscale JPEG: flat `0x7f` below `thresh`, `0x7f + delta/2`
/// otherwise.
pub fn debug_diff_jpeg(a: &YcbcrImage, b: &YcbcrImage, thresh: u8) -> Result<Vec<u8>, ImageError> {
    check_pair(a, b)?;

    let mut out = GrayImage::new(a.width as u32, a.height as u32);
    for y in 0..a.height {
        let by = a.y_stride * y;
        for x in 0..a.width {
            let d = a.y[by + x] as i32 - b.y[by + x] as i32;
            let px = if d.abs() < thresh as i32 {
                0x7f
            } else {
                (0x7f + d / 2).clamp(0, 255) as u8
            };
            out.put_pixel(x as u32, y as u32, image::Luma([px]));
        }
    }

    encode_gray_jpeg(&out, 90)
}

fn encode_gray_jpeg(img: &GrayImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(img)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_proc::Subsample;
    use approx::assert_relative_eq;

    #[test]
    fn test_identical_images_score_zero() {
        let a = YcbcrImage::flat(16, 16, Subsample::Ratio420, 90, 100, 110);
        assert_relative_eq!(diff_score(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn test_score_is_symmetric() {
        let a = YcbcrImage::flat(16, 16, Subsample::Ratio420, 40, 100, 110);
        let b = YcbcrImage::flat(16, 16, Subsample::Ratio420, 200, 140, 80);
        let ab = diff_score(&a, &b).unwrap();
        let ba = diff_score(&b, &a).unwrap();
        assert_relative_eq!(ab, ba, epsilon = 1e-12);
        assert!(ab > 0.0);
    }

    #[test]
    fn test_black_vs_white_bounded_by_two() {
        let black = YcbcrImage::flat(32, 32, Subsample::Ratio444, 0, 128, 128);
        let white = YcbcrImage::flat(32, 32, Subsample::Ratio444, 255, 128, 128);
        let score = diff_score(&black, &white).unwrap();
        // Full-plane luma delta gives exactly 1.0; identical chroma adds 0.
        assert_relative_eq!(score, 1.0, epsilon = 1e-12);
        assert!(score <= 2.0);
    }

    #[test]
    fn test_luma_threshold_gates_small_deltas() {
        let a = YcbcrImage::flat(8, 8, Subsample::Ratio444, 100, 128, 128);
        let b = YcbcrImage::flat(8, 8, Subsample::Ratio444, 100 + Y_DIFF_MIN_THRESHOLD - 1, 128, 128);
        assert_relative_eq!(diff_score(&a, &b).unwrap(), 0.0);

        let c = YcbcrImage::flat(8, 8, Subsample::Ratio444, 100 + Y_DIFF_MIN_THRESHOLD, 128, 128);
        let expected = Y_DIFF_MIN_THRESHOLD as f64 / 255.0;
        assert_relative_eq!(diff_score(&a, &c).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_chroma_radius_term() {
        // Same angle (cb == cr), different radius.
        let a = YcbcrImage::flat(8, 8, Subsample::Ratio444, 100, 10, 10);
        let b = YcbcrImage::flat(8, 8, Subsample::Ratio444, 100, 200, 200);
        let r_max = (2.0f64 * 255.0 * 255.0).sqrt();
        let expected = (190.0f64 * 190.0 * 2.0).sqrt() / r_max;
        assert_relative_eq!(diff_score(&a, &b).unwrap(), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_chroma_angle_term() {
        // Radius equal, angle a quarter turn apart: pi/2 over 2 pi = 0.25.
        let a = YcbcrImage::flat(8, 8, Subsample::Ratio444, 100, 200, 0);
        let b = YcbcrImage::flat(8, 8, Subsample::Ratio444, 100, 0, 200);
        assert_relative_eq!(diff_score(&a, &b).unwrap(), 0.25, epsilon = 1e-9);
    }

    #[test]
    fn test_mismatched_geometry_fails() {
        let a = YcbcrImage::flat(16, 16, Subsample::Ratio420, 90, 100, 110);
        let b = YcbcrImage::flat(16, 8, Subsample::Ratio420, 90, 100, 110);
        assert!(matches!(diff_score(&a, &b), Err(ImageError::Mismatch(_))));

        let c = YcbcrImage::flat(16, 16, Subsample::Ratio444, 90, 100, 110);
        assert!(matches!(diff_score(&a, &c), Err(ImageError::Mismatch(_))));
    }

    #[test]
    fn test_debug_diff_renders_midgray_for_identical() {
        let a = YcbcrImage::flat(16, 16, Subsample::Ratio444, 90, 128, 128);
        let blob = debug_diff_jpeg(&a, &a, Y_DIFF_MIN_THRESHOLD).unwrap();
        assert_eq!(&blob[0..2], &[0xff, 0xd8]);

        // Decoding back should give a flat mid-gray image.
        let decoded = image::load_from_memory(&blob).unwrap().to_luma8();
        let center = decoded.get_pixel(8, 8).0[0];
        assert!((center as i16 - 0x7f).abs() <= 3, "center {center}");
    }

    #[test]
    fn test_debug_diff_highlights_delta() {
        let a = YcbcrImage::flat(16, 16, Subsample::Ratio444, 40, 128, 128);
        let b = YcbcrImage::flat(16, 16, Subsample::Ratio444, 200, 128, 128);
        // a - b = -160 -> 0x7f - 80 = 47
        let blob = debug_diff_jpeg(&a, &b, 20).unwrap();
        let decoded = image::load_from_memory(&blob).unwrap().to_luma8();
        let center = decoded.get_pixel(8, 8).0[0];
        assert!((center as i16 - 47).abs() <= 3, "center {center}");
    }
}
