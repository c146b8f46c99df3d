//! Integer-factor decimation by block averaging.

use super::YcbcrImage;

/// Approximate edge length of the small comparison image.
pub const SMALL_TARGET_SIZE: usize = 150;

/// Finds an integer divisor of the image geometry whose decimated edges
/// land closest to `target`.
///
/// A candidate must divide the width, the height, and every value in
/// `other` (strides, plane lengths, chroma dimensions); joint divisibility
/// is required so every plane decimates without remainder. Candidates are
/// scored by `|W/d - target| + |H/d - target|`; the first minimum wins and
/// the scan stops once the score starts rising.
fn find_divisor(width: usize, height: usize, other: &[usize], target: usize) -> usize {
    let mut best_i = 1;
    let mut best_d = target * 99;
    'candidates: for i in 1..50 {
        if width % i != 0 || height % i != 0 {
            continue;
        }
        for &x in other {
            if x % i != 0 {
                continue 'candidates;
            }
        }
        let d = (width / i).abs_diff(target) + (height / i).abs_diff(target);
        if d < best_d {
            best_d = d;
            best_i = i;
        } else if d > best_d {
            break;
        }
    }
    best_i
}

/// Decimates a planar YCbCr image to roughly `target` pixels per edge.
///
/// Each output pixel is the mean of a `d x d` input block (chroma blocks
/// scaled by the subsample factors), using truncating integer division.
/// The subsample ratio is preserved; output dimensions are `(W/d, H/d)`.
pub fn decimate(im: &YcbcrImage, target: usize) -> YcbcrImage {
    let (dx, dy) = im.subsample.factors();
    let cwidth = im.width / dx;
    let cheight = im.height / dy;
    let other = [
        im.y.len(),
        im.cb.len(),
        im.cr.len(),
        im.y_stride,
        im.c_stride,
        cheight,
        cwidth,
    ];
    let div = find_divisor(im.width, im.height, &other, target);

    let nw = im.width / div;
    let nh = im.height / div;
    let y_stride = im.y_stride / div;
    let c_stride = im.c_stride / div;
    let cnw = cwidth / div;
    let cnh = cheight / div;

    let mut out = YcbcrImage {
        y: vec![0; y_stride * nh],
        cb: vec![0; c_stride * cnh],
        cr: vec![0; c_stride * cnh],
        y_stride,
        c_stride,
        subsample: im.subsample,
        width: nw,
        height: nh,
    };

    let dd = div * div;

    let mut row_y = vec![0usize; nw];
    for y in 0..im.height {
        let by = im.y_stride * y;
        for x in 0..im.width {
            row_y[x / div] += im.y[by + x] as usize;
        }
        if (y + 1) % div == 0 {
            let oby = y_stride * (y / div);
            for (x, acc) in row_y.iter_mut().enumerate() {
                out.y[oby + x] = (*acc / dd) as u8;
                *acc = 0;
            }
        }
    }

    let mut row_cb = vec![0usize; cnw];
    let mut row_cr = vec![0usize; cnw];
    for y in 0..cheight {
        let by = im.c_stride * y;
        for x in 0..cwidth {
            row_cb[x / div] += im.cb[by + x] as usize;
            row_cr[x / div] += im.cr[by + x] as usize;
        }
        if (y + 1) % div == 0 {
            let oby = c_stride * (y / div);
            for x in 0..cnw {
                out.cb[oby + x] = (row_cb[x] / dd) as u8;
                row_cb[x] = 0;
                out.cr[oby + x] = (row_cr[x] / dd) as u8;
                row_cr[x] = 0;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_proc::Subsample;

    fn gradient_image(width: usize, height: usize, subsample: Subsample) -> YcbcrImage {
        let mut im = YcbcrImage::flat(width, height, subsample, 0, 128, 128);
        for y in 0..height {
            for x in 0..width {
                im.y[y * im.y_stride + x] = ((x + y) % 256) as u8;
            }
        }
        im
    }

    #[test]
    fn test_divisor_prefers_closest_to_target() {
        // 100x100 with target 25: d=4 scores 0; d=5 scores 10 and stops the scan.
        assert_eq!(find_divisor(100, 100, &[100], 25), 4);
    }

    #[test]
    fn test_divisor_identity_when_nothing_divides() {
        assert_eq!(find_divisor(97, 89, &[97], 10), 1);
    }

    #[test]
    fn test_divisor_requires_joint_divisibility() {
        // Without the extra constraint d=2 would win; a padded stride of 7
        // knocks it out, leaving d=1.
        assert_eq!(find_divisor(6, 6, &[6], 3), 2);
        assert_eq!(find_divisor(6, 6, &[7], 3), 1);
    }

    #[test]
    fn test_decimate_dimensions() {
        let im = gradient_image(300, 300, Subsample::Ratio420);
        let out = decimate(&im, SMALL_TARGET_SIZE);
        assert_eq!((out.width, out.height), (150, 150));
        assert_eq!(out.y_stride, 150);
        assert_eq!(out.c_stride, 75);
        assert_eq!(out.subsample, Subsample::Ratio420);
        assert_eq!(out.y.len(), 150 * 150);
        assert_eq!(out.cb.len(), 75 * 75);
    }

    #[test]
    fn test_block_mean_luma() {
        // 4x4 luma decimated by 2: each output pixel is the truncated mean
        // of its 2x2 block.
        let mut im = YcbcrImage::flat(4, 4, Subsample::Ratio444, 0, 128, 128);
        im.y = vec![
            10, 20, 30, 40, //
            10, 20, 30, 40, //
            50, 60, 70, 80, //
            50, 60, 70, 81,
        ];
        let out = decimate(&im, 2);
        assert_eq!((out.width, out.height), (2, 2));
        assert_eq!(out.y, vec![15, 35, 55, 75]);
    }

    #[test]
    fn test_chroma_block_mean() {
        let mut im = YcbcrImage::flat(4, 4, Subsample::Ratio420, 0, 0, 0);
        // 2x2 chroma planes decimated by 2 collapse to a single mean.
        im.cb = vec![10, 20, 30, 40];
        im.cr = vec![200, 200, 100, 100];
        let out = decimate(&im, 2);
        assert_eq!(out.cb, vec![25]);
        assert_eq!(out.cr, vec![150]);
    }

    #[test]
    fn test_uniform_image_stays_uniform() {
        let im = YcbcrImage::flat(64, 64, Subsample::Ratio422, 77, 90, 160);
        let out = decimate(&im, 16);
        assert!(out.y.iter().all(|&v| v == 77));
        assert!(out.cb.iter().all(|&v| v == 90));
        assert!(out.cr.iter().all(|&v| v == 160));
    }
}
