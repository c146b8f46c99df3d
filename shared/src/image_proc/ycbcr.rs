//! Planar YCbCr images and JPEG decode/encode.

use super::ImageError;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, RgbImage};

/// Chroma subsample ratio of a planar YCbCr image.
///
/// The horizontal/vertical factors give how many luma samples share one
/// chroma sample in each direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subsample {
    Ratio444,
    Ratio422,
    Ratio420,
    Ratio440,
    Ratio411,
    Ratio410,
}

impl Subsample {
    /// Returns the `(horizontal, vertical)` subsample factors.
    pub fn factors(self) -> (usize, usize) {
        match self {
            Subsample::Ratio444 => (1, 1),
            Subsample::Ratio422 => (2, 1),
            Subsample::Ratio420 => (2, 2),
            Subsample::Ratio440 => (1, 2),
            Subsample::Ratio411 => (4, 1),
            Subsample::Ratio410 => (4, 2),
        }
    }

    pub fn from_factors(dx: usize, dy: usize) -> Result<Self, ImageError> {
        match (dx, dy) {
            (1, 1) => Ok(Subsample::Ratio444),
            (2, 1) => Ok(Subsample::Ratio422),
            (2, 2) => Ok(Subsample::Ratio420),
            (1, 2) => Ok(Subsample::Ratio440),
            (4, 1) => Ok(Subsample::Ratio411),
            (4, 2) => Ok(Subsample::Ratio410),
            _ => Err(ImageError::UnknownSubsample { dx, dy }),
        }
    }
}

/// Planar YCbCr image. The rectangle origin is always (0, 0).
#[derive(Clone, Debug)]
pub struct YcbcrImage {
    pub y: Vec<u8>,
    pub cb: Vec<u8>,
    pub cr: Vec<u8>,
    pub y_stride: usize,
    pub c_stride: usize,
    pub subsample: Subsample,
    pub width: usize,
    pub height: usize,
}

impl YcbcrImage {
    pub fn chroma_width(&self) -> usize {
        self.width / self.subsample.factors().0
    }

    pub fn chroma_height(&self) -> usize {
        self.height / self.subsample.factors().1
    }

    /// Uniform image, handy for synthetic inputs.
    pub fn flat(width: usize, height: usize, subsample: Subsample, y: u8, cb: u8, cr: u8) -> Self {
        let (dx, dy) = subsample.factors();
        let (cw, ch) = (width / dx, height / dy);
        Self {
            y: vec![y; width * height],
            cb: vec![cb; cw * ch],
            cr: vec![cr; cw * ch],
            y_stride: width,
            c_stride: cw,
            subsample,
            width,
            height,
        }
    }
}

/// Result of decoding one frame blob.
///
/// Only the YCbCr form participates in motion comparison; grayscale and
/// anything else fail downstream with a typed error.
pub enum DecodedImage {
    Ycbcr(YcbcrImage),
    Gray(GrayImage),
    Other(&'static str),
}

impl DecodedImage {
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedImage::Ycbcr(_) => "ycbcr",
            DecodedImage::Gray(_) => "gray",
            DecodedImage::Other(k) => k,
        }
    }

    pub fn as_ycbcr(&self) -> Result<&YcbcrImage, ImageError> {
        match self {
            DecodedImage::Ycbcr(im) => Ok(im),
            other => Err(ImageError::NotYcbcr(other.kind())),
        }
    }
}

/// Decodes a JPEG blob into planar form.
///
/// Color output is converted to planar YCbCr: 4:2:0 when both dimensions
/// are even, 4:4:4 otherwise.
pub fn decode_jpeg(blob: &[u8]) -> Result<DecodedImage, ImageError> {
    let decoded = image::load_from_memory_with_format(blob, image::ImageFormat::Jpeg)?;
    Ok(match decoded {
        DynamicImage::ImageLuma8(gray) => DecodedImage::Gray(gray),
        other => DecodedImage::Ycbcr(rgb_to_ycbcr(&other.to_rgb8())),
    })
}

/// Re-encodes a planar YCbCr image as JPEG at the given quality.
pub fn encode_ycbcr_jpeg(im: &YcbcrImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let rgb = ycbcr_to_rgb(im);
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(&rgb)?;
    Ok(out)
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn rgb_to_ycbcr(rgb: &RgbImage) -> YcbcrImage {
    let width = rgb.width() as usize;
    let height = rgb.height() as usize;
    let subsample = if width % 2 == 0 && height % 2 == 0 {
        Subsample::Ratio420
    } else {
        Subsample::Ratio444
    };
    let (dx, dy) = subsample.factors();
    let (cw, ch) = (width / dx, height / dy);

    let mut y_plane = vec![0u8; width * height];
    // full-resolution chroma accumulators, box-averaged below
    let mut cb_acc = vec![0u32; cw * ch];
    let mut cr_acc = vec![0u32; cw * ch];

    for py in 0..height {
        for px in 0..width {
            let [r, g, b] = rgb.get_pixel(px as u32, py as u32).0;
            let (rf, gf, bf) = (r as f32, g as f32, b as f32);
            let y = 0.299 * rf + 0.587 * gf + 0.114 * bf;
            let cb = 128.0 - 0.168_736 * rf - 0.331_264 * gf + 0.5 * bf;
            let cr = 128.0 + 0.5 * rf - 0.418_688 * gf - 0.081_312 * bf;
            y_plane[py * width + px] = clamp_u8(y);
            let ci = (py / dy) * cw + px / dx;
            cb_acc[ci] += clamp_u8(cb) as u32;
            cr_acc[ci] += clamp_u8(cr) as u32;
        }
    }

    let samples = (dx * dy) as u32;
    let cb = cb_acc.iter().map(|&v| (v / samples) as u8).collect();
    let cr = cr_acc.iter().map(|&v| (v / samples) as u8).collect();

    YcbcrImage {
        y: y_plane,
        cb,
        cr,
        y_stride: width,
        c_stride: cw,
        subsample,
        width,
        height,
    }
}

fn ycbcr_to_rgb(im: &YcbcrImage) -> RgbImage {
    let (dx, dy) = im.subsample.factors();
    let mut rgb = RgbImage::new(im.width as u32, im.height as u32);
    for py in 0..im.height {
        for px in 0..im.width {
            let y = im.y[py * im.y_stride + px] as f32;
            let ci = (py / dy) * im.c_stride + px / dx;
            let cb = im.cb[ci] as f32 - 128.0;
            let cr = im.cr[ci] as f32 - 128.0;
            let r = clamp_u8(y + 1.402 * cr);
            let g = clamp_u8(y - 0.344_136 * cb - 0.714_136 * cr);
            let b = clamp_u8(y + 1.772 * cb);
            rgb.put_pixel(px as u32, py as u32, image::Rgb([r, g, b]));
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_rgb(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb(rgb));
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, 90);
        encoder.encode_image(&img).unwrap();
        out
    }

    #[test]
    fn test_subsample_factors_round_trip() {
        for sub in [
            Subsample::Ratio444,
            Subsample::Ratio422,
            Subsample::Ratio420,
            Subsample::Ratio440,
            Subsample::Ratio411,
            Subsample::Ratio410,
        ] {
            let (dx, dy) = sub.factors();
            assert_eq!(Subsample::from_factors(dx, dy).unwrap(), sub);
        }
        assert!(matches!(
            Subsample::from_factors(3, 1),
            Err(ImageError::UnknownSubsample { dx: 3, dy: 1 })
        ));
    }

    #[test]
    fn test_decode_color_jpeg_yields_ycbcr() {
        let blob = encoded_rgb(64, 48, [200, 40, 40]);
        let decoded = decode_jpeg(&blob).unwrap();
        let im = decoded.as_ycbcr().unwrap();
        assert_eq!(im.width, 64);
        assert_eq!(im.height, 48);
        assert_eq!(im.subsample, Subsample::Ratio420);
        assert_eq!(im.y.len(), 64 * 48);
        assert_eq!(im.cb.len(), 32 * 24);
    }

    #[test]
    fn test_decode_gray_jpeg_is_not_ycbcr() {
        let img = GrayImage::from_pixel(16, 16, image::Luma([120]));
        let mut blob = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut blob, 90);
        encoder.encode_image(&img).unwrap();

        let decoded = decode_jpeg(&blob).unwrap();
        assert!(matches!(decoded, DecodedImage::Gray(_)));
        assert!(matches!(decoded.as_ycbcr(), Err(ImageError::NotYcbcr("gray"))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_jpeg(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_rgb_ycbcr_round_trip_is_close() {
        let img = RgbImage::from_pixel(8, 8, image::Rgb([180, 90, 30]));
        let planar = rgb_to_ycbcr(&img);
        let back = ycbcr_to_rgb(&planar);
        let p = back.get_pixel(3, 3).0;
        for (got, want) in p.iter().zip([180u8, 90, 30]) {
            assert!((*got as i16 - want as i16).abs() <= 2, "{got} vs {want}");
        }
    }

    #[test]
    fn test_odd_dimensions_use_444() {
        let img = RgbImage::from_pixel(7, 5, image::Rgb([10, 20, 30]));
        let planar = rgb_to_ycbcr(&img);
        assert_eq!(planar.subsample, Subsample::Ratio444);
        assert_eq!(planar.cb.len(), 7 * 5);
    }

    #[test]
    fn test_encode_ycbcr_produces_jpeg() {
        let im = YcbcrImage::flat(32, 32, Subsample::Ratio420, 128, 128, 128);
        let blob = encode_ycbcr_jpeg(&im, 90).unwrap();
        assert_eq!(&blob[0..2], &[0xff, 0xd8]);
        assert_eq!(&blob[blob.len() - 2..], &[0xff, 0xd9]);
    }
}
