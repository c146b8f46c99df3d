//! Planar YCbCr image plumbing for motion comparison.
//!
//! JPEG frames are decoded once, decimated to a small comparison image,
//! and scored pair-wise. Everything downstream of the decoder works on
//! [`YcbcrImage`], a planar Y/Cb/Cr triple with explicit strides and a
//! chroma subsample ratio.

mod decimate;
mod diff;
mod ycbcr;

pub use decimate::{decimate, SMALL_TARGET_SIZE};
pub use diff::{debug_diff_jpeg, diff_score, Y_DIFF_MIN_THRESHOLD};
pub use ycbcr::{decode_jpeg, encode_ycbcr_jpeg, DecodedImage, Subsample, YcbcrImage};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    /// JPEG decode or encode failure from the codec.
    #[error("jpeg codec: {0}")]
    Codec(#[from] image::ImageError),

    /// Chroma subsample factors outside the supported set.
    #[error("unknown chroma subsample factors {dx}x{dy}")]
    UnknownSubsample { dx: usize, dy: usize },

    /// The scorer and decimator only accept YCbCr images.
    #[error("expected a YCbCr image, got {0}")]
    NotYcbcr(&'static str),

    /// Pair-wise operations require identical geometry.
    #[error("image mismatch: {0}")]
    Mismatch(String),
}
