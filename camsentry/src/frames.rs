//! Lazy per-frame decode caching.
//!
//! Decoding and decimating a frame is the expensive step of the pipeline,
//! so results are memoized on the frame's window slot and shared between
//! the motion worker and the HTTP mini/debug streams. The CPU work runs
//! on the blocking pool.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use shared::frame_window::{FrameHandle, FrameWindow};
use shared::image_proc::{decimate, decode_jpeg, encode_ycbcr_jpeg, YcbcrImage, SMALL_TARGET_SIZE};
use std::sync::Arc;

/// Returns the frame's decimated comparison image, decoding and caching
/// it if needed.
pub async fn ensure_mini(window: &Arc<FrameWindow>, frame: &FrameHandle) -> Result<Arc<YcbcrImage>> {
    if let Some(mini) = window.cached_mini(frame.seq) {
        return Ok(mini);
    }

    let blob: Bytes = frame.blob.clone();
    let (unpacked, mini) = tokio::task::spawn_blocking(move || -> Result<_> {
        let decoded = decode_jpeg(&blob)?;
        let mini = decimate(decoded.as_ycbcr()?, SMALL_TARGET_SIZE);
        Ok((Arc::new(decoded), Arc::new(mini)))
    })
    .await
    .map_err(|e| anyhow!("decode task: {e}"))??;

    window.store_images(frame.seq, Some(unpacked), Some(mini.clone()));
    Ok(mini)
}

/// JPEG-encodes the frame's decimated image (quality 90).
pub async fn mini_jpeg(window: &Arc<FrameWindow>, frame: &FrameHandle) -> Result<Bytes> {
    let mini = ensure_mini(window, frame).await?;
    let encoded = tokio::task::spawn_blocking(move || encode_ycbcr_jpeg(&mini, 90))
        .await
        .map_err(|e| anyhow!("encode task: {e}"))??;
    Ok(Bytes::from(encoded))
}
