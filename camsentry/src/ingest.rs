//! Blob channel to frame window.

use bytes::Bytes;
use shared::frame_window::FrameWindow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Shorter than any plausible JPEG; likely framing debris.
const MIN_BLOB_LEN: usize = 20;

/// Drains framed blobs into the window until the channel closes.
pub async fn ingest_loop(window: Arc<FrameWindow>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(blob) = rx.recv().await {
        if blob.len() < MIN_BLOB_LEN {
            warn!("dropping implausibly short jpeg ({} bytes)", blob.len());
            continue;
        }
        debug!("got jpeg blob, {} bytes", blob.len());
        window.push(blob);
    }
}
