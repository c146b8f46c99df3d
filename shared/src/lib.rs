//! Shared components for the MJPEG motion camera pipeline.
//!
//! This crate contains the reusable plumbing consumed by the server
//! application: the MJPEG byte-stream framer, the bounded in-memory frame
//! window, planar YCbCr image processing (decimation and motion scoring),
//! and rolling score telemetry.

pub mod frame_window;
pub mod image_proc;
pub mod mjpeg;
pub mod score_stats;
