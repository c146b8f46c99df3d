//! MJPEG byte-stream framing.
//!
//! Cheap cameras and capture pipelines emit Motion-JPEG as bare
//! concatenated JPEG images, sometimes with junk bytes between frames.
//! [`FrameSplitter`] walks the JPEG marker structure and yields one
//! independently-owned blob per complete image (`FF D8` through `FF D9`).
//!
//! The splitter is pull-based over any [`Read`] source; the caller decides
//! how frames fan out (the server pushes them into a capacity-1 channel so
//! a slow consumer backpressures the camera process through its stdout
//! pipe).

use bytes::Bytes;
use std::io::{BufReader, ErrorKind, Read};
use thiserror::Error;
use tracing::debug;

/// Consecutive bad tags tolerated before the splitter gives up.
pub const DEFAULT_TAG_ERROR_BUDGET: u32 = 5;

#[derive(Error, Debug)]
pub enum FramerError {
    /// The byte source reached end-of-stream. The supervisor may restart
    /// the source after its retry delay.
    #[error("mjpeg source closed")]
    SourceClosed,

    /// Too many consecutive malformed tags; the stream is unrecoverable
    /// without a fresh source.
    #[error("mjpeg framing gave up after {errors} consecutive bad tags: {detail}")]
    GaveUp { errors: u32, detail: String },

    /// Non-EOF I/O failure on the source.
    #[error("mjpeg source read: {0}")]
    Io(std::io::Error),
}

enum SplitterState {
    /// At a marker boundary inside a frame.
    Tag,
    /// Scanning byte-at-a-time for the next `FF D8` start of image.
    SkipToSoi,
}

/// Segments a concatenated JPEG stream into complete frame blobs.
pub struct FrameSplitter<R> {
    src: BufReader<R>,
    acc: Vec<u8>,
    state: SplitterState,
    tag_error_budget: u32,
    consecutive_errors: u32,
    /// Seeds the SOI scan when the failed tag ended in `FF`.
    resync_ff: bool,
    /// Bytes consumed so far, for diagnostics.
    offset: u64,
    prev_tag: [u8; 2],
}

impl<R: Read> FrameSplitter<R> {
    pub fn new(src: R) -> Self {
        Self::with_budget(src, DEFAULT_TAG_ERROR_BUDGET)
    }

    pub fn with_budget(src: R, tag_error_budget: u32) -> Self {
        Self {
            src: BufReader::new(src),
            acc: Vec::new(),
            state: SplitterState::Tag,
            tag_error_budget,
            consecutive_errors: 0,
            resync_ff: false,
            offset: 0,
            prev_tag: [0, 0],
        }
    }

    /// Returns the next complete JPEG blob from the stream.
    ///
    /// Blobs are emitted in source order and own their bytes. Junk between
    /// frames is skipped silently; malformed tags inside a frame count
    /// against the consecutive-error budget, which resets whenever a frame
    /// is emitted successfully.
    pub fn next_frame(&mut self) -> Result<Bytes, FramerError> {
        loop {
            if matches!(self.state, SplitterState::SkipToSoi) {
                self.scan_soi()?;
                self.state = SplitterState::Tag;
            }

            let tag = self.read_tag()?;
            if tag[0] != 0xff {
                self.record_tag_error(tag)?;
                self.state = SplitterState::SkipToSoi;
                continue;
            }

            match tag[1] {
                // start of image
                0xd8 => {
                    self.acc.clear();
                    self.acc.extend_from_slice(&tag);
                }
                // start of scan: copy the header, then the entropy-coded
                // segment up to and including the end-of-image marker
                0xda => {
                    self.acc.extend_from_slice(&tag);
                    self.copy_sized_segment()?;
                    self.scan_entropy()?;
                    let blob = Bytes::copy_from_slice(&self.acc);
                    self.acc.clear();
                    self.consecutive_errors = 0;
                    self.state = SplitterState::SkipToSoi;
                    debug!("frame: {} bytes", blob.len());
                    self.prev_tag = tag;
                    return Ok(blob);
                }
                // define restart interval: fixed 4-byte body
                0xdd => {
                    self.acc.extend_from_slice(&tag);
                    self.copy_exact(4)?;
                }
                // restart markers carry no length
                0xd0..=0xd7 => {
                    self.acc.extend_from_slice(&tag);
                }
                // any other tag: 2-byte big-endian length, then payload
                _ => {
                    self.acc.extend_from_slice(&tag);
                    self.copy_sized_segment()?;
                }
            }
            self.prev_tag = tag;
        }
    }

    fn record_tag_error(&mut self, tag: [u8; 2]) -> Result<(), FramerError> {
        self.consecutive_errors += 1;
        let detail = format!(
            "bad JPEG tag {:02x}{:02x} at offset {} (prev tag {:02x}{:02x})",
            tag[0], tag[1], self.offset, self.prev_tag[0], self.prev_tag[1]
        );
        if self.consecutive_errors > self.tag_error_budget {
            return Err(FramerError::GaveUp {
                errors: self.consecutive_errors,
                detail,
            });
        }
        debug!("{detail}, resyncing");
        self.resync_ff = tag[1] == 0xff;
        Ok(())
    }

    /// Scans for the next `FF D8` and seeds the accumulator with it.
    fn scan_soi(&mut self) -> Result<(), FramerError> {
        let mut was_ff = self.resync_ff;
        self.resync_ff = false;
        loop {
            let c = self.read_byte()?;
            if was_ff && c == 0xd8 {
                self.acc.clear();
                self.acc.extend_from_slice(&[0xff, 0xd8]);
                return Ok(());
            }
            was_ff = c == 0xff;
        }
    }

    /// Copies the entropy-coded segment through the end-of-image marker.
    ///
    /// `FF 00` is an escaped data byte, never the start of a marker; this
    /// holds even for an `FF` that immediately follows an escape pair.
    fn scan_entropy(&mut self) -> Result<(), FramerError> {
        let mut was_ff = false;
        loop {
            let c = self.read_byte()?;
            self.acc.push(c);
            if was_ff && c == 0xd9 {
                return Ok(());
            }
            was_ff = if was_ff && c == 0x00 {
                false
            } else {
                c == 0xff
            };
        }
    }

    /// Reads a 2-byte big-endian segment length and copies the payload.
    fn copy_sized_segment(&mut self) -> Result<(), FramerError> {
        let mut len = [0u8; 2];
        self.read_into(&mut len)?;
        self.acc.extend_from_slice(&len);
        let size = u16::from_be_bytes(len);
        self.copy_exact(size.saturating_sub(2) as usize)
    }

    fn copy_exact(&mut self, n: usize) -> Result<(), FramerError> {
        let at = self.acc.len();
        self.acc.resize(at + n, 0);
        let res = self.src.read_exact(&mut self.acc[at..]);
        Self::map_eof(res)?;
        self.offset += n as u64;
        Ok(())
    }

    fn read_tag(&mut self) -> Result<[u8; 2], FramerError> {
        let mut tag = [0u8; 2];
        self.read_into(&mut tag)?;
        Ok(tag)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<(), FramerError> {
        Self::map_eof(self.src.read_exact(buf))?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, FramerError> {
        let mut b = [0u8; 1];
        Self::map_eof(self.src.read_exact(&mut b))?;
        self.offset += 1;
        Ok(b[0])
    }

    fn map_eof(res: std::io::Result<()>) -> Result<(), FramerError> {
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(FramerError::SourceClosed),
            Err(e) => Err(FramerError::Io(e)),
        }
    }
}
