//! Motion detection worker.
//!
//! Each cycle compares the newest frame against the first frame older
//! than the lookback interval. The score drives a small state machine:
//! above the high threshold a capture session starts (or an active one is
//! pinged); between the thresholds an active session is kept alive
//! (hysteresis); below the floor the session is left to time out on its
//! own.

use crate::capture::{spawn_capture, CaptureHandle};
use crate::config::Config;
use crate::frames::ensure_mini;
use shared::frame_window::{FrameHandle, FrameWindow};
use shared::image_proc::diff_score;
use shared::score_stats::ScoreSink;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// How far behind the newest frame the comparison partner sits.
const LOOKBACK_SECONDS: i64 = 1;

pub struct MotionWorker {
    window: Arc<FrameWindow>,
    cfg: Arc<Config>,
    score_sink: Option<Arc<dyn ScoreSink>>,
    shutdown: watch::Receiver<bool>,
    capture: Option<CaptureHandle>,
    prev_seq: Option<u64>,
}

impl MotionWorker {
    pub fn new(
        window: Arc<FrameWindow>,
        cfg: Arc<Config>,
        score_sink: Option<Arc<dyn ScoreSink>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            window,
            cfg,
            score_sink,
            shutdown,
            capture: None,
            prev_seq: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            let window = self.window.clone();
            let newest = tokio::select! {
                _ = self.shutdown.changed() => return,
                h = window.wait_newer(self.prev_seq) => h,
            };
            self.prev_seq = Some(newest.seq);

            let lookback = newest.when - chrono::Duration::seconds(LOOKBACK_SECONDS);
            let Some(old) = self.window.get_before(lookback) else {
                continue;
            };

            let score = match self.pair_score(&old, &newest).await {
                Ok(s) => s,
                Err(e) => {
                    debug!("diff {} - {}: {e}", old.when, newest.when);
                    continue;
                }
            };
            if score.is_nan() {
                debug!("diff {} - {}: NaN", old.when, newest.when);
                continue;
            }
            if let Some(sink) = &self.score_sink {
                sink.add(score);
            }

            self.apply_score(score, &newest);
        }
    }

    async fn pair_score(&self, old: &FrameHandle, newest: &FrameHandle) -> anyhow::Result<f64> {
        let a = ensure_mini(&self.window, old).await?;
        let b = ensure_mini(&self.window, newest).await?;
        Ok(diff_score(&a, &b)?)
    }

    fn apply_score(&mut self, score: f64, newest: &FrameHandle) {
        if let Some(capture) = &self.capture {
            if capture.is_finished() {
                self.capture = None;
            }
        }

        if score > self.cfg.threshold {
            match &self.capture {
                Some(capture) => capture.ping(chrono::Local::now()),
                None => {
                    if self.cfg.any_capture() {
                        info!("motion score {score:.4} over {:.4}", self.cfg.threshold);
                        self.capture = Some(spawn_capture(
                            self.window.clone(),
                            self.cfg.clone(),
                            newest.clone(),
                            self.shutdown.clone(),
                        ));
                    }
                }
            }
        } else if self.cfg.thresh_off > 0.0 && score > self.cfg.thresh_off {
            if let Some(capture) = &self.capture {
                capture.ping(chrono::Local::now());
            }
        }
    }
}
