//! Motion capture sessions.
//!
//! A session records a contiguous MJPEG segment around a motion event:
//! pre-roll before the triggering frame, the event itself, and a trailing
//! stretch of quiet frames. Frames go to one or more sinks, each fed
//! through a capacity-1 channel with drop-on-full so a slow sink sheds
//! frames instead of stalling the session. Termination compares frame
//! timestamps against the last motion ping, which keeps capture length
//! independent of the frame rate.

use crate::config::Config;
use crate::source::wait_with_timeout;
use bytes::Bytes;
use chrono::{DateTime, Local};
use shared::frame_window::{FrameHandle, FrameWindow};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Formats the capture timestamp: `YYYYMMDD_HHMMSS.nnnnnnnnn`, local time.
pub fn format_timestamp(t: DateTime<Local>) -> String {
    t.format("%Y%m%d_%H%M%S%.9f").to_string()
}

/// Expands a path or argument template: `%%` escapes a literal percent,
/// `%T` expands to the timestamp. Unknown escapes pass through verbatim.
pub fn format_path_template(template: &str, t: DateTime<Local>) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('T') => out.push_str(&format_timestamp(t)),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

struct CaptureShared {
    last_ping: Mutex<DateTime<Local>>,
    finished: AtomicBool,
}

/// Handle held by the motion worker while a session runs.
#[derive(Clone)]
pub struct CaptureHandle {
    shared: Arc<CaptureShared>,
}

impl CaptureHandle {
    /// Extends the session: it ends once frames pass `last ping + post-sec`.
    pub fn ping(&self, now: DateTime<Local>) {
        *self.shared.last_ping.lock().unwrap() = now;
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }
}

/// Starts a capture session for the triggering frame. At most one session
/// should be live at a time; the motion worker enforces that by holding
/// the handle until it reports finished.
pub fn spawn_capture(
    window: Arc<FrameWindow>,
    cfg: Arc<Config>,
    trigger: FrameHandle,
    shutdown: watch::Receiver<bool>,
) -> CaptureHandle {
    let shared = Arc::new(CaptureShared {
        last_ping: Mutex::new(trigger.when),
        finished: AtomicBool::new(false),
    });
    let handle = CaptureHandle {
        shared: shared.clone(),
    };
    tokio::spawn(async move {
        run_session(window, cfg, trigger, &shared, shutdown).await;
        shared.finished.store(true, Ordering::SeqCst);
    });
    handle
}

async fn run_session(
    window: Arc<FrameWindow>,
    cfg: Arc<Config>,
    trigger: FrameHandle,
    shared: &CaptureShared,
    mut shutdown: watch::Receiver<bool>,
) {
    let post = cfg.post_duration();

    let (start, mut current) = if cfg.pre_sec > 0.0 {
        let start = trigger.when - cfg.pre_duration();
        // The frame at exactly `start` counts, so back off one tick.
        match window.get_after(start - chrono::Duration::nanoseconds(1)) {
            Some(first) => (start, first),
            None => return,
        }
    } else {
        (trigger.when, trigger)
    };

    let mut sinks = Vec::new();
    if !cfg.mjpeg_path.is_empty() {
        sinks.push(Sink::file(&cfg.mjpeg_path, start));
    }
    if !cfg.mjpeg_url.is_empty() {
        sinks.push(Sink::post(&cfg.mjpeg_url));
    }
    if !cfg.mjpeg_cmd.is_empty() {
        match Sink::command(&cfg.mjpeg_cmd, start) {
            Ok(s) => sinks.push(s),
            Err(e) => warn!("capture command: {e}"),
        }
    }
    if sinks.is_empty() {
        return;
    }
    info!("capture started at {}", format_timestamp(start));

    loop {
        sinks.retain(|s| s.offer(current.blob.clone()) != SinkStatus::Closed);
        if sinks.is_empty() {
            warn!("all capture sinks failed");
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            h = window.wait_after(current.when) => h,
        };
        let last_ping = *shared.last_ping.lock().unwrap();
        current = next;
        if current.when > last_ping + post {
            break;
        }
    }

    drop(sinks);
    info!(
        "recorded {} - {}",
        format_timestamp(start),
        format_timestamp(current.when)
    );
}

#[derive(PartialEq)]
enum SinkStatus {
    Sent,
    Dropped,
    Closed,
}

enum SinkFeed {
    /// Worker thread fed over a bounded crossbeam channel.
    Thread(crossbeam_channel::Sender<Bytes>),
    /// Async task fed over a bounded tokio channel.
    Task(mpsc::Sender<Bytes>),
}

struct Sink {
    label: String,
    feed: SinkFeed,
}

impl Sink {
    /// Non-blocking delivery: a busy sink drops the frame, a dead sink
    /// reports closed and is removed by the session.
    fn offer(&self, blob: Bytes) -> SinkStatus {
        match &self.feed {
            SinkFeed::Thread(tx) => match tx.try_send(blob) {
                Ok(()) => SinkStatus::Sent,
                Err(crossbeam_channel::TrySendError::Full(_)) => {
                    debug!("{} sink busy, dropping frame", self.label);
                    SinkStatus::Dropped
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => SinkStatus::Closed,
            },
            SinkFeed::Task(tx) => match tx.try_send(blob) {
                Ok(()) => SinkStatus::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("{} sink busy, dropping frame", self.label);
                    SinkStatus::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => SinkStatus::Closed,
            },
        }
    }

    fn file(template: &str, start: DateTime<Local>) -> Sink {
        let path = format_path_template(template, start);
        let (tx, rx) = crossbeam_channel::bounded::<Bytes>(1);
        let label = path.clone();
        std::thread::Builder::new()
            .name("capture-file".into())
            .spawn(move || file_sink_worker(path, rx))
            .expect("spawn capture file thread");
        Sink {
            label,
            feed: SinkFeed::Thread(tx),
        }
    }

    fn post(url: &str) -> Sink {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        tokio::spawn(post_sink_task(url.to_string(), rx));
        Sink {
            label: url.to_string(),
            feed: SinkFeed::Task(tx),
        }
    }

    fn command(argv: &[String], start: DateTime<Local>) -> anyhow::Result<Sink> {
        let expanded: Vec<String> = argv
            .iter()
            .map(|a| format_path_template(a, start))
            .collect();
        let mut child = Command::new(&expanded[0])
            .args(&expanded[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take().expect("stdin piped above");
        let label = expanded[0].clone();
        let (tx, rx) = crossbeam_channel::bounded::<Bytes>(1);
        std::thread::Builder::new()
            .name("capture-cmd".into())
            .spawn(move || {
                let mut stdin = stdin;
                while let Ok(blob) = rx.recv() {
                    if let Err(e) = stdin.write_all(&blob) {
                        warn!("capture command stdin: {e}");
                        break;
                    }
                }
                drop(stdin);
                wait_with_timeout(&mut child, std::time::Duration::from_secs(2));
            })
            .expect("spawn capture command thread");
        Ok(Sink {
            label,
            feed: SinkFeed::Thread(tx),
        })
    }
}

fn file_sink_worker(path: String, rx: crossbeam_channel::Receiver<Bytes>) {
    let mut out = match std::fs::File::create(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!("{path}: {e}");
            return;
        }
    };
    while let Ok(blob) = rx.recv() {
        if let Err(e) = out.write_all(&blob) {
            warn!("{path}: {e}");
            return;
        }
    }
}

async fn post_sink_task(url: String, rx: mpsc::Receiver<Bytes>) {
    let stream = ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
    let body = reqwest::Body::wrap_stream(stream);
    let client = reqwest::Client::new();
    match client
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "video/mjpeg")
        .body(body)
        .send()
        .await
    {
        Ok(response) => debug!("{url}: capture post done, status {}", response.status()),
        Err(e) => warn!("{url}: {e}"),
    }
}
