//! HTTP surface.
//!
//! Routes:
//! - `GET /jpeg`: the newest frame as a single JPEG.
//! - `GET /`: redirect to `/mjpeg`.
//! - `GET /favicon.ico`: 404.
//! - `GET /debug`: raw stream or per-pixel diff visualization.
//! - anything else: `multipart/x-mixed-replace` MJPEG stream with
//!   `fps`, `start` (rewind seconds, negative) and `mini` parameters.
//!
//! Stream handlers spawn a producer task that writes multipart parts into
//! a capacity-1 channel wired to the response body; when the client goes
//! away the channel closes and the producer exits.

use crate::frames::{ensure_mini, mini_jpeg};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, Local};
use shared::frame_window::{FrameHandle, FrameWindow};
use shared::image_proc::{debug_diff_jpeg, Y_DIFF_MIN_THRESHOLD};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

pub struct AppState {
    pub window: Arc<FrameWindow>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jpeg", get(jpeg_endpoint))
        .route("/favicon.ico", get(favicon_endpoint))
        .route("/", get(root_redirect))
        .route("/debug", get(debug_stream_endpoint))
        .fallback(mjpeg_stream_endpoint)
        .with_state(state)
}

/// Clamped integer query parameter; the default survives parse failures.
fn form_int(params: &HashMap<String, String>, name: &str, default: i64, min: i64, max: i64) -> i64 {
    match params.get(name).and_then(|s| s.parse::<i64>().ok()) {
        Some(v) => v.clamp(min, max),
        None => default,
    }
}

fn form_bool(params: &HashMap<String, String>, name: &str, default: bool) -> bool {
    match params.get(name).map(|s| s.to_ascii_lowercase()) {
        Some(v) if ["t", "1", "true"].contains(&v.as_str()) => true,
        Some(v) if ["f", "0", "false"].contains(&v.as_str()) => false,
        _ => default,
    }
}

async fn jpeg_endpoint(State(state): State<Arc<AppState>>) -> Response {
    match state.window.get_newest() {
        Some(frame) => Response::builder()
            .header(header::CONTENT_TYPE, "image/jpeg")
            .body(Body::from(frame.blob))
            .expect("build jpeg response"),
        None => (StatusCode::NOT_FOUND, "no frame yet").into_response(),
    }
}

async fn favicon_endpoint() -> Response {
    (StatusCode::NOT_FOUND, "no").into_response()
}

async fn root_redirect() -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, "/mjpeg")
        .body(Body::empty())
        .expect("build redirect response")
}

fn unix_seconds(t: DateTime<Local>) -> String {
    format!("{:.3}", t.timestamp_micros() as f64 / 1e6)
}

/// Writes multipart/x-mixed-replace parts into the response channel.
struct PartSender {
    tx: mpsc::Sender<Bytes>,
    boundary: String,
    start_stamp: String,
}

impl PartSender {
    fn new(tx: mpsc::Sender<Bytes>, boundary: String) -> Self {
        Self {
            tx,
            boundary,
            start_stamp: unix_seconds(Local::now()),
        }
    }

    /// Err means the client disconnected.
    async fn send(&self, blob: &Bytes, when: DateTime<Local>) -> Result<(), ()> {
        let head = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-StartTime: {}\r\nX-TimeStamp: {}\r\n\r\n",
            self.boundary,
            blob.len(),
            self.start_stamp,
            unix_seconds(when),
        );
        let mut part = Vec::with_capacity(head.len() + blob.len() + 2);
        part.extend_from_slice(head.as_bytes());
        part.extend_from_slice(blob);
        part.extend_from_slice(b"\r\n");
        self.tx.send(Bytes::from(part)).await.map_err(|_| ())
    }
}

fn multipart_response(rx: mpsc::Receiver<Bytes>, boundary: &str) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={boundary}"),
        )
        .header(header::CONNECTION, "close")
        .body(Body::from_stream(stream))
        .expect("build multipart response")
}

fn random_boundary() -> String {
    format!("{:032x}", rand::random::<u128>())
}

async fn mjpeg_stream_endpoint(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let fps = form_int(&params, "fps", 15, 1, 30);
    let start = form_int(&params, "start", 0, -100, 0);
    let mini = form_bool(&params, "mini", false);

    let boundary = random_boundary();
    let (tx, rx) = mpsc::channel(1);
    let sender = PartSender::new(tx, boundary.clone());
    let window = state.window.clone();
    tokio::spawn(stream_frames(window, sender, fps, start, mini));
    multipart_response(rx, &boundary)
}

async fn stream_frames(
    window: Arc<FrameWindow>,
    sender: PartSender,
    fps: i64,
    start_offset: i64,
    mini: bool,
) {
    let period = chrono::Duration::nanoseconds((1e9 / fps as f64) as i64);
    let start_time = Local::now();
    let mut next_frame = start_time + period;
    let mut caught_up = true;
    let mut current: Option<FrameHandle> = None;

    if start_offset < 0 {
        let since = start_time + chrono::Duration::seconds(start_offset);
        current = window.get_after(since);
        caught_up = current.is_none();
    }

    loop {
        let frame = match current.take() {
            // First live iteration: latest frame, or the first to arrive.
            None => match window.get_newest() {
                Some(f) => f,
                None => window.wait_newer(None).await,
            },
            Some(prev) => {
                if !caught_up {
                    match window.get_after(prev.when) {
                        Some(f) => f,
                        None => {
                            caught_up = true;
                            let f = window.wait_after(next_frame).await;
                            next_frame = f.when;
                            f
                        }
                    }
                } else {
                    let f = window.wait_after(next_frame).await;
                    next_frame = f.when;
                    f
                }
            }
        };

        let blob = if mini {
            match mini_jpeg(&window, &frame).await {
                Ok(b) => b,
                Err(e) => {
                    debug!("mini encode: {e}");
                    return;
                }
            }
        } else {
            frame.blob.clone()
        };
        if sender.send(&blob, frame.when).await.is_err() {
            return;
        }
        current = Some(frame);

        let now = Local::now();
        if now < next_frame {
            if let Ok(d) = (next_frame - now).to_std() {
                tokio::time::sleep(d).await;
            }
        }
        next_frame = next_frame + period;
    }
}

async fn debug_stream_endpoint(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let fps = form_int(&params, "fps", 15, 1, 30);
    let thresh = form_int(&params, "thresh", Y_DIFF_MIN_THRESHOLD as i64, 0, 255) as u8;
    let diff_mode = form_bool(&params, "d", false);

    let boundary = random_boundary();
    let (tx, rx) = mpsc::channel(1);
    let sender = PartSender::new(tx, boundary.clone());
    let window = state.window.clone();
    tokio::spawn(stream_debug(window, sender, fps, thresh, diff_mode));
    multipart_response(rx, &boundary)
}

async fn stream_debug(
    window: Arc<FrameWindow>,
    sender: PartSender,
    fps: i64,
    thresh: u8,
    diff_mode: bool,
) {
    let period = chrono::Duration::nanoseconds((1e9 / fps as f64) as i64);
    let mut next_frame = Local::now();

    loop {
        let newest = window.wait_after(next_frame).await;
        next_frame = newest.when;

        let blob = if diff_mode {
            let old = window.get_after(newest.when - chrono::Duration::seconds(1));
            let Some(old) = old else {
                debug!("no old frame yet");
                continue;
            };
            match debug_pair(&window, &old, &newest, thresh).await {
                Ok(b) => b,
                Err(e) => {
                    debug!("debug diff: {e}");
                    continue;
                }
            }
        } else {
            newest.blob.clone()
        };

        if sender.send(&blob, newest.when).await.is_err() {
            return;
        }

        let now = Local::now();
        if now < next_frame {
            if let Ok(d) = (next_frame - now).to_std() {
                tokio::time::sleep(d).await;
            }
        }
        next_frame = next_frame + period;
    }
}

async fn debug_pair(
    window: &Arc<FrameWindow>,
    old: &FrameHandle,
    newest: &FrameHandle,
    thresh: u8,
) -> anyhow::Result<Bytes> {
    let a = ensure_mini(window, old).await?;
    let b = ensure_mini(window, newest).await?;
    let blob =
        tokio::task::spawn_blocking(move || debug_diff_jpeg(&a, &b, thresh)).await??;
    Ok(Bytes::from(blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> (Arc<AppState>, Arc<FrameWindow>) {
        let window = Arc::new(FrameWindow::default());
        (
            Arc::new(AppState {
                window: window.clone(),
            }),
            window,
        )
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_jpeg_endpoint_empty_window() {
        let (state, _) = test_state();
        let response = create_router(state)
            .oneshot(get_request("/jpeg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_jpeg_endpoint_serves_newest() {
        let (state, window) = test_state();
        window.push(Bytes::from_static(b"not-the-newest-frame"));
        window.push(Bytes::from_static(b"fake-jpeg-bytes-here"));

        let response = create_router(state)
            .oneshot(get_request("/jpeg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"fake-jpeg-bytes-here");
    }

    #[tokio::test]
    async fn test_root_redirects_to_mjpeg() {
        let (state, _) = test_state();
        let response = create_router(state)
            .oneshot(get_request("/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/mjpeg");
    }

    #[tokio::test]
    async fn test_favicon_is_404() {
        let (state, _) = test_state();
        let response = create_router(state)
            .oneshot(get_request("/favicon.ico"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_response_headers() {
        let (state, window) = test_state();
        window.push(Bytes::from_static(b"fake-jpeg-bytes-here"));

        let response = create_router(state)
            .oneshot(get_request("/mjpeg?fps=30"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("multipart/x-mixed-replace; boundary="));
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");

        // First part arrives with per-part headers and the frame bytes.
        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(2), body.next())
            .await
            .expect("timed out waiting for first part")
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("Content-Type: image/jpeg"));
        assert!(text.contains("Content-Length: 20"));
        assert!(text.contains("X-TimeStamp: "));
        assert!(text.contains("fake-jpeg-bytes-here"));
    }

    #[tokio::test]
    async fn test_stream_parts_are_time_ordered() {
        let (state, window) = test_state();
        let base = Local::now();
        for i in 0..5 {
            window.push_at(
                Bytes::from(vec![b'a' + i as u8; 24]),
                base - chrono::Duration::milliseconds(900 - i * 100),
            );
        }

        // Rewind into the window; catch-up should replay forward.
        let response = create_router(state)
            .oneshot(get_request("/mjpeg?start=-5&fps=30"))
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();

        let mut stamps = Vec::new();
        for _ in 0..3 {
            let chunk = tokio::time::timeout(std::time::Duration::from_secs(2), body.next())
                .await
                .expect("timed out waiting for part")
                .unwrap()
                .unwrap();
            let text = String::from_utf8_lossy(&chunk).to_string();
            let stamp = text
                .lines()
                .find(|l| l.starts_with("X-TimeStamp: "))
                .and_then(|l| l.trim_start_matches("X-TimeStamp: ").trim().parse::<f64>().ok())
                .expect("part carries a timestamp");
            stamps.push(stamp);
        }
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "stamps {stamps:?}");
    }

    #[tokio::test]
    async fn test_form_helpers() {
        let mut params = HashMap::new();
        params.insert("fps".to_string(), "99".to_string());
        params.insert("mini".to_string(), "TRUE".to_string());
        params.insert("d".to_string(), "0".to_string());
        params.insert("junk".to_string(), "abc".to_string());

        assert_eq!(form_int(&params, "fps", 15, 1, 30), 30);
        assert_eq!(form_int(&params, "start", 0, -100, 0), 0);
        assert_eq!(form_int(&params, "junk", 7, 0, 10), 7);
        assert!(form_bool(&params, "mini", false));
        assert!(!form_bool(&params, "d", true));
        assert!(form_bool(&params, "missing", true));
    }
}
