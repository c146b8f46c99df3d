//! Camera subprocess supervision.
//!
//! A dedicated thread spawns the configured command, runs the MJPEG
//! framer over its stdout, and pushes complete frame blobs into a
//! capacity-1 channel. The blocking send backpressures the framer, and
//! through the stdout pipe the camera process itself. When the stream
//! ends or framing gives up, the child is reaped and the command is
//! restarted after the retry delay.

use crate::config::CmdSpec;
use bytes::Bytes;
use shared::mjpeg::{FrameSplitter, FramerError};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(PartialEq)]
enum RunOutcome {
    /// The stream ended; restart after the retry delay.
    Completed,
    /// The blob consumer went away; stop supervising.
    ChannelClosed,
}

/// Spawns the supervisor thread.
pub fn spawn_source(
    spec: CmdSpec,
    retry: Duration,
    tx: mpsc::Sender<Bytes>,
    shutdown: watch::Receiver<bool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("mjpeg-source".into())
        .spawn(move || loop {
            if *shutdown.borrow() {
                return;
            }
            if run_once(&spec, &tx) == RunOutcome::ChannelClosed {
                return;
            }
            if *shutdown.borrow() {
                return;
            }
            std::thread::sleep(retry);
        })
        .expect("spawn mjpeg source thread")
}

fn run_once(spec: &CmdSpec, tx: &mpsc::Sender<Bytes>) -> RunOutcome {
    let mut child = match Command::new(&spec.cmd[0])
        .args(&spec.cmd[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("start {:?}: {e}", spec.cmd[0]);
            return RunOutcome::Completed;
        }
    };
    info!("started camera command {:?}", spec.cmd[0]);

    let stdout = child.stdout.take().expect("stdout piped above");
    let mut splitter = FrameSplitter::new(stdout);
    let mut total = 0u64;
    let outcome = loop {
        match splitter.next_frame() {
            Ok(blob) => {
                total += blob.len() as u64;
                if tx.blocking_send(blob).is_err() {
                    break RunOutcome::ChannelClosed;
                }
            }
            Err(FramerError::SourceClosed) => {
                info!("camera stream ended after {total} bytes");
                break RunOutcome::Completed;
            }
            Err(e @ FramerError::GaveUp { .. }) => {
                warn!("{e}; restarting camera");
                break RunOutcome::Completed;
            }
            Err(FramerError::Io(e)) => {
                warn!("camera stream read: {e}");
                break RunOutcome::Completed;
            }
        }
    };

    wait_with_timeout(&mut child, Duration::from_secs(2));
    outcome
}

/// Waits for the child to exit, killing it once the timeout passes.
pub(crate) fn wait_with_timeout(child: &mut Child, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("wait on camera command: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(entropy: &[u8]) -> Vec<u8> {
        let mut j = vec![0xff, 0xd8];
        j.extend_from_slice(&[0xff, 0xda, 0x00, 0x04, 0x01, 0x02]);
        j.extend_from_slice(entropy);
        j.extend_from_slice(&[0xff, 0xd9]);
        j
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_source_streams_frames_from_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.mjpeg");
        let f1 = fake_jpeg(&[1, 2, 3]);
        let f2 = fake_jpeg(&[4, 5, 6]);
        let mut data = f1.clone();
        data.extend_from_slice(&f2);
        std::fs::write(&path, &data).unwrap();

        let spec = CmdSpec {
            cmd: vec!["cat".into(), path.to_str().unwrap().into()],
            retry: None,
        };
        let (tx, mut rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_source(spec, Duration::from_millis(10), tx, stop_rx);

        let got1 = rx.recv().await.unwrap();
        let got2 = rx.recv().await.unwrap();
        assert_eq!(&got1[..], &f1[..]);
        assert_eq!(&got2[..], &f2[..]);

        // Dropping the receiver ends the supervisor on its next send.
        drop(rx);
        handle.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_source_restarts_after_stream_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.mjpeg");
        let f = fake_jpeg(&[9]);
        std::fs::write(&path, &f).unwrap();

        let spec = CmdSpec {
            cmd: vec!["cat".into(), path.to_str().unwrap().into()],
            retry: None,
        };
        let (tx, mut rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_source(spec, Duration::from_millis(10), tx, stop_rx);

        // Two receives means the command ran at least twice.
        assert_eq!(&rx.recv().await.unwrap()[..], &f[..]);
        assert_eq!(&rx.recv().await.unwrap()[..], &f[..]);

        drop(rx);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_with_timeout_kills_stuck_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let started = Instant::now();
        wait_with_timeout(&mut child, Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
