//! Runtime configuration.
//!
//! Two JSON documents reach the process: the capture/motion [`Config`]
//! (`--config`) and the camera [`CmdSpec`] (`--cmd`). Either may be given
//! as an inline literal (starting with `{`), a file path, or `-` for
//! stdin.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Score threshold that starts a capture.
    pub threshold: f64,
    /// Hysteresis floor: an active capture keeps getting pinged while the
    /// score stays above this. Zero disables the floor.
    pub thresh_off: f64,
    /// Pre-roll seconds included before the triggering frame.
    pub pre_sec: f64,
    /// Trailing seconds of below-threshold frames before a capture ends.
    pub post_sec: f64,
    /// Capture file template; `%T` expands to the start timestamp.
    pub mjpeg_path: String,
    /// Streaming HTTP POST endpoint for capture segments.
    pub mjpeg_url: String,
    /// Argv template; captured frames are piped to its stdin.
    pub mjpeg_cmd: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            thresh_off: 0.0,
            pre_sec: 1.0,
            post_sec: 1.0,
            mjpeg_path: String::new(),
            mjpeg_url: String::new(),
            mjpeg_cmd: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(arg: &str) -> Result<Self> {
        let text = read_json_arg(arg)?;
        let cfg: Config = serde_json::from_str(&text).context("parse config json")?;
        if cfg.threshold < 0.0 || cfg.thresh_off < 0.0 || cfg.pre_sec < 0.0 || cfg.post_sec < 0.0 {
            bail!("config values must be nonnegative");
        }
        Ok(cfg)
    }

    /// True when at least one capture sink is configured.
    pub fn any_capture(&self) -> bool {
        !self.mjpeg_path.is_empty() || !self.mjpeg_url.is_empty() || !self.mjpeg_cmd.is_empty()
    }

    pub fn pre_duration(&self) -> chrono::Duration {
        secs_f64(self.pre_sec)
    }

    pub fn post_duration(&self) -> chrono::Duration {
        secs_f64(self.post_sec)
    }
}

pub fn secs_f64(seconds: f64) -> chrono::Duration {
    chrono::Duration::nanoseconds((seconds * 1e9) as i64)
}

/// Camera command: argv plus the delay before restarting an exited
/// process.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CmdSpec {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub retry: Option<String>,
}

impl CmdSpec {
    pub fn load(arg: &str) -> Result<Self> {
        let text = read_json_arg(arg)?;
        let spec: CmdSpec = serde_json::from_str(&text).context("parse command json")?;
        if spec.cmd.is_empty() {
            bail!("command spec needs a non-empty \"cmd\" argv");
        }
        Ok(spec)
    }

    pub fn retry_delay(&self) -> Result<Duration> {
        match &self.retry {
            Some(s) => humantime::parse_duration(s)
                .with_context(|| format!("parse retry duration {s:?}")),
            None => Ok(Duration::from_secs(1)),
        }
    }
}

fn read_json_arg(arg: &str) -> Result<String> {
    if arg == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("read json from stdin")?;
        Ok(text)
    } else if arg.starts_with('{') {
        Ok(arg.to_string())
    } else {
        std::fs::read_to_string(arg).with_context(|| format!("read {arg}"))
    }
}
