//! Rolling score telemetry.
//!
//! Motion scores stream into a fixed-size buffer; when it fills, the
//! buffer is swapped out and handed to a short-lived worker thread that
//! clusters the batch with a small k-means refinement and emits one JSON
//! line per batch to the configured output (file or HTTP POST).

use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Accepts scalar scores from the motion worker.
pub trait ScoreSink: Send + Sync {
    fn add(&self, score: f64);
}

/// Receives one serialized histogram record per batch.
pub trait StatOut: Send + Sync {
    fn write_line(&self, line: &[u8]) -> std::io::Result<()>;
}

/// Appends JSON lines to a file.
pub struct FileStatOut {
    file: Mutex<std::fs::File>,
}

impl FileStatOut {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl StatOut for FileStatOut {
    fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut f = self.file.lock().unwrap();
        f.write_all(line)
    }
}

/// POSTs each record to an HTTP endpoint. Runs on the digest worker
/// thread, so the blocking client is fine here.
pub struct HttpStatOut {
    url: String,
}

impl HttpStatOut {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

impl StatOut for HttpStatOut {
    fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        let client = reqwest::blocking::Client::new();
        let response = client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(line.to_vec())
            .send()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if !response.status().is_success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("status {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct KnnStatRecord {
    #[serde(rename = "kc")]
    centers: Vec<f64>,
    #[serde(rename = "c")]
    counts: Vec<usize>,
}

const KNN_BUCKETS: usize = 20;
const KNN_ROUNDS: usize = 20;

struct ScoreBuffer {
    buffer: Vec<f64>,
    min: f64,
    max: f64,
}

/// Rolling histogram of scores, digested in batches of `capacity`.
pub struct RollingKnnHistogram {
    name: String,
    capacity: usize,
    out: Arc<dyn StatOut>,
    state: Mutex<ScoreBuffer>,
}

impl RollingKnnHistogram {
    pub fn new(name: &str, capacity: usize, out: Arc<dyn StatOut>) -> Self {
        assert!(capacity > 0);
        Self {
            name: name.to_string(),
            capacity,
            out,
            state: Mutex::new(ScoreBuffer {
                buffer: Vec::with_capacity(capacity),
                min: 0.0,
                max: 0.0,
            }),
        }
    }

    /// Digests whatever has accumulated so far, synchronously.
    pub fn flush(&self) {
        let (batch, min, max) = {
            let mut st = self.state.lock().unwrap();
            let batch = std::mem::replace(&mut st.buffer, Vec::with_capacity(self.capacity));
            (batch, st.min, st.max)
        };
        if !batch.is_empty() {
            digest(&self.name, self.out.as_ref(), batch, min, max);
        }
    }
}

impl ScoreSink for RollingKnnHistogram {
    fn add(&self, score: f64) {
        let full = {
            let mut st = self.state.lock().unwrap();
            if st.buffer.is_empty() {
                st.min = score;
                st.max = score;
            } else {
                if score < st.min {
                    st.min = score;
                }
                if score > st.max {
                    st.max = score;
                }
            }
            st.buffer.push(score);
            if st.buffer.len() == self.capacity {
                let batch = std::mem::replace(&mut st.buffer, Vec::with_capacity(self.capacity));
                Some((batch, st.min, st.max))
            } else {
                None
            }
        };

        if let Some((batch, min, max)) = full {
            let name = self.name.clone();
            let out = self.out.clone();
            std::thread::spawn(move || digest(&name, out.as_ref(), batch, min, max));
        }
    }
}

fn digest(name: &str, out: &dyn StatOut, batch: Vec<f64>, min: f64, max: f64) {
    let mut centers = vec![0.0f64; KNN_BUCKETS];
    let mut sums = vec![0.0f64; KNN_BUCKETS];
    let mut counts = vec![0usize; KNN_BUCKETS];
    let step = (max - min) / KNN_BUCKETS as f64;
    for (i, c) in centers.iter_mut().enumerate() {
        *c = min + step * i as f64;
    }

    for _ in 0..KNN_ROUNDS {
        knn_count(&mut centers, &mut sums, &mut counts, &batch);
        knn_adjust(&mut centers, &sums, &counts);
    }

    let (centers, counts) = filter_zero_counts(centers, counts);
    let record = KnnStatRecord { centers, counts };

    let line = if name.is_empty() {
        serde_json::to_vec(&record)
    } else {
        let mut wrapped = serde_json::Map::new();
        wrapped.insert(
            name.to_string(),
            serde_json::to_value(&record).expect("histogram record serializes"),
        );
        serde_json::to_vec(&wrapped)
    };
    let mut line = match line {
        Ok(l) => l,
        Err(e) => {
            warn!("serialize knn stats: {e}");
            return;
        }
    };
    line.push(b'\n');

    if let Err(e) = out.write_line(&line) {
        warn!("write knn stats: {e}");
        return;
    }
    debug!("statlog {} scores clustered", batch.len());
}

/// Assigns every finite score to its nearest center.
fn knn_count(centers: &mut [f64], sums: &mut [f64], counts: &mut [usize], batch: &[f64]) {
    for (s, c) in sums.iter_mut().zip(counts.iter_mut()) {
        *s = 0.0;
        *c = 0;
    }
    centers.sort_by(|a, b| a.total_cmp(b));
    for &v in batch {
        if v.is_nan() {
            continue;
        }
        let hi = centers.partition_point(|&c| c < v).min(centers.len() - 1);
        let lo = hi.saturating_sub(1);
        let nearest = if (centers[lo] - v).abs() < (centers[hi] - v).abs() {
            lo
        } else {
            hi
        };
        counts[nearest] += 1;
        sums[nearest] += v;
    }
}

/// Moves each center to the mean of the scores assigned to it.
fn knn_adjust(centers: &mut [f64], sums: &[f64], counts: &[usize]) {
    for i in 0..centers.len() {
        if counts[i] != 0 {
            centers[i] = sums[i] / counts[i] as f64;
        }
    }
}

fn filter_zero_counts(centers: Vec<f64>, counts: Vec<usize>) -> (Vec<f64>, Vec<usize>) {
    let mut out_centers = Vec::with_capacity(centers.len());
    let mut out_counts = Vec::with_capacity(counts.len());
    for (center, count) in centers.into_iter().zip(counts) {
        if count != 0 {
            out_centers.push(center);
            out_counts.push(count);
        }
    }
    (out_centers, out_counts)
}
