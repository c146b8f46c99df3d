//! Bounded in-memory window of recent frames.
//!
//! The window holds the newest frames as a doubly linked chain inside a
//! slot arena (integer indices instead of pointers), with evicted slots
//! recycled through a free list. One mutex guards the chain; a
//! [`Notify`] stands in for the condition variable, broadcast once per
//! push. Readers receive [`FrameHandle`] snapshots whose blob is a cheap
//! reference-counted clone, so handles stay valid after the slot is
//! recycled.

use crate::image_proc::{DecodedImage, YcbcrImage};
use bytes::Bytes;
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const DEFAULT_MAX_FRAMES: usize = 100;
pub const DEFAULT_MAX_BYTES: usize = 20_000_000;

/// Snapshot of one frame in the window.
#[derive(Clone, Debug)]
pub struct FrameHandle {
    /// Monotonic frame id; survives slot recycling.
    pub seq: u64,
    /// Capture timestamp (assigned at push).
    pub when: DateTime<Local>,
    /// Raw JPEG bytes.
    pub blob: Bytes,
}

struct Slot {
    seq: u64,
    when: DateTime<Local>,
    blob: Bytes,
    unpacked: Option<Arc<DecodedImage>>,
    mini: Option<Arc<YcbcrImage>>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            seq: 0,
            when: chrono::DateTime::<chrono::Utc>::MIN_UTC.into(),
            blob: Bytes::new(),
            unpacked: None,
            mini: None,
            prev: None,
            next: None,
        }
    }
}

struct Chain {
    slots: Vec<Slot>,
    newest: Option<usize>,
    oldest: Option<usize>,
    free: Option<usize>,
    count: usize,
    total_bytes: usize,
    next_seq: u64,
}

impl Chain {
    fn handle(&self, idx: usize) -> FrameHandle {
        let s = &self.slots[idx];
        FrameHandle {
            seq: s.seq,
            when: s.when,
            blob: s.blob.clone(),
        }
    }

    /// Walks backward from newest; sequence numbers decrease along `prev`.
    fn find_seq(&self, seq: u64) -> Option<usize> {
        let mut cur = self.newest;
        while let Some(idx) = cur {
            let s = &self.slots[idx];
            if s.seq == seq {
                return Some(idx);
            }
            if s.seq < seq {
                return None;
            }
            cur = s.prev;
        }
        None
    }
}

pub struct FrameWindow {
    max_count: usize,
    max_bytes: usize,
    chain: Mutex<Chain>,
    notify: Notify,
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES, DEFAULT_MAX_BYTES)
    }
}

impl FrameWindow {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        assert!(max_count > 0, "window must hold at least one frame");
        Self {
            max_count,
            max_bytes,
            chain: Mutex::new(Chain {
                slots: Vec::new(),
                newest: None,
                oldest: None,
                free: None,
                count: 0,
                total_bytes: 0,
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Inserts a frame stamped with the current time.
    pub fn push(&self, blob: Bytes) -> FrameHandle {
        self.push_at(blob, Local::now())
    }

    /// Inserts a frame with an explicit timestamp, evicts past the bounds
    /// (always retaining at least one frame), and wakes all waiters.
    pub fn push_at(&self, blob: Bytes, when: DateTime<Local>) -> FrameHandle {
        let handle = {
            let mut c = self.chain.lock().unwrap();

            let idx = match c.free {
                Some(i) => {
                    let next_free = c.slots[i].next;
                    c.free = next_free;
                    i
                }
                None => {
                    c.slots.push(Slot::empty());
                    c.slots.len() - 1
                }
            };

            let seq = c.next_seq;
            c.next_seq += 1;
            let prev_newest = c.newest;
            {
                let s = &mut c.slots[idx];
                s.seq = seq;
                s.when = when;
                s.blob = blob;
                s.unpacked = None;
                s.mini = None;
                s.prev = prev_newest;
                s.next = None;
            }
            if let Some(n) = prev_newest {
                c.slots[n].next = Some(idx);
            }
            c.newest = Some(idx);
            if c.oldest.is_none() {
                c.oldest = Some(idx);
            }
            c.count += 1;
            let added = c.slots[idx].blob.len();
            c.total_bytes += added;

            while (c.count > self.max_count || c.total_bytes > self.max_bytes)
                && c.oldest != c.newest
            {
                let old = c.oldest.expect("non-empty window");
                let next = c.slots[old].next.expect("oldest has a successor");
                c.slots[next].prev = None;
                c.oldest = Some(next);
                c.count -= 1;
                let removed = c.slots[old].blob.len();
                c.total_bytes -= removed;

                let free = c.free;
                let s = &mut c.slots[old];
                s.blob = Bytes::new();
                s.unpacked = None;
                s.mini = None;
                s.prev = None;
                s.next = free;
                c.free = Some(old);
            }

            c.handle(idx)
        };
        self.notify.notify_waiters();
        handle
    }

    pub fn get_newest(&self) -> Option<FrameHandle> {
        let c = self.chain.lock().unwrap();
        c.newest.map(|i| c.handle(i))
    }

    /// First frame strictly newer than `t`, scanning from the oldest.
    pub fn get_after(&self, t: DateTime<Local>) -> Option<FrameHandle> {
        let c = self.chain.lock().unwrap();
        let mut cur = c.oldest;
        while let Some(idx) = cur {
            if c.slots[idx].when > t {
                return Some(c.handle(idx));
            }
            cur = c.slots[idx].next;
        }
        None
    }

    /// Newest frame strictly older than `t`, scanning from the newest.
    pub fn get_before(&self, t: DateTime<Local>) -> Option<FrameHandle> {
        let c = self.chain.lock().unwrap();
        let mut cur = c.newest;
        while let Some(idx) = cur {
            if c.slots[idx].when < t {
                return Some(c.handle(idx));
            }
            cur = c.slots[idx].prev;
        }
        None
    }

    /// Like [`get_after`](Self::get_after), waiting for a qualifying frame
    /// to arrive when none exists yet. Cancel by dropping the future.
    pub async fn wait_after(&self, t: DateTime<Local>) -> FrameHandle {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            // Register interest before checking so a push between the
            // check and the await cannot be lost.
            notified.as_mut().enable();
            if let Some(h) = self.get_after(t) {
                return h;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Waits until the newest frame differs from `prev_seq` and returns it.
    /// `None` accepts any frame.
    pub async fn wait_newer(&self, prev_seq: Option<u64>) -> FrameHandle {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            notified.as_mut().enable();
            {
                let c = self.chain.lock().unwrap();
                if let Some(idx) = c.newest {
                    if prev_seq != Some(c.slots[idx].seq) {
                        return c.handle(idx);
                    }
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Cached decimated image for a frame, if it is still in the window.
    pub fn cached_mini(&self, seq: u64) -> Option<Arc<YcbcrImage>> {
        let c = self.chain.lock().unwrap();
        c.find_seq(seq).and_then(|i| c.slots[i].mini.clone())
    }

    /// Stores decode results on a frame's slot; a no-op once the frame has
    /// been evicted.
    pub fn store_images(
        &self,
        seq: u64,
        unpacked: Option<Arc<DecodedImage>>,
        mini: Option<Arc<YcbcrImage>>,
    ) {
        let mut c = self.chain.lock().unwrap();
        if let Some(idx) = c.find_seq(seq) {
            let s = &mut c.slots[idx];
            if unpacked.is_some() {
                s.unpacked = unpacked;
            }
            if mini.is_some() {
                s.mini = mini;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chain.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.chain.lock().unwrap().total_bytes
    }

    /// Number of recycled slots currently on the free list.
    pub fn free_len(&self) -> usize {
        let c = self.chain.lock().unwrap();
        let mut n = 0;
        let mut cur = c.free;
        while let Some(idx) = cur {
            n += 1;
            cur = c.slots[idx].next;
        }
        n
    }
}
