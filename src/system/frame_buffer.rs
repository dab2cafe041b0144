//! Bounded reorder window in front of the tracker.
//!
//! Capture timestamps jitter: a frame may arrive shortly after a newer one.
//! Frames are held until they are `window_ns` older than the newest frame
//! seen (or the buffer is full) and released in timestamp order. A frame
//! older than one already released is late and dropped.

use std::collections::BTreeMap;

use crate::tracking::frame::Frame;

/// What happened to an ingested frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Buffered,
    /// Older than a frame already handed to tracking.
    Late,
    /// Same timestamp as a buffered or released frame.
    Duplicate,
}

pub struct ReorderBuffer {
    window_ns: u64,
    capacity: usize,
    pending: BTreeMap<u64, Frame>,
    newest_ns: Option<u64>,
    released_ns: Option<u64>,
}

impl ReorderBuffer {
    pub fn new(window_ns: u64, capacity: usize) -> Self {
        Self {
            window_ns,
            capacity: capacity.max(1),
            pending: BTreeMap::new(),
            newest_ns: None,
            released_ns: None,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Admission {
        let ts = frame.timestamp_ns;
        match self.released_ns {
            Some(r) if ts < r => return Admission::Late,
            Some(r) if ts == r => return Admission::Duplicate,
            _ => {}
        }
        if self.pending.contains_key(&ts) {
            return Admission::Duplicate;
        }
        self.newest_ns = Some(self.newest_ns.map_or(ts, |n| n.max(ts)));
        self.pending.insert(ts, frame);
        Admission::Buffered
    }

    /// Frames that left the window, oldest first.
    pub fn pop_ready(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        let Some(newest) = self.newest_ns else {
            return out;
        };
        while let Some((&ts, _)) = self.pending.first_key_value() {
            let expired = newest.saturating_sub(ts) >= self.window_ns;
            if !expired && self.pending.len() <= self.capacity {
                break;
            }
            if let Some((ts, frame)) = self.pending.pop_first() {
                self.released_ns = Some(ts);
                out.push(frame);
            }
        }
        out
    }

    /// Release everything, oldest first.
    pub fn drain(&mut self) -> Vec<Frame> {
        let frames: Vec<Frame> = std::mem::take(&mut self.pending).into_values().collect();
        if let Some(last) = frames.last() {
            self.released_ns = Some(last.timestamp_ns);
        }
        frames
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(ts: u64) -> Frame {
        Frame::new(ts, RgbImage::new(4, 4))
    }

    fn stamps(frames: &[Frame]) -> Vec<u64> {
        frames.iter().map(|f| f.timestamp_ns).collect()
    }

    #[test]
    fn test_jitter_is_reordered() {
        let mut buf = ReorderBuffer::new(10, 8);
        assert_eq!(buf.push(frame(100)), Admission::Buffered);
        assert_eq!(buf.push(frame(95)), Admission::Buffered);
        assert!(buf.pop_ready().is_empty());
        buf.push(frame(108));
        assert_eq!(stamps(&buf.pop_ready()), vec![95]);
        buf.push(frame(120));
        assert_eq!(stamps(&buf.pop_ready()), vec![100, 108]);
        assert_eq!(stamps(&buf.drain()), vec![120]);
    }

    #[test]
    fn test_late_and_duplicate_frames_dropped() {
        let mut buf = ReorderBuffer::new(0, 8);
        buf.push(frame(50));
        assert_eq!(stamps(&buf.pop_ready()), vec![50]);
        assert_eq!(buf.push(frame(40)), Admission::Late);
        assert_eq!(buf.push(frame(50)), Admission::Duplicate);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_capacity_bounds_buffer() {
        let mut buf = ReorderBuffer::new(u64::MAX, 2);
        for ts in [1, 2, 3, 4] {
            buf.push(frame(ts));
        }
        assert_eq!(stamps(&buf.pop_ready()), vec![1, 2]);
        assert_eq!(buf.len(), 2);
    }
}
