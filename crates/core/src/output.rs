//! Cleaned-audio output queue.

use crate::constants::FRAME_SIZE;
use crate::resync::Frame;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Upper bound on buffered output, in frames. The render callback normally
/// drains fast enough that this is never hit; if it stalls, the oldest
/// audio goes first.
const MAX_QUEUED_FRAMES: usize = 50;

/// Thread-safe FIFO of cleaned S16 samples, filled by the engine and
/// drained by the render callback.
pub struct OutputQueue {
    samples: Mutex<VecDeque<i16>>,
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputQueue {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(MAX_QUEUED_FRAMES * FRAME_SIZE)),
        }
    }

    /// Append a cleaned frame. Returns the number of whole frames evicted
    /// from the head to stay under the cap.
    pub fn push(&self, frame: Frame) -> usize {
        let Ok(mut samples) = self.samples.lock() else {
            return 0;
        };
        let mut evicted = 0;
        while samples.len() + FRAME_SIZE > MAX_QUEUED_FRAMES * FRAME_SIZE {
            samples.drain(..FRAME_SIZE);
            evicted += 1;
        }
        samples.extend(frame.samples().iter().copied());
        evicted
    }

    /// Copy up to `max` samples from the head into `dst`, removing them.
    /// Returns the number copied; 0 means the caller should render silence.
    pub fn pull(&self, dst: &mut [i16], max: usize) -> usize {
        let Ok(mut samples) = self.samples.lock() else {
            return 0;
        };
        let count = max.min(dst.len()).min(samples.len());
        for (out, sample) in dst.iter_mut().zip(samples.drain(..count)) {
            *out = sample;
        }
        count
    }

    pub fn clear(&self) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_frame(value: i16) -> Frame {
        Frame::from([value; FRAME_SIZE])
    }

    #[test]
    fn test_pull_from_empty_returns_zero() {
        let queue = OutputQueue::new();
        let mut dst = [0i16; 64];
        assert_eq!(queue.pull(&mut dst, 64), 0);
    }

    #[test]
    fn test_push_then_pull_round_trips_in_order() {
        let queue = OutputQueue::new();
        assert_eq!(queue.push(flat_frame(1)), 0);
        assert_eq!(queue.push(flat_frame(2)), 0);

        let mut dst = [0i16; FRAME_SIZE];
        assert_eq!(queue.pull(&mut dst, FRAME_SIZE), FRAME_SIZE);
        assert!(dst.iter().all(|&s| s == 1));
        assert_eq!(queue.pull(&mut dst, FRAME_SIZE), FRAME_SIZE);
        assert!(dst.iter().all(|&s| s == 2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_pulls_drain_the_head() {
        let queue = OutputQueue::new();
        queue.push(flat_frame(7));
        let mut dst = [0i16; 100];
        assert_eq!(queue.pull(&mut dst, 100), 100);
        assert_eq!(queue.len(), FRAME_SIZE - 100);
    }

    #[test]
    fn test_pull_is_bounded_by_dst_and_max() {
        let queue = OutputQueue::new();
        queue.push(flat_frame(3));
        let mut dst = [0i16; 32];
        assert_eq!(queue.pull(&mut dst, 1000), 32);
        let mut big = [0i16; 1000];
        assert_eq!(queue.pull(&mut big, 16), 16);
    }

    #[test]
    fn test_overflow_evicts_oldest_frames() {
        let queue = OutputQueue::new();
        for i in 0..MAX_QUEUED_FRAMES {
            assert_eq!(queue.push(flat_frame(i as i16)), 0);
        }
        assert_eq!(queue.push(flat_frame(999)), 1);
        assert_eq!(queue.len(), MAX_QUEUED_FRAMES * FRAME_SIZE);

        // Head is now frame 1; frame 0 was evicted.
        let mut dst = [0i16; FRAME_SIZE];
        queue.pull(&mut dst, FRAME_SIZE);
        assert!(dst.iter().all(|&s| s == 1));
    }

    #[test]
    fn test_clear_empties_the_queue() {
        let queue = OutputQueue::new();
        queue.push(flat_frame(5));
        queue.clear();
        assert!(queue.is_empty());
    }
}
