//! Pairing of microphone and reference frames.
//!
//! The echo canceller requires that any echo present in the mic signal has
//! already been handed over as reference audio. The resynchronizer enforces
//! this by buffering mic frames in a small queue and only releasing one when
//! a reference frame arrives to pair with it, so the reference leads the mic
//! by a nominal two frames (~20ms at 10ms frames).
//!
//! The queue fill level is controlled by a small state machine rather than a
//! plain bounded queue: persistent mic excess drops the oldest buffered
//! frame, persistent reference excess drops the incoming reference frame,
//! and jitter of up to two frames on either side is absorbed without drops.

use crate::constants::{FRAME_SIZE, NOMINAL_LAG};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One 10ms mono frame of S16 audio at the canonical rate.
///
/// Frames are strictly single-holder: they move from the assembler into the
/// resynchronizer queue, out to the echo engine, and into the output queue.
/// Dropping a frame releases its buffer immediately.
pub struct Frame(Box<[i16; FRAME_SIZE]>);

impl Frame {
    pub fn silence() -> Self {
        Self(Box::new([0; FRAME_SIZE]))
    }

    pub fn samples(&self) -> &[i16] {
        &self.0[..]
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.0[..]
    }
}

impl From<[i16; FRAME_SIZE]> for Frame {
    fn from(samples: [i16; FRAME_SIZE]) -> Self {
        Self(Box::new(samples))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame[{}; first={}]", FRAME_SIZE, self.0[0])
    }
}

/// A unit of work for the echo engine.
#[derive(Debug)]
pub enum PairedChunk {
    /// No paired work this call.
    Empty,
    /// Mic-only frame (echo cancellation disabled).
    Mic(Frame),
    /// A mic frame together with the reference frame that precedes it.
    Pair { mic: Frame, reference: Frame },
}

impl PairedChunk {
    pub fn is_empty(&self) -> bool {
        matches!(self, PairedChunk::Empty)
    }
}

/// Queue fill control states. The digit tracks the mic queue depth; the
/// a/b suffix distinguishes whether the queue is recovering or draining
/// through that depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncState {
    S0,
    S1a,
    S1b,
    S2,
    S3,
    S4a,
    S4b,
    S5,
}

struct Inner {
    queue: VecDeque<Frame>,
    state: ResyncState,
}

/// Pairs mic frames with reference frames under bounded queue occupancy.
///
/// Thread-safe: `push_mic` and `push_ref` are called from two independently
/// clocked capture callbacks. A single mutex covers the queue and the state;
/// it is held only for the transition plus dequeue, never for DSP work.
pub struct Resynchronizer {
    inner: Mutex<Inner>,
    debug: AtomicBool,
}

impl Default for Resynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Resynchronizer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(NOMINAL_LAG * 2 + 2),
                state: ResyncState::S0,
            }),
            debug: AtomicBool::new(false),
        }
    }

    /// Buffer a mic frame. Returns true if the queue overflowed and the
    /// oldest buffered frame was dropped to make room; the frame just
    /// pushed is kept so the queue stays fresh.
    pub fn push_mic(&self, frame: Frame) -> bool {
        use ResyncState::*;
        let (dropped, depth, state) = {
            let Ok(mut inner) = self.inner.lock() else {
                return false;
            };
            inner.queue.push_back(frame);
            let dropped = matches!(inner.state, S4b | S5);
            inner.state = match inner.state {
                S0 => S1a,
                S1a | S1b => S2,
                S2 => S3,
                S3 => S4a,
                S4a => S5,
                full @ (S4b | S5) => full,
            };
            if dropped {
                inner.queue.pop_front();
            }
            (dropped, inner.queue.len(), inner.state)
        };
        if self.debug.load(Ordering::Relaxed) {
            if dropped {
                log::debug!("resync: dropped mic frame on overflow");
            }
            log::debug!("resync: +mic depth={depth} state={state:?}");
        }
        dropped
    }

    /// Pair a reference frame with the oldest buffered mic frame. Returns
    /// [`PairedChunk::Empty`] when the queue is starved, in which case the
    /// reference frame is discarded.
    pub fn push_ref(&self, frame: Frame) -> PairedChunk {
        use ResyncState::*;
        let (result, depth, state) = {
            let Ok(mut inner) = self.inner.lock() else {
                return PairedChunk::Empty;
            };
            let starved = matches!(inner.state, S0 | S1a);
            inner.state = match inner.state {
                starving @ (S0 | S1a) => starving,
                S1b => S0,
                S2 => S1b,
                S3 => S2,
                S4a | S4b => S3,
                S5 => S4b,
            };
            let result = if starved {
                PairedChunk::Empty
            } else {
                match inner.queue.pop_front() {
                    Some(mic) => PairedChunk::Pair {
                        mic,
                        reference: frame,
                    },
                    None => PairedChunk::Empty,
                }
            };
            (result, inner.queue.len(), inner.state)
        };
        if self.debug.load(Ordering::Relaxed) {
            if result.is_empty() {
                log::debug!("resync: dropped reference frame on underflow");
            }
            log::debug!("resync: -ref depth={depth} state={state:?}");
        }
        result
    }

    /// Empty the queue and return to the starved state, releasing every
    /// buffered frame.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.queue.clear();
            inner.state = ResyncState::S0;
        }
    }

    /// The mic lag this resynchronizer aims for, in frames. The echo
    /// canceller tail must cover at least this much extra delay.
    pub fn nominal_lag(&self) -> usize {
        NOMINAL_LAG
    }

    pub fn state(&self) -> ResyncState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(ResyncState::S0)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().map(|inner| inner.queue.len()).unwrap_or(0)
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }
}
