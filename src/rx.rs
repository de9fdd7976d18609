//! Shared receive queue between the transports and the SDO waiters.
//!
//! A bounded ring of timestamped frames. One producer per transport pushes
//! at the back; consumers scan linearly from the front and remove their
//! match by position. The lock is never held across I/O; waiters block on
//! a condition variable that every push signals.

use dcs_canif::Frame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Queue depth; on overflow the oldest frame is dropped.
pub const RX_QUEUE_CAPACITY: usize = 1000;

/// Result of waiting for a matching frame.
#[derive(Debug)]
pub enum WaitOutcome {
    Matched(Frame),
    TimedOut,
    /// The producing transport saw a fatal adapter error.
    Lost,
}

#[derive(Default)]
pub struct RxQueue {
    frames: Mutex<VecDeque<Frame>>,
    cond: Condvar,
    dropped: AtomicU64,
    lost: AtomicBool,
}

impl RxQueue {
    pub fn new() -> RxQueue {
        RxQueue::default()
    }

    /// Appends a frame, dropping the oldest one when full.
    pub fn push(&self, frame: Frame) {
        let mut frames = self.frames.lock().unwrap();
        if frames.len() >= RX_QUEUE_CAPACITY {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        drop(frames);
        self.cond.notify_all();
    }

    /// Marks the queue as orphaned after a fatal transport error and wakes
    /// every waiter.
    pub fn poison(&self) {
        self.lost.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Number of frames lost to overflow so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scans for the first frame matching `pred` and removes it from the
    /// queue. Waits up to `timeout` for one to arrive; a zero timeout
    /// checks once and returns immediately.
    pub fn take_match<F>(&self, timeout: Duration, pred: F) -> WaitOutcome
    where
        F: Fn(&Frame) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock().unwrap();
        loop {
            if let Some(pos) = frames.iter().position(|f| pred(f)) {
                // Removal by position: unmatched frames stay for the other
                // waiters.
                return WaitOutcome::Matched(frames.remove(pos).expect("position just found"));
            }
            if self.is_lost() {
                return WaitOutcome::Lost;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let (guard, _) = self.cond.wait_timeout(frames, deadline - now).unwrap();
            frames = guard;
        }
    }

    /// Drops every queued frame; used when a scan restarts.
    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frame(cob_id: u16, data: &[u8]) -> Frame {
        Frame::new(cob_id, data).unwrap()
    }

    #[test]
    fn matched_frames_are_removed_others_stay() {
        let q = RxQueue::new();
        q.push(frame(0x181, &[1]));
        q.push(frame(0x58A, &[0x43, 0, 0x10, 0, 1, 0, 0, 0]));
        q.push(frame(0x182, &[2]));
        let got = q.take_match(Duration::from_millis(0), |f| f.cob_id == 0x58A);
        assert!(matches!(got, WaitOutcome::Matched(f) if f.cob_id == 0x58A));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn zero_timeout_never_waits() {
        let q = RxQueue::new();
        let start = Instant::now();
        let got = q.take_match(Duration::from_millis(0), |_| true);
        assert!(matches!(got, WaitOutcome::TimedOut));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let q = RxQueue::new();
        for i in 0..RX_QUEUE_CAPACITY {
            q.push(frame(0x181, &[(i % 256) as u8]));
        }
        assert_eq!(q.dropped_frames(), 0);
        q.push(frame(0x182, &[0xAA]));
        assert_eq!(q.len(), RX_QUEUE_CAPACITY);
        assert_eq!(q.dropped_frames(), 1);
        // The oldest frame is the one that went away.
        let gone = q.take_match(Duration::from_millis(0), |f| f.data() == &[0u8][..]);
        assert!(matches!(gone, WaitOutcome::TimedOut));
        q.push(frame(0x183, &[0xBB]));
        assert_eq!(q.dropped_frames(), 2);
    }

    #[test]
    fn waiters_wake_on_push() {
        let q = Arc::new(RxQueue::new());
        let q2 = Arc::clone(&q);
        let waiter = thread::spawn(move || {
            q2.take_match(Duration::from_secs(5), |f| f.cob_id == 0x58A)
        });
        thread::sleep(Duration::from_millis(20));
        q.push(frame(0x58A, &[0x60, 0, 0, 0, 0, 0, 0, 0]));
        assert!(matches!(waiter.join().unwrap(), WaitOutcome::Matched(_)));
    }

    #[test]
    fn poison_wakes_waiters_with_lost() {
        let q = Arc::new(RxQueue::new());
        let q2 = Arc::clone(&q);
        let waiter =
            thread::spawn(move || q2.take_match(Duration::from_secs(5), |_| false));
        thread::sleep(Duration::from_millis(20));
        q.poison();
        assert!(matches!(waiter.join().unwrap(), WaitOutcome::Lost));
    }
}
