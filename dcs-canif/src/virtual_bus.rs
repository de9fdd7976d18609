//! In-memory virtual channel.
//!
//! [`pair`] yields two connected endpoints; whatever one side writes the
//! other side reads. An endpoint implements both [`DirectBus`] and
//! [`NetBus`] so the same channel can stand in for either adapter family
//! in tests and demos.

use crate::{bitrate_supported, BusError, ConnectState, DirectBus, Frame, FrameCallback, NetBus};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Mirrors the receive buffer depth of real adapter firmware; a telegram
/// arriving at a full buffer is discarded.
const QUEUE_DEPTH: usize = 1000;

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Frame>>,
    cond: Condvar,
}

impl Shared {
    fn push(&self, frame: Frame) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= QUEUE_DEPTH {
            return;
        }
        queue.push_back(frame);
        self.cond.notify_all();
    }

    fn pop(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(frame) = queue.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (q, _) = self.cond.wait_timeout(queue, deadline - now).unwrap();
            queue = q;
        }
    }
}

/// One endpoint of a virtual channel.
pub struct VirtualChannel {
    inbound: Arc<Shared>,
    outbound: Arc<Shared>,
    open: bool,
    pump: Option<(Arc<AtomicBool>, thread::JoinHandle<()>)>,
}

/// Creates the two connected endpoints of a virtual channel.
pub fn pair() -> (VirtualChannel, VirtualChannel) {
    let a = Arc::new(Shared::default());
    let b = Arc::new(Shared::default());
    (
        VirtualChannel {
            inbound: Arc::clone(&a),
            outbound: Arc::clone(&b),
            open: false,
            pump: None,
        },
        VirtualChannel {
            inbound: b,
            outbound: a,
            open: false,
            pump: None,
        },
    )
}

impl VirtualChannel {
    fn check_open(&self) -> Result<(), BusError> {
        if self.open {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }

    fn stop_pump(&mut self) {
        if let Some((stop, handle)) = self.pump.take() {
            stop.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
    }
}

impl DirectBus for VirtualChannel {
    fn open(&mut self, bitrate: u32) -> Result<(), BusError> {
        if !bitrate_supported(bitrate) {
            return Err(BusError::Bitrate(bitrate));
        }
        self.open = true;
        Ok(())
    }

    fn write(&mut self, frame: &Frame, _timeout: Duration) -> Result<(), BusError> {
        self.check_open()?;
        self.outbound.push(frame.clone());
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        self.check_open()?;
        Ok(self.inbound.pop(timeout))
    }

    fn close(&mut self) -> Result<(), BusError> {
        self.stop_pump();
        self.open = false;
        Ok(())
    }
}

impl NetBus for VirtualChannel {
    fn open(&mut self, bitrate: u32) -> Result<(), BusError> {
        DirectBus::open(self, bitrate)
    }

    fn write(&mut self, frame: &Frame) -> Result<(), BusError> {
        self.check_open()?;
        self.outbound.push(frame.clone());
        Ok(())
    }

    fn set_callback(&mut self, callback: Option<FrameCallback>) -> Result<(), BusError> {
        self.stop_pump();
        let mut callback = match callback {
            Some(cb) => cb,
            None => return Ok(()),
        };
        self.check_open()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let inbound = Arc::clone(&self.inbound);
        let handle = thread::spawn(move || {
            log::debug!("Virtual channel callback pump up");
            while !stop_flag.load(Ordering::SeqCst) {
                if let Some(frame) = inbound.pop(Duration::from_millis(100)) {
                    callback(frame);
                }
            }
            log::debug!("Virtual channel callback pump down");
        });
        self.pump = Some((stop, handle));
        Ok(())
    }

    fn connect_state(&self) -> ConnectState {
        if self.open {
            ConnectState::Connected
        } else {
            ConnectState::Disconnected
        }
    }

    fn close(&mut self) -> Result<(), BusError> {
        DirectBus::close(self)
    }
}

impl Drop for VirtualChannel {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
