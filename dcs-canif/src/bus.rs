use crate::{BusError, ConnectState, Frame};
use std::time::Duration;

/// Callback invoked by a networked adapter for every incoming frame.
///
/// Runs on a thread owned by the adapter layer and must not block.
pub type FrameCallback = Box<dyn FnMut(Frame) + Send>;

/// Raw surface of a directly attached (PCI/USB) adapter.
///
/// The handle behind an implementation is single threaded; the transport
/// layer serializes all access through one mutex. `read` blocks for at most
/// the given timeout and reports an elapsed timeout as `Ok(None)` so the
/// caller can poll its shutdown flag between attempts.
pub trait DirectBus: Send {
    fn open(&mut self, bitrate: u32) -> Result<(), BusError>;

    /// Blocking transmit; returns once the adapter accepted the frame or
    /// the timeout elapsed (`BusError::WriteTimeout`).
    fn write(&mut self, frame: &Frame, timeout: Duration) -> Result<(), BusError>;

    fn read(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError>;

    fn close(&mut self) -> Result<(), BusError>;
}

/// Raw surface of a networked adapter reached over TCP.
///
/// Writes are buffered by the adapter and return immediately. Reception is
/// callback based: after `set_callback(Some(..))` the adapter invokes the
/// callback from its own thread for every telegram; `set_callback(None)`
/// deregisters it.
pub trait NetBus: Send {
    fn open(&mut self, bitrate: u32) -> Result<(), BusError>;

    fn write(&mut self, frame: &Frame) -> Result<(), BusError>;

    fn set_callback(&mut self, callback: Option<FrameCallback>) -> Result<(), BusError>;

    fn connect_state(&self) -> ConnectState;

    fn close(&mut self) -> Result<(), BusError>;
}
