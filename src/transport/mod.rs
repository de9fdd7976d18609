//! Frame transports over the two adapter families.
//!
//! A [`Transport`] hides the vendor split behind one message-frame
//! interface: `send` plus asynchronous delivery of every received frame
//! into the shared [`RxQueue`]. The [`DirectTransport`] drives a blocking
//! PCI/USB adapter from a background thread; the [`NetTransport`] hooks
//! the receive callback of a networked adapter.

mod direct;
mod net;

pub use self::direct::DirectTransport;
pub use self::net::NetTransport;

use crate::rx::RxQueue;
use crate::{Error, Result};
use dcs_canif::{bitrate_supported, ConnectState, DirectBus, Frame, NetBus, TRACE_HEADER};
use std::sync::Arc;
use std::time::Duration;

/// Blocking-receive window of the direct reader thread; bounds how long a
/// shutdown request can linger.
pub(crate) const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// One bus channel, either adapter family.
pub trait Transport: Send + Sync {
    /// Connects to the device and starts frame delivery.
    fn open(&self) -> Result<()>;

    /// Transmits one frame. The direct variant blocks until the adapter
    /// accepted the frame or `timeout` elapsed; the networked variant
    /// enqueues into the adapter's send buffer and returns.
    fn send(&self, frame: &Frame, timeout: Duration) -> Result<()>;

    /// Stops frame delivery and releases the handle. Idempotent; a second
    /// call reports success.
    fn close(&self) -> Result<()>;

    fn state(&self) -> ConnectState;
}

pub(crate) fn trace_incoming(frame: &Frame) {
    if frame.flags.is_error() {
        log::error!("*** error frame received ***");
    } else {
        log::debug!("{}", frame);
    }
}

/// Builds transports for one configured bit rate.
///
/// Created once at startup and passed by reference wherever a channel has
/// to be brought up; there is no hidden global holding the adapter layer.
pub struct TransportFactory {
    bitrate: u32,
}

impl TransportFactory {
    pub fn new(bitrate: u32) -> Result<TransportFactory> {
        if !bitrate_supported(bitrate) {
            log::error!("Bit rate {} bit/s is not in the allow-list", bitrate);
            return Err(Error::TransportOpen);
        }
        Ok(TransportFactory { bitrate })
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Wraps a directly attached adapter. 800 kbit/s is not available on
    /// this adapter family.
    pub fn direct(
        &self,
        bus: Box<dyn DirectBus>,
        rx: Arc<RxQueue>,
    ) -> Result<Arc<DirectTransport>> {
        if self.bitrate == 800_000 {
            log::error!("800 kbit/s is not supported on direct adapters");
            return Err(Error::TransportOpen);
        }
        log::debug!("{}", TRACE_HEADER);
        Ok(Arc::new(DirectTransport::new(bus, rx, self.bitrate)))
    }

    /// Wraps a networked adapter.
    pub fn networked(&self, bus: Box<dyn NetBus>, rx: Arc<RxQueue>) -> Arc<NetTransport> {
        log::debug!("{}", TRACE_HEADER);
        Arc::new(NetTransport::new(bus, rx, self.bitrate))
    }
}
