//! Transport over a networked adapter reached by TCP.

use super::{trace_incoming, Transport};
use crate::rx::RxQueue;
use crate::{Error, Result};
use dcs_canif::{BusError, ConnectState, Frame, NetBus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Networked-adapter transport.
///
/// Reception is callback driven: the vendor library invokes the registered
/// callback on a thread it owns, so the callback only stamps the frame and
/// pushes it into the receive queue. Sends are buffered by the adapter and
/// return immediately; a rejected send is reported as an explicit error
/// instead of being swallowed.
pub struct NetTransport {
    bus: Mutex<Box<dyn NetBus>>,
    rx: Arc<RxQueue>,
    opened: AtomicBool,
    bitrate: u32,
}

impl NetTransport {
    pub(crate) fn new(bus: Box<dyn NetBus>, rx: Arc<RxQueue>, bitrate: u32) -> NetTransport {
        NetTransport {
            bus: Mutex::new(bus),
            rx,
            opened: AtomicBool::new(false),
            bitrate,
        }
    }
}

impl Transport for NetTransport {
    fn open(&self) -> Result<()> {
        if self.opened.load(Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Opening networked channel at {} bit/s", self.bitrate);
        let mut bus = self.bus.lock().unwrap();
        bus.open(self.bitrate).map_err(|e| {
            log::error!("Could not open networked channel: {}", e);
            Error::TransportOpen
        })?;
        let rx = Arc::clone(&self.rx);
        bus.set_callback(Some(Box::new(move |mut frame| {
            frame.stamp_now();
            trace_incoming(&frame);
            rx.push(frame);
        })))
        .map_err(|e| {
            log::error!("Could not register receive callback: {}", e);
            Error::TransportOpen
        })?;
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, frame: &Frame, _timeout: Duration) -> Result<()> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(Error::TransportSend);
        }
        let mut bus = self.bus.lock().unwrap();
        match bus.write(frame) {
            Ok(()) => Ok(()),
            Err(BusError::Fatal) => {
                log::error!("Networked adapter is gone");
                self.rx.poison();
                Err(Error::TransportLost)
            }
            Err(e) => {
                log::warn!("Networked adapter rejected frame: {}", e);
                Err(Error::TransportSend)
            }
        }
    }

    fn close(&self) -> Result<()> {
        if !self.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Closing networked channel");
        let mut bus = self.bus.lock().unwrap();
        let _ = bus.set_callback(None);
        let _ = bus.close();
        Ok(())
    }

    fn state(&self) -> ConnectState {
        if !self.opened.load(Ordering::SeqCst) {
            return ConnectState::Uninitialized;
        }
        self.bus.lock().unwrap().connect_state()
    }
}

impl Drop for NetTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rx::WaitOutcome;
    use crate::transport::TransportFactory;
    use dcs_canif::{virtual_bus, DirectBus, FrameCallback};

    #[test]
    fn callback_frames_land_in_the_rx_queue() {
        let factory = TransportFactory::new(500_000).unwrap();
        let (channel, mut peer) = virtual_bus::pair();
        let rx = Arc::new(RxQueue::new());
        let transport = factory.networked(Box::new(channel), Arc::clone(&rx));
        transport.open().unwrap();
        assert_eq!(transport.state(), ConnectState::Connected);

        DirectBus::open(&mut peer, 500_000).unwrap();
        let frame = Frame::new(0x58A, &[0x60, 0, 0x22, 0x12, 0, 0, 0, 0]).unwrap();
        DirectBus::write(&mut peer, &frame, Duration::from_millis(10)).unwrap();

        let got = rx.take_match(Duration::from_secs(2), |f| f.cob_id == 0x58A);
        assert!(matches!(got, WaitOutcome::Matched(_)));
        transport.close().unwrap();
        assert_eq!(transport.state(), ConnectState::Uninitialized);
        transport.close().unwrap();
    }

    struct RejectingBus;

    impl NetBus for RejectingBus {
        fn open(&mut self, _bitrate: u32) -> std::result::Result<(), BusError> {
            Ok(())
        }
        fn write(&mut self, _frame: &Frame) -> std::result::Result<(), BusError> {
            Err(BusError::Write)
        }
        fn set_callback(
            &mut self,
            _callback: Option<FrameCallback>,
        ) -> std::result::Result<(), BusError> {
            Ok(())
        }
        fn connect_state(&self) -> ConnectState {
            ConnectState::Connected
        }
        fn close(&mut self) -> std::result::Result<(), BusError> {
            Ok(())
        }
    }

    #[test]
    fn rejected_send_is_an_explicit_error() {
        let factory = TransportFactory::new(125_000).unwrap();
        let rx = Arc::new(RxQueue::new());
        let transport = factory.networked(Box::new(RejectingBus), rx);
        transport.open().unwrap();
        let frame = Frame::new(0x601, &[0; 8]).unwrap();
        assert!(matches!(
            transport.send(&frame, Duration::from_millis(10)),
            Err(Error::TransportSend)
        ));
    }
}
