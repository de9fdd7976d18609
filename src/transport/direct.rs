//! Transport over a directly attached (PCI/USB) adapter.

use super::{trace_incoming, Transport, RECV_TIMEOUT};
use crate::rx::RxQueue;
use crate::{Error, Result};
use dcs_canif::{BusError, ConnectState, DirectBus, Frame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Direct-adapter transport.
///
/// The vendor handle is not re-entrant, so every access goes through the
/// adapter mutex. `open` starts a background thread that performs blocking
/// receives with a one-second window and loops until shutdown; a fatal
/// adapter error sets the shutdown flag and poisons the receive queue so
/// that every waiter observes the loss.
pub struct DirectTransport {
    bus: Arc<Mutex<Box<dyn DirectBus>>>,
    rx: Arc<RxQueue>,
    shutdown: Arc<AtomicBool>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    connected: AtomicBool,
    bitrate: u32,
}

impl DirectTransport {
    pub(crate) fn new(bus: Box<dyn DirectBus>, rx: Arc<RxQueue>, bitrate: u32) -> DirectTransport {
        DirectTransport {
            bus: Arc::new(Mutex::new(bus)),
            rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            bitrate,
        }
    }

    fn spawn_reader(&self) -> thread::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let rx = Arc::clone(&self.rx);
        let shutdown = Arc::clone(&self.shutdown);
        thread::spawn(move || {
            log::debug!("Receive thread up");
            while !shutdown.load(Ordering::SeqCst) {
                let received = {
                    let mut bus = bus.lock().unwrap();
                    bus.read(RECV_TIMEOUT)
                };
                match received {
                    Ok(Some(mut frame)) => {
                        frame.stamp_now();
                        trace_incoming(&frame);
                        rx.push(frame);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("Fatal adapter error in receive loop: {}", e);
                        shutdown.store(true, Ordering::SeqCst);
                        rx.poison();
                        break;
                    }
                }
            }
            log::debug!("Receive thread down");
        })
    }
}

impl Transport for DirectTransport {
    fn open(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Opening direct channel at {} bit/s", self.bitrate);
        {
            let mut bus = self.bus.lock().unwrap();
            bus.open(self.bitrate).map_err(|e| {
                log::error!("Could not open direct channel: {}", e);
                Error::TransportOpen
            })?;
        }
        self.shutdown.store(false, Ordering::SeqCst);
        *self.reader.lock().unwrap() = Some(self.spawn_reader());
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, frame: &Frame, timeout: Duration) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::TransportLost);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::TransportSend);
        }
        let mut bus = self.bus.lock().unwrap();
        match bus.write(frame, timeout) {
            Ok(()) => Ok(()),
            Err(BusError::WriteTimeout) => Err(Error::RequestTimeout),
            Err(e) => {
                log::warn!("Adapter rejected frame: {}", e);
                Err(Error::TransportSend)
            }
        }
    }

    fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Closing direct channel");
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut bus = self.bus.lock().unwrap();
        let _ = bus.close();
        Ok(())
    }

    fn state(&self) -> ConnectState {
        // The direct adapter family only knows on and off.
        if self.connected.load(Ordering::SeqCst) && !self.shutdown.load(Ordering::SeqCst) {
            ConnectState::Connected
        } else {
            ConnectState::Disconnected
        }
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
