//! Expedited SDO request/response engine.
//!
//! All dictionary reads and writes on the bus go through [`SdoClient`]. It
//! builds the 8-byte request frames, matches responses out of the shared
//! receive queue by COB-ID, command specifier and echoed address, enforces
//! per-request timeouts and decodes abort codes. Only the expedited
//! transfer variant is spoken; segmented responses never match.

use crate::rx::{RxQueue, WaitOutcome};
use crate::transport::Transport;
use crate::{AbortCode, Error, Result};
use dcs_canif::{sdo_request_id, sdo_response_id, Frame, NodeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Window for handing a request frame to the adapter.
pub const SDO_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Upload (read) initiate request.
const CMD_UPLOAD_REQUEST: u8 = 0x40;
/// Download (write) initiate response.
const CMD_DOWNLOAD_RESPONSE: u8 = 0x60;
/// Abort from the server.
const CMD_ABORT: u8 = 0x80;
/// Expedited upload responses for 4..=1 valid bytes, plus abort.
const UPLOAD_RESPONSES: [u8; 5] = [CMD_ABORT, 0x43, 0x47, 0x4B, 0x4F];

#[derive(Default)]
struct Counters {
    read_total: AtomicU64,
    read_request_timeout: AtomicU64,
    read_response_timeout: AtomicU64,
    read_abort: AtomicU64,
    write_total: AtomicU64,
    write_request_timeout: AtomicU64,
    write_response_timeout: AtomicU64,
    write_abort: AtomicU64,
}

/// Point-in-time view of the engine counters, for tests and operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoCounters {
    pub sdo_read_total: u64,
    pub sdo_read_request_timeout: u64,
    pub sdo_read_response_timeout: u64,
    pub sdo_read_abort: u64,
    pub sdo_write_total: u64,
    pub sdo_write_request_timeout: u64,
    pub sdo_write_response_timeout: u64,
    pub sdo_write_abort: u64,
}

/// Client half of the SDO protocol.
///
/// At most one SDO exchange per node id is outstanding at any time; a
/// per-node mutex is held from request send to response match or timeout.
/// Exchanges on different nodes run concurrently and are disambiguated by
/// their response COB-ID.
pub struct SdoClient {
    transport: Arc<dyn Transport>,
    rx: Arc<RxQueue>,
    node_locks: Vec<Mutex<()>>,
    counters: Counters,
}

impl SdoClient {
    pub fn new(transport: Arc<dyn Transport>, rx: Arc<RxQueue>) -> SdoClient {
        SdoClient {
            transport,
            rx,
            node_locks: (0..NodeId::MAX).map(|_| Mutex::new(())).collect(),
            counters: Counters::default(),
        }
    }

    pub fn counters(&self) -> SdoCounters {
        let c = &self.counters;
        SdoCounters {
            sdo_read_total: c.read_total.load(Ordering::Relaxed),
            sdo_read_request_timeout: c.read_request_timeout.load(Ordering::Relaxed),
            sdo_read_response_timeout: c.read_response_timeout.load(Ordering::Relaxed),
            sdo_read_abort: c.read_abort.load(Ordering::Relaxed),
            sdo_write_total: c.write_total.load(Ordering::Relaxed),
            sdo_write_request_timeout: c.write_request_timeout.load(Ordering::Relaxed),
            sdo_write_response_timeout: c.write_response_timeout.load(Ordering::Relaxed),
            sdo_write_abort: c.write_abort.load(Ordering::Relaxed),
        }
    }

    /// Reads `index:sub` of `node` as an expedited upload.
    ///
    /// The decoded value is the little-endian integer formed by the valid
    /// payload bytes of the response.
    pub fn read(&self, node: NodeId, index: u16, sub: u8, timeout: Duration) -> Result<u32> {
        let _serial = self.node_locks[node.index()].lock().unwrap();
        self.counters.read_total.fetch_add(1, Ordering::Relaxed);
        log::debug!("SDO read {:#06X}:{:02X} of node {}", index, sub, node);

        let mut payload = [0u8; 8];
        payload[0] = CMD_UPLOAD_REQUEST;
        payload[1..3].copy_from_slice(&index.to_le_bytes());
        payload[3] = sub;
        let request = Frame::new(sdo_request_id(node), &payload).expect("valid SDO frame");
        self.transport
            .send(&request, SDO_SEND_TIMEOUT)
            .map_err(|e| {
                if matches!(e, Error::RequestTimeout) {
                    self.counters.read_request_timeout.fetch_add(1, Ordering::Relaxed);
                }
                e
            })?;

        let response_id = sdo_response_id(node);
        let outcome = self.rx.take_match(timeout, |f| {
            !f.flags.is_error()
                && f.cob_id == response_id
                && f.dlc == 8
                && UPLOAD_RESPONSES.contains(&f.data()[0])
                && f.data()[1..3] == index.to_le_bytes()
                && f.data()[3] == sub
        });
        match outcome {
            WaitOutcome::Matched(frame) => {
                let data = frame.data();
                if data[0] == CMD_ABORT {
                    let code = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                    self.counters.read_abort.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "SDO read of {:#06X}:{:02X} aborted: {} ({:#010X})",
                        index,
                        sub,
                        AbortCode::describe(code),
                        code
                    );
                    return Err(Error::SdoAbort(code));
                }
                let valid = 4 - ((data[0] >> 2) & 0b11) as usize;
                let mut raw = [0u8; 4];
                raw[..valid].copy_from_slice(&data[4..4 + valid]);
                let value = u32::from_le_bytes(raw);
                log::debug!("SDO read got {:#X}", value);
                Ok(value)
            }
            WaitOutcome::TimedOut => {
                self.counters.read_response_timeout.fetch_add(1, Ordering::Relaxed);
                Err(Error::ResponseTimeout)
            }
            WaitOutcome::Lost => Err(Error::TransportLost),
        }
    }

    /// Writes `value` to `index:sub` of `node` as an expedited download.
    ///
    /// The indicated data size is the minimum number of bytes holding the
    /// value.
    pub fn write(
        &self,
        node: NodeId,
        index: u16,
        sub: u8,
        value: u32,
        timeout: Duration,
    ) -> Result<()> {
        let _serial = self.node_locks[node.index()].lock().unwrap();
        self.counters.write_total.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "SDO write {:#X} to {:#06X}:{:02X} of node {}",
            value,
            index,
            sub,
            node
        );

        let datasize = expedited_len(value);
        let mut payload = [0u8; 8];
        // Expedited download initiate with indicated size.
        payload[0] = 0b0010_0011 | ((4 - datasize) << 2);
        payload[1..3].copy_from_slice(&index.to_le_bytes());
        payload[3] = sub;
        payload[4..8].copy_from_slice(&value.to_le_bytes());
        let request = Frame::new(sdo_request_id(node), &payload).expect("valid SDO frame");
        self.transport
            .send(&request, SDO_SEND_TIMEOUT)
            .map_err(|e| {
                if matches!(e, Error::RequestTimeout) {
                    self.counters.write_request_timeout.fetch_add(1, Ordering::Relaxed);
                }
                e
            })?;

        let response_id = sdo_response_id(node);
        let outcome = self.rx.take_match(timeout, |f| {
            !f.flags.is_error()
                && f.cob_id == response_id
                && f.dlc == 8
                && (f.data()[0] == CMD_DOWNLOAD_RESPONSE || f.data()[0] == CMD_ABORT)
                && f.data()[1..3] == index.to_le_bytes()
                && f.data()[3] == sub
        });
        match outcome {
            WaitOutcome::Matched(frame) => {
                let data = frame.data();
                if data[0] == CMD_ABORT {
                    let code = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                    self.counters.write_abort.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "SDO write to {:#06X}:{:02X} aborted: {} ({:#010X})",
                        index,
                        sub,
                        AbortCode::describe(code),
                        code
                    );
                    return Err(Error::SdoAbort(code));
                }
                log::debug!("SDO write acknowledged");
                Ok(())
            }
            WaitOutcome::TimedOut => {
                self.counters.write_response_timeout.fetch_add(1, Ordering::Relaxed);
                Err(Error::ResponseTimeout)
            }
            WaitOutcome::Lost => Err(Error::TransportLost),
        }
    }
}

/// Minimum number of bytes holding `value`, in 1..=4.
pub(crate) fn expedited_len(value: u32) -> u8 {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rx::RxQueue;
    use crate::transport::TransportFactory;
    use dcs_canif::{virtual_bus, DirectBus, VirtualChannel};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Scripted bus peer: answers every request frame through `script`.
    fn spawn_responder<F>(
        mut peer: VirtualChannel,
        stop: Arc<AtomicBool>,
        script: F,
    ) -> thread::JoinHandle<()>
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        let mut script = script;
        thread::spawn(move || {
            DirectBus::open(&mut peer, 125_000).unwrap();
            while !stop.load(Ordering::SeqCst) {
                if let Ok(Some(request)) = peer.read(Duration::from_millis(20)) {
                    for response in script(&request) {
                        peer.write(&response, Duration::from_millis(20)).unwrap();
                    }
                }
            }
        })
    }

    struct Rig {
        client: Arc<SdoClient>,
        rx: Arc<RxQueue>,
        stop: Arc<AtomicBool>,
        responder: Option<thread::JoinHandle<()>>,
    }

    impl Rig {
        fn new<F>(script: F) -> Rig
        where
            F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
        {
            let factory = TransportFactory::new(125_000).unwrap();
            let (channel, peer) = virtual_bus::pair();
            let rx = Arc::new(RxQueue::new());
            let transport = factory.direct(Box::new(channel), Arc::clone(&rx)).unwrap();
            transport.open().unwrap();
            let stop = Arc::new(AtomicBool::new(false));
            let responder = spawn_responder(peer, Arc::clone(&stop), script);
            let client = Arc::new(SdoClient::new(transport, Arc::clone(&rx)));
            Rig {
                client,
                rx,
                stop,
                responder: Some(responder),
            }
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = self.responder.take() {
                let _ = handle.join();
            }
        }
    }

    fn node(raw: u8) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    #[test]
    fn expedited_read_success() {
        let rig = Rig::new(|request| {
            assert_eq!(request.cob_id, 0x60A);
            assert_eq!(request.data(), &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
            vec![Frame::new(0x58A, &[0x4B, 0x00, 0x10, 0x00, 0x92, 0x01, 0, 0]).unwrap()]
        });
        let value = rig
            .client
            .read(node(10), 0x1000, 0, Duration::from_millis(500))
            .unwrap();
        assert_eq!(value, 0x0192);
        // The matched response is gone from the queue.
        assert_eq!(rig.rx.len(), 0);
        let counters = rig.client.counters();
        assert_eq!(counters.sdo_read_total, 1);
        assert_eq!(counters.sdo_read_abort, 0);
    }

    #[test]
    fn expedited_read_all_sizes() {
        for &(cmd, raw, expected) in &[
            (0x43u8, [0x78, 0x56, 0x34, 0x12], 0x1234_5678u32),
            (0x47, [0x78, 0x56, 0x34, 0xFF], 0x0034_5678),
            (0x4B, [0x92, 0x01, 0xFF, 0xFF], 0x0192),
            (0x4F, [0x7F, 0xFF, 0xFF, 0xFF], 0x7F),
        ] {
            let rig = Rig::new(move |_| {
                vec![Frame::new(
                    0x58A,
                    &[cmd, 0x00, 0x10, 0x00, raw[0], raw[1], raw[2], raw[3]],
                )
                .unwrap()]
            });
            let value = rig
                .client
                .read(node(10), 0x1000, 0, Duration::from_millis(500))
                .unwrap();
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn read_abort_surfaces_the_code() {
        let rig = Rig::new(|_| {
            vec![Frame::new(0x58A, &[0x80, 0x00, 0x20, 0x00, 0x00, 0x00, 0x02, 0x06]).unwrap()]
        });
        let err = rig
            .client
            .read(node(10), 0x2000, 0, Duration::from_millis(500))
            .unwrap_err();
        assert!(matches!(err, Error::SdoAbort(0x0602_0000)));
        assert_eq!(rig.client.counters().sdo_read_abort, 1);
    }

    #[test]
    fn expedited_write_success() {
        let rig = Rig::new(|request| {
            assert_eq!(request.cob_id, 0x62A);
            assert_eq!(request.data(), &[0x2F, 0x00, 0x22, 0x12, 0x55, 0, 0, 0]);
            vec![Frame::new(0x5AA, &[0x60, 0x00, 0x22, 0x12, 0, 0, 0, 0]).unwrap()]
        });
        rig.client
            .write(node(42), 0x2200, 0x12, 0x55, Duration::from_millis(500))
            .unwrap();
        assert_eq!(rig.client.counters().sdo_write_total, 1);
    }

    #[test]
    fn write_sizes_are_minimal() {
        for &(value, cmd) in &[
            (0x55u32, 0x2Fu8),
            (0x0192, 0x2B),
            (0x12_3456, 0x27),
            (0x1234_5678, 0x23),
        ] {
            let rig = Rig::new(move |request| {
                assert_eq!(request.data()[0], cmd);
                vec![Frame::new(0x5AA, &[0x60, 0x00, 0x22, 0x12, 0, 0, 0, 0]).unwrap()]
            });
            rig.client
                .write(node(42), 0x2200, 0x12, value, Duration::from_millis(500))
                .unwrap();
        }
    }

    #[test]
    fn response_timeout_is_counted() {
        let rig = Rig::new(|_| Vec::new());
        let err = rig
            .client
            .read(node(10), 0x1000, 0, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, Error::ResponseTimeout));
        assert_eq!(rig.client.counters().sdo_read_response_timeout, 1);
    }

    #[test]
    fn zero_timeout_returns_without_waiting() {
        let rig = Rig::new(|_| Vec::new());
        let start = std::time::Instant::now();
        let err = rig
            .client
            .read(node(10), 0x1000, 0, Duration::from_millis(0))
            .unwrap_err();
        assert!(matches!(err, Error::ResponseTimeout));
        assert!(start.elapsed() < Duration::from_millis(80));
    }

    #[test]
    fn error_frames_never_match() {
        let rig = Rig::new(|_| vec![Frame::error_frame(0x58A)]);
        let err = rig
            .client
            .read(node(10), 0x1000, 0, Duration::from_millis(60))
            .unwrap_err();
        assert!(matches!(err, Error::ResponseTimeout));
    }

    #[test]
    fn mismatched_address_is_ignored() {
        let rig = Rig::new(|_| {
            vec![
                // Wrong index echo.
                Frame::new(0x58A, &[0x4B, 0x01, 0x10, 0x00, 0x92, 0x01, 0, 0]).unwrap(),
                // Wrong subindex echo.
                Frame::new(0x58A, &[0x4B, 0x00, 0x10, 0x01, 0x92, 0x01, 0, 0]).unwrap(),
            ]
        });
        let err = rig
            .client
            .read(node(10), 0x1000, 0, Duration::from_millis(60))
            .unwrap_err();
        assert!(matches!(err, Error::ResponseTimeout));
    }

    #[test]
    fn one_outstanding_request_per_node() {
        // The first request gets no answer; the second is served. If the
        // second read did not wait for the first to finish, it would
        // complete almost immediately.
        let requests = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&requests);
        let rig = Rig::new(move |request| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Vec::new();
            }
            let mut echo = [0u8; 8];
            echo[0] = 0x4B;
            echo[1..4].copy_from_slice(&request.data()[1..4]);
            echo[4] = 0x07;
            vec![Frame::new(0x58A, &echo).unwrap()]
        });
        let a = Arc::clone(&rig.client);
        let b = Arc::clone(&rig.client);
        let t1 = thread::spawn(move || a.read(node(10), 0x1000, 0, Duration::from_millis(150)));
        thread::sleep(Duration::from_millis(30));
        let start = std::time::Instant::now();
        let t2 = thread::spawn(move || b.read(node(10), 0x1000, 0, Duration::from_secs(2)));
        assert!(matches!(t1.join().unwrap(), Err(Error::ResponseTimeout)));
        let second = t2.join().unwrap().unwrap();
        assert_eq!(second, 0x0007);
        // The second read could only start after the first released the
        // per-node serialization, i.e. after its full response timeout.
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }
}
