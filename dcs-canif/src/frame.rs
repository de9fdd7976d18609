use crate::{FrameError, NodeId};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Network-management broadcast identifier.
pub const COBID_NMT: u16 = 0x000;
/// Synchronization broadcast identifier.
pub const COBID_SYNC: u16 = 0x080;
/// Base identifier of the first transmit PDO.
pub const COBID_TPDO1: u16 = 0x180;
/// Base identifier of SDO server-to-client (response) frames.
pub const COBID_SDO_TX: u16 = 0x580;
/// Base identifier of SDO client-to-server (request) frames.
pub const COBID_SDO_RX: u16 = 0x600;
/// Base identifier of node-guarding frames.
pub const COBID_GUARD: u16 = 0x700;

/// SDO request identifier (client to server) for a node.
pub fn sdo_request_id(node: NodeId) -> u16 {
    COBID_SDO_RX + node.raw() as u16
}

/// SDO response identifier (server to client) for a node.
pub fn sdo_response_id(node: NodeId) -> u16 {
    COBID_SDO_TX + node.raw() as u16
}

/// Frame format flags.
///
/// Bit 0 marks an extended (29 bit) identifier, bit 1 a remote transmission
/// request, bit 2 a valid hardware timestamp. Bit 3 is local only and marks
/// an error frame delivered by the adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const EXTENDED: FrameFlags = FrameFlags(0b0001);
    pub const RTR: FrameFlags = FrameFlags(0b0010);
    pub const TIMESTAMPED: FrameFlags = FrameFlags(0b0100);
    pub const ERROR: FrameFlags = FrameFlags(0b1000);

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        FrameFlags(bits & 0b1111)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn is_extended(self) -> bool {
        self.contains(Self::EXTENDED)
    }

    pub fn is_rtr(self) -> bool {
        self.contains(Self::RTR)
    }

    pub fn is_timestamped(self) -> bool {
        self.contains(Self::TIMESTAMPED)
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }
}

/// One frame on the bus channel.
///
/// `data()` always yields exactly `dlc` bytes; an error frame carries no
/// payload. The timestamp is the local arrival time as a duration since the
/// Unix epoch with microsecond resolution, either stamped by the adapter or
/// filled in by [`Frame::stamp_now`] on delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub cob_id: u16,
    bytes: [u8; 8],
    pub dlc: u8,
    pub flags: FrameFlags,
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(cob_id: u16, data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > 8 {
            return Err(FrameError::TooLong(data.len()));
        }
        if cob_id > 0x7FF {
            return Err(FrameError::BadId(cob_id));
        }
        let mut bytes = [0u8; 8];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Frame {
            cob_id,
            bytes,
            dlc: data.len() as u8,
            flags: FrameFlags::empty(),
            timestamp: Duration::from_secs(0),
        })
    }

    /// A payload-less frame with the error flag set, as delivered by an
    /// adapter that saw a bus error.
    pub fn error_frame(cob_id: u16) -> Self {
        let mut f = Frame::new(cob_id & 0x7FF, &[]).expect("empty payload");
        f.flags.insert(FrameFlags::ERROR);
        f
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.dlc as usize]
    }

    /// Full 8-byte buffer, zero padded past `dlc`.
    pub fn raw(&self) -> &[u8; 8] {
        &self.bytes
    }

    /// Stamps the frame with the current wall-clock time unless the adapter
    /// already delivered a hardware timestamp.
    pub fn stamp_now(&mut self) {
        if self.flags.is_timestamped() {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        self.timestamp = Duration::from_micros(now.as_micros() as u64);
        self.flags.insert(FrameFlags::TIMESTAMPED);
    }

    pub fn function(&self) -> (FunctionCode, u8) {
        classify(self.cob_id)
    }
}

impl fmt::Display for Frame {
    /// Columnar trace format: COB-ID, DLC, data bytes, timestamp.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:3X} {}   ", self.cob_id, self.dlc)?;
        for b in self.data() {
            write!(f, "{:02x}  ", b)?;
        }
        for _ in self.dlc..8 {
            write!(f, "    ")?;
        }
        write!(f, "{}.{:06}", self.timestamp.as_secs(), self.timestamp.subsec_micros())
    }
}

/// Header line matching the [`Frame`] display columns, for frame trace logs.
pub const TRACE_HEADER: &str = "ID  DLC DATA 0..8                            TIME";

/// Protocol function selected by the upper bits of a COB-ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    Nmt,
    Sync,
    Emergency,
    /// Transmit PDO 1..=4.
    Tpdo(u8),
    /// Receive PDO 1..=4.
    Rpdo(u8),
    SdoResponse,
    SdoRequest,
    NodeGuard,
    Unknown,
}

/// Splits a COB-ID into its protocol function and node id bits.
///
/// The node id half is meaningless for the broadcast functions and is
/// returned as zero there.
pub fn classify(cob_id: u16) -> (FunctionCode, u8) {
    let function = cob_id & 0x780;
    let node = (cob_id & 0x07F) as u8;
    match function {
        COBID_NMT => (FunctionCode::Nmt, 0),
        COBID_SYNC if node == 0 => (FunctionCode::Sync, 0),
        COBID_SYNC => (FunctionCode::Emergency, node),
        0x180 | 0x280 | 0x380 | 0x480 => (FunctionCode::Tpdo(((function - 0x080) >> 8) as u8), node),
        0x200 | 0x300 | 0x400 | 0x500 => (FunctionCode::Rpdo(((function >> 8) - 1) as u8), node),
        COBID_SDO_TX => (FunctionCode::SdoResponse, node),
        COBID_SDO_RX => (FunctionCode::SdoRequest, node),
        COBID_GUARD => (FunctionCode::NodeGuard, node),
        _ => (FunctionCode::Unknown, node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_matches_dlc() {
        let f = Frame::new(0x60A, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]).unwrap();
        assert_eq!(f.dlc, 8);
        assert_eq!(f.data().len(), 8);
        let short = Frame::new(0x181, &[1, 2, 3]).unwrap();
        assert_eq!(short.dlc, 3);
        assert_eq!(short.data(), &[1, 2, 3]);
        assert!(Frame::new(0x181, &[0; 9]).is_err());
        assert!(Frame::new(0x800, &[]).is_err());
    }

    #[test]
    fn error_frame_is_empty_and_flagged() {
        let f = Frame::error_frame(0x58A);
        assert_eq!(f.dlc, 0);
        assert!(f.flags.is_error());
    }

    #[test]
    fn cob_id_routing() {
        let node = NodeId::new(10).unwrap();
        assert_eq!(sdo_request_id(node), 0x60A);
        assert_eq!(sdo_response_id(node), 0x58A);
        assert_eq!(classify(0x000), (FunctionCode::Nmt, 0));
        assert_eq!(classify(0x080), (FunctionCode::Sync, 0));
        assert_eq!(classify(0x08A), (FunctionCode::Emergency, 10));
        assert_eq!(classify(0x18A), (FunctionCode::Tpdo(1), 10));
        assert_eq!(classify(0x58A), (FunctionCode::SdoResponse, 10));
        assert_eq!(classify(0x60A), (FunctionCode::SdoRequest, 10));
        assert_eq!(classify(0x70A), (FunctionCode::NodeGuard, 10));
    }

    #[test]
    fn stamping_keeps_hardware_timestamps() {
        let mut f = Frame::new(0x181, &[0]).unwrap();
        f.timestamp = Duration::from_micros(1_234_567);
        f.flags.insert(FrameFlags::TIMESTAMPED);
        f.stamp_now();
        assert_eq!(f.timestamp, Duration::from_micros(1_234_567));

        let mut g = Frame::new(0x181, &[0]).unwrap();
        g.stamp_now();
        assert!(g.flags.is_timestamped());
        assert!(g.timestamp.as_secs() > 0);
    }
}
