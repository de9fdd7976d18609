use thiserror::Error;

/// Raw adapter failures, as reported by the bus layer underneath a
/// transport. The engine maps these onto its own error taxonomy.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Could not acquire device handle")]
    Open,
    #[error("Bit rate {0} bit/s not supported by this adapter")]
    Bitrate(u32),
    #[error("Adapter did not accept the frame")]
    Write,
    #[error("Frame was not accepted within the send window")]
    WriteTimeout,
    #[error("Channel is closed")]
    Closed,
    #[error("Fatal adapter failure")]
    Fatal,
}

/// Error of [`crate::NodeId::new`] for values outside 1..=127.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Node id {0} is outside 1..=127")]
pub struct InvalidNodeId(pub u8);

/// Error of [`crate::Frame::new`] for payloads longer than 8 bytes or
/// identifiers that do not fit in 11 bits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("CAN payload of {0} bytes exceeds 8 bytes")]
    TooLong(usize),
    #[error("Identifier {0:#X} does not fit in 11 bits")]
    BadId(u16),
}
