use crate::value::DataType;
use dcs_canif::NodeId;
use num_derive::FromPrimitive;
use num_traits::cast::FromPrimitive as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not open bus adapter")]
    TransportOpen,
    #[error("Could not hand frame to bus adapter")]
    TransportSend,
    #[error("Connection to bus adapter lost")]
    TransportLost,
    #[error("Index {0:#06X} not in object dictionary")]
    UnknownIndex(u16),
    #[error("Subindex {1:#04X} of entry {0:#06X} not in object dictionary")]
    UnknownSubindex(u16, u8),
    #[error("Entry {index:#06X}:{sub:#04X} may not be {op}")]
    AccessDenied {
        index: u16,
        sub: u8,
        /// `"read"` or `"written"`.
        op: &'static str,
    },
    #[error("Value does not fit data type {expected:?}")]
    TypeMismatch { expected: DataType },
    #[error("Request was not accepted on the bus within the send window")]
    RequestTimeout,
    #[error("No matching SDO response within the timeout")]
    ResponseTimeout,
    #[error("SDO transfer aborted with code {0:#010X}")]
    SdoAbort(u32),
    #[error("Chip is not connected to its serial chain")]
    ChipNotConnected,
    #[error("No nodes responded on the bus")]
    BusEmpty,
    #[error("No controller with node id {0}")]
    UnknownController(NodeId),
    #[error("Malformed EDS descriptor: {0}")]
    Eds(String),
}

impl Error {
    /// The raw 32-bit abort code if this is a protocol-level abort.
    pub fn abort_code(&self) -> Option<u32> {
        match self {
            Error::SdoAbort(code) => Some(*code),
            Error::ChipNotConnected => Some(AbortCode::HardwareFailure as u32),
            _ => None,
        }
    }
}

/// SDO abort codes the engine knows by name.
///
/// Codes outside this table are surfaced verbatim through
/// [`Error::SdoAbort`]; the enum only drives logging and the simulated
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum AbortCode {
    /// Invalid or unknown command specifier.
    InvalidCommand = 0x0504_0001,
    /// Object does not exist in the object dictionary.
    NoObject = 0x0602_0000,
    /// Attempt to write a read-only object.
    WriteReadOnly = 0x0601_0002,
    /// Subindex does not exist.
    NoSubindex = 0x0609_0011,
    /// Access failed due to a hardware error.
    HardwareFailure = 0x0606_0000,
}

impl AbortCode {
    pub fn decode(code: u32) -> Option<AbortCode> {
        AbortCode::from_u32(code)
    }

    pub fn describe(code: u32) -> &'static str {
        match AbortCode::decode(code) {
            Some(AbortCode::InvalidCommand) => "invalid command specifier",
            Some(AbortCode::NoObject) => "object does not exist",
            Some(AbortCode::WriteReadOnly) => "attempted write to read-only object",
            Some(AbortCode::NoSubindex) => "subindex does not exist",
            Some(AbortCode::HardwareFailure) => "hardware failure",
            None => "unknown abort code",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_abort_codes() {
        assert_eq!(AbortCode::decode(0x0602_0000), Some(AbortCode::NoObject));
        assert_eq!(AbortCode::decode(0x0609_0011), Some(AbortCode::NoSubindex));
        assert_eq!(AbortCode::decode(0xDEAD_BEEF), None);
        assert_eq!(AbortCode::describe(0x0606_0000), "hardware failure");
    }

    #[test]
    fn abort_code_is_surfaced_verbatim() {
        let err = Error::SdoAbort(0x1234_5678);
        assert_eq!(err.abort_code(), Some(0x1234_5678));
        assert_eq!(Error::ChipNotConnected.abort_code(), Some(0x0606_0000));
        assert_eq!(Error::BusEmpty.abort_code(), None);
    }
}
