//! Message-level engine of a gateway bridging a field bus of DCS
//! detector-control microcontrollers to a supervisory protocol.
//!
//! The engine owns the device-protocol object dictionary, the expedited
//! SDO request/response machinery, the bus I/O layer over the two adapter
//! families, and the scan/mirror/poll supervision that keeps one live
//! mirror tree per discovered controller. The supervisory server itself,
//! the command line and the on-disk logging setup are collaborators on
//! top of this crate; see [`bridge::ExternalBridge`] for the surface they
//! consume.

pub mod bridge;
pub mod eds;
mod error;
pub mod mirror;
pub mod od;
pub mod rx;
pub mod scan;
pub mod sdo;
pub mod sim;
pub mod supervisor;
pub mod transport;
pub mod value;

pub use crate::error::{AbortCode, Error};
pub use dcs_canif as canif;

pub type Result<T> = std::result::Result<T, Error>;

/// Mandatory device-type object; every conforming node answers a read of
/// `0x1000:00`, which is what the scanner probes.
pub const IDX_DEVICE_TYPE: u16 = 0x1000;
