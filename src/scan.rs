//! Node scanner.
//!
//! Probes every node id by reading the mandatory device-type object
//! (`0x1000:00`) and records the responders. Probes run sequentially, so
//! at most one SDO request is on the bus at any time during a scan.

use crate::sdo::SdoClient;
use crate::{Error, Result, IDX_DEVICE_TYPE};
use dcs_canif::NodeId;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Scanner {
    sdo: Arc<SdoClient>,
    timeout: Duration,
}

impl Scanner {
    pub fn new(sdo: Arc<SdoClient>, timeout: Duration) -> Scanner {
        Scanner { sdo, timeout }
    }

    /// Full sweep over node ids 1..=127.
    ///
    /// A node is live when its device-type read succeeds; the value itself
    /// is ignored. Returns the ascending list of live node ids, or
    /// `BusEmpty` when nothing answered.
    pub fn scan(&self) -> Result<Vec<NodeId>> {
        log::info!("Scanning nodes; this takes a few seconds");
        let mut live = Vec::new();
        for node in NodeId::all() {
            match self.sdo.read(node, IDX_DEVICE_TYPE, 0, self.timeout) {
                Ok(_) => {
                    log::info!("Found node {}", node);
                    live.push(node);
                }
                Err(Error::TransportLost) => return Err(Error::TransportLost),
                Err(e) => {
                    log::trace!("Node {} did not answer: {}", node, e);
                }
            }
        }
        if live.is_empty() {
            log::error!("No nodes found on the bus");
            return Err(Error::BusEmpty);
        }
        log::info!("Scan finished; {} node(s) on the bus", live.len());
        Ok(live)
    }
}
