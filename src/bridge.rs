//! Glue between the supervisory peer and the engine.
//!
//! Inbound value changes from the supervisory side are checked against the
//! mirror (echo suppression), staged as SDO writes against the mapped
//! dictionary address and only mirrored once the hardware accepted them.
//! A rejected write re-publishes the previous mirror value so the peer's
//! cached state snaps back. Outbound, the bridge is just the subscription
//! surface of the mirrors.

use crate::mirror::{AttributePath, AttributeValue, ControllerMirror, WriterTag};
use crate::od::ObjectDictionary;
use crate::sdo::SdoClient;
use crate::{Error, Result};
use dcs_canif::NodeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct ExternalBridge {
    sdo: Arc<SdoClient>,
    /// Schema copy of the device dictionary, for access pre-checks on
    /// external writes.
    schema: Arc<ObjectDictionary>,
    registry: Mutex<HashMap<u8, Arc<ControllerMirror>>>,
    write_timeout: Duration,
    rejected: AtomicU64,
    datachanges: AtomicU64,
}

impl ExternalBridge {
    pub fn new(
        sdo: Arc<SdoClient>,
        schema: Arc<ObjectDictionary>,
        write_timeout: Duration,
    ) -> ExternalBridge {
        ExternalBridge {
            sdo,
            schema,
            registry: Mutex::new(HashMap::new()),
            write_timeout,
            rejected: AtomicU64::new(0),
            datachanges: AtomicU64::new(0),
        }
    }

    /// Replaces the set of served controllers; called after every scan.
    pub fn attach_all(&self, mirrors: &[Arc<ControllerMirror>]) {
        let mut registry = self.registry.lock().unwrap();
        registry.clear();
        for mirror in mirrors {
            registry.insert(mirror.node_id().raw(), Arc::clone(mirror));
        }
    }

    pub fn attach(&self, mirror: Arc<ControllerMirror>) {
        self.registry
            .lock()
            .unwrap()
            .insert(mirror.node_id().raw(), mirror);
    }

    pub fn list_controllers(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .registry
            .lock()
            .unwrap()
            .values()
            .map(|m| m.node_id())
            .collect();
        nodes.sort();
        nodes
    }

    fn mirror(&self, node: NodeId) -> Result<Arc<ControllerMirror>> {
        self.registry
            .lock()
            .unwrap()
            .get(&node.raw())
            .cloned()
            .ok_or(Error::UnknownController(node))
    }

    /// Registers a callback for mirror updates of one controller.
    pub fn subscribe<F>(
        &self,
        node: NodeId,
        filter: Option<AttributePath>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&AttributePath, &AttributeValue, WriterTag) + Send + Sync + 'static,
    {
        self.mirror(node)?.subscribe(filter, callback);
        Ok(())
    }

    /// External writes rejected by hardware or by the bus.
    pub fn server_write_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Inbound data-change events seen so far.
    pub fn datachange_events(&self) -> u64 {
        self.datachanges.load(Ordering::Relaxed)
    }

    /// Handles one externally originated value change.
    ///
    /// An unchanged value is the echo of an own notification and is
    /// dropped. A changed value must first reach the hardware; only then
    /// is the mirror updated and re-published. On failure the previous
    /// mirror value is re-published and the error surfaced to the caller;
    /// the engine keeps running.
    pub fn submit_external_write(
        &self,
        node: NodeId,
        path: AttributePath,
        value: AttributeValue,
    ) -> Result<()> {
        self.datachanges.fetch_add(1, Ordering::Relaxed);
        let mirror = self.mirror(node)?;
        let current = mirror.get(path)?;
        if current == value {
            log::trace!("{} of node {} unchanged; dropping echo", path, node);
            return Ok(());
        }

        // Values that do not fit the leaf (wrong shape, or out of the
        // 6-bit trim / 10-bit ADC ranges) never reach the bus.
        mirror.validate(path, &value)?;

        let (index, sub) = path.sdo_address();
        if let Ok(entry) = self.schema.entry(index) {
            match entry.sub(sub) {
                Some(slot) if !slot.reserved => {
                    if !slot.access.writable() {
                        log::warn!(
                            "External write to read-only {} of node {} refused",
                            path,
                            node
                        );
                        return Err(Error::AccessDenied {
                            index,
                            sub,
                            op: "written",
                        });
                    }
                }
                _ => return Err(Error::UnknownSubindex(index, sub)),
            }
        }

        match self
            .sdo
            .write(node, index, sub, value.to_wire(), self.write_timeout)
        {
            Ok(()) => {
                mirror.set(path, value, WriterTag::External)?;
                log::debug!("External write of {} to node {} applied", path, node);
                Ok(())
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "External write of {} to node {} failed ({}); snapping back",
                    path,
                    node,
                    e
                );
                let _ = mirror.republish(path);
                Err(e)
            }
        }
    }
}
