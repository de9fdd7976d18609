//! Bus-attached simulation of one DCS Controller.
//!
//! Serves the device half of the SDO protocol against its own object
//! dictionary: expedited uploads and downloads, abort generation, the
//! connected-bitmap write cascading into per-chip status entries, and
//! randomized register/ADC/monitoring readings. Demos and tests run the
//! whole engine against this node over a virtual channel.

use crate::mirror::{ChipRegister, MonitoringTriplet};
use crate::od::{Access, Entry, ObjectDictionary, ObjectKind, SubEntry};
use crate::sdo::expedited_len;
use crate::value::{DataType, Value};
use crate::{AbortCode, Error, IDX_DEVICE_TYPE};
use dcs_canif::{
    DirectBus, Frame, FunctionCode, NodeId, VirtualChannel, COBID_SDO_TX, COBID_TPDO1,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Value-range-exceeded abort; sent for writes the dictionary rejects on
/// type grounds.
const ABORT_VALUE_RANGE: u32 = 0x0609_0030;

const SUB_MONITORING: u8 = 0x01;
const SUB_STATUS: u8 = 0x02;
const SUB_REGISTER_BASE: u8 = 0x10;
const SUB_ADC_BASE: u8 = 0x20;

/// Builds the object dictionary of a DCS Controller, mirroring the
/// device's EDS: the mandatory identity block, the four connected-chip
/// bitmaps, the ADC trim word, one record per possible chip and the
/// controller-level monitoring array.
pub fn controller_dictionary(node_id: u8) -> ObjectDictionary {
    let mut od = ObjectDictionary::new(node_id);
    od.add_entry(Entry::new_var(
        IDX_DEVICE_TYPE,
        "Device type",
        DataType::U32,
        Access::Ro,
        Some(Value::U32(0x0192)),
    ))
    .expect("fresh dictionary");
    od.add_entry(Entry::new_var(
        0x1001,
        "Error register",
        DataType::U8,
        Access::Ro,
        Some(Value::U8(0)),
    ))
    .expect("fresh dictionary");
    od.add_entry(Entry::new_var(
        0x1008,
        "Manufacturer device name",
        DataType::VisibleString,
        Access::Const,
        Some(Value::String("DCSC".into())),
    ))
    .expect("fresh dictionary");

    od.add_entry(Entry::new_compound(0x2000, ObjectKind::Record, "Connected chips"))
        .expect("fresh dictionary");
    od.add_sub_entry(
        0x2000,
        0,
        SubEntry::new("Number of entries", DataType::U8, Access::Ro, Some(Value::U8(4))),
    )
    .expect("fresh dictionary");
    for chain in 0..4u8 {
        od.add_sub_entry(
            0x2000,
            1 + chain,
            SubEntry::new(
                format!("Chain {}", chain),
                DataType::U16,
                Access::Rw,
                Some(Value::U16(0)),
            ),
        )
        .expect("fresh dictionary");
    }

    od.add_entry(Entry::new_var(
        0x2001,
        "ADC trim",
        DataType::U8,
        Access::Rw,
        Some(Value::U8(0)),
    ))
    .expect("fresh dictionary");

    for sub_master in 0..4u16 {
        for chip in 0..16u16 {
            let index = 0x2200 | (sub_master << 4) | chip;
            let name = format!("Chip {}/{}", sub_master, chip);
            od.add_entry(Entry::new_compound(index, ObjectKind::Record, name))
                .expect("fresh dictionary");
            od.add_sub_entry(
                index,
                0,
                SubEntry::new(
                    "Number of entries",
                    DataType::U8,
                    Access::Ro,
                    Some(Value::U8(0x27)),
                ),
            )
            .expect("fresh dictionary");
            od.add_sub_entry(
                index,
                SUB_MONITORING,
                SubEntry::new("Monitoring data", DataType::U32, Access::Ro, Some(Value::U32(0))),
            )
            .expect("fresh dictionary");
            od.add_sub_entry(
                index,
                SUB_STATUS,
                SubEntry::new("Status", DataType::Bool, Access::Rw, Some(Value::Bool(false))),
            )
            .expect("fresh dictionary");
            for register in &ChipRegister::ALL {
                od.add_sub_entry(
                    index,
                    SUB_REGISTER_BASE | register.index(),
                    SubEntry::new(register.name(), DataType::U8, Access::Rw, Some(Value::U8(0))),
                )
                .expect("fresh dictionary");
            }
            for channel in 0..8u8 {
                od.add_sub_entry(
                    index,
                    SUB_ADC_BASE | channel,
                    SubEntry::new(
                        format!("ADC channel {}", channel),
                        DataType::U16,
                        Access::Ro,
                        Some(Value::U16(0)),
                    ),
                )
                .expect("fresh dictionary");
            }
        }
    }

    od.add_entry(Entry::new_compound(0x2300, ObjectKind::Array, "Controller monitoring"))
        .expect("fresh dictionary");
    od.add_sub_entry(
        0x2300,
        0,
        SubEntry::new("Number of entries", DataType::U8, Access::Ro, Some(Value::U8(3))),
    )
    .expect("fresh dictionary");
    for channel in 1..=3u8 {
        od.add_sub_entry(
            0x2300,
            channel,
            SubEntry::new(
                format!("Controller ADC {}", channel - 1),
                DataType::U16,
                Access::Ro,
                Some(Value::U16(0)),
            ),
        )
        .expect("fresh dictionary");
    }

    od.finish_load();
    od
}

/// One simulated controller node.
pub struct SimulatedController {
    node: NodeId,
    od: Mutex<ObjectDictionary>,
    guard_toggle: Mutex<bool>,
}

impl SimulatedController {
    pub fn new(node: NodeId) -> SimulatedController {
        SimulatedController {
            node,
            od: Mutex::new(controller_dictionary(node.raw()).with_direct_access()),
            guard_toggle: Mutex::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Marks chips as present without going over the bus; tests use this
    /// to preset the hardware state.
    pub fn preset_connected(&self, sub_master: u8, bitmap: u16) {
        let mut od = self.od.lock().unwrap();
        od.set_value(0x2000, 1 + sub_master, Value::U16(bitmap))
            .expect("bitmap entry exists");
        Self::cascade_bitmap(&mut od, sub_master, bitmap);
    }

    fn cascade_bitmap(od: &mut ObjectDictionary, sub_master: u8, bitmap: u16) {
        for chip in 0..16u16 {
            let index = 0x2200 | ((sub_master as u16) << 4) | chip;
            let present = bitmap & (1 << chip) != 0;
            od.set_value(index, SUB_STATUS, Value::Bool(present))
                .expect("status entry exists");
        }
    }

    /// Handles one incoming frame and yields the frames to transmit.
    pub fn process(&self, frame: &Frame) -> Vec<Frame> {
        if frame.flags.is_error() {
            log::error!("*** error frame received ***");
            return Vec::new();
        }
        let (function, node) = frame.function();
        match function {
            FunctionCode::Nmt => {
                let data = frame.data();
                if data.len() >= 2 && (data[1] == 0 || data[1] == self.node.raw()) && data[0] == 1 {
                    log::info!("Received start_remote_node command");
                }
                Vec::new()
            }
            FunctionCode::Sync if frame.dlc == 0 && !frame.flags.is_rtr() => {
                log::info!("Received SYNC message");
                self.broadcast_monitoring()
            }
            FunctionCode::NodeGuard if node == self.node.raw() && frame.flags.is_rtr() => {
                let mut toggle = self.guard_toggle.lock().unwrap();
                *toggle = !*toggle;
                let byte = ((*toggle as u8) << 7) | 0x7F;
                vec![Frame::new(frame.cob_id, &[byte]).expect("guard response")]
            }
            FunctionCode::SdoRequest if node == self.node.raw() => {
                let data = frame.data();
                if data.len() != 8 {
                    return Vec::new();
                }
                match data[0] >> 5 {
                    0b010 => self.serve_read(data),
                    0b001 => self.serve_write(data),
                    0b100 => {
                        log::error!("Received SDO abort message");
                        Vec::new()
                    }
                    _ => {
                        log::error!("Unknown command specifier {:#04X}", data[0]);
                        vec![self.abort(data, AbortCode::InvalidCommand as u32)]
                    }
                }
            }
            _ => {
                log::trace!("Frame {:3X} was not for this node", frame.cob_id);
                Vec::new()
            }
        }
    }

    fn response_id(&self) -> u16 {
        COBID_SDO_TX + self.node.raw() as u16
    }

    fn abort(&self, request: &[u8], code: u32) -> Frame {
        let mut payload = [0u8; 8];
        payload[0] = 0x80;
        payload[1..4].copy_from_slice(&request[1..4]);
        payload[4..8].copy_from_slice(&code.to_le_bytes());
        Frame::new(self.response_id(), &payload).expect("abort response")
    }

    fn serve_read(&self, request: &[u8]) -> Vec<Frame> {
        let index = u16::from_le_bytes([request[1], request[2]]);
        let sub = request[3];
        if request[0] != 0x40 {
            return vec![self.abort(request, AbortCode::InvalidCommand as u32)];
        }
        let od = self.od.lock().unwrap();
        if od.entry(index).is_err() {
            log::error!("Object {:#06X} for SDO transfer does not exist", index);
            return vec![self.abort(request, AbortCode::NoObject as u32)];
        }
        if !od.contains(index, sub) {
            log::error!("Subindex {:#06X}:{:02X} for SDO transfer does not exist", index, sub);
            return vec![self.abort(request, AbortCode::NoSubindex as u32)];
        }
        let value = match self.gather_value(&od, index, sub) {
            Ok(value) => value,
            Err(Error::ChipNotConnected) => {
                log::error!("The chip behind {:#06X} is not connected", index);
                return vec![self.abort(request, AbortCode::HardwareFailure as u32)];
            }
            Err(_) => return vec![self.abort(request, AbortCode::InvalidCommand as u32)],
        };
        let (payload, datasize) = match stage_expedited(&value) {
            Some(staged) => staged,
            None => {
                log::error!("Segmented transfer is not implemented");
                return vec![self.abort(request, AbortCode::InvalidCommand as u32)];
            }
        };
        let mut response = [0u8; 8];
        response[0] = 0x43 | (((4 - datasize) as u8) << 2);
        response[1..4].copy_from_slice(&request[1..4]);
        response[4..8].copy_from_slice(&payload);
        vec![Frame::new(self.response_id(), &response).expect("read response")]
    }

    fn serve_write(&self, request: &[u8]) -> Vec<Frame> {
        let cmd = request[0];
        let index = u16::from_le_bytes([request[1], request[2]]);
        let sub = request[3];
        if ![0x23, 0x27, 0x2B, 0x2F].contains(&cmd) {
            log::error!("Unknown download command specifier {:#04X}", cmd);
            return vec![self.abort(request, AbortCode::InvalidCommand as u32)];
        }
        let datasize = 4 - ((cmd >> 2) & 0b11) as usize;
        let mut raw = [0u8; 4];
        raw[..datasize].copy_from_slice(&request[4..4 + datasize]);
        let raw = u32::from_le_bytes(raw);

        let mut od = self.od.lock().unwrap();
        let (access, data_type) = match od.entry(index) {
            Err(_) => {
                log::error!("Object {:#06X} does not exist", index);
                return vec![self.abort(request, AbortCode::NoObject as u32)];
            }
            Ok(entry) => match entry.sub(sub) {
                Some(slot) if !slot.reserved => (slot.access, slot.data_type),
                _ => {
                    log::error!("Subindex {:#06X}:{:02X} does not exist", index, sub);
                    return vec![self.abort(request, AbortCode::NoSubindex as u32)];
                }
            },
        };
        if matches!(access, Access::Ro | Access::Const) {
            log::error!("No write access on {:#06X}:{:02X}", index, sub);
            return vec![self.abort(request, AbortCode::WriteReadOnly as u32)];
        }
        let value = match Value::from_wire(data_type, raw) {
            Ok(value) => value,
            Err(_) => return vec![self.abort(request, ABORT_VALUE_RANGE)],
        };
        if od.set_value(index, sub, value).is_err() {
            return vec![self.abort(request, ABORT_VALUE_RANGE)];
        }
        log::debug!("Wrote {:#X} to {:#06X}:{:02X}", raw, index, sub);
        if index == 0x2000 && (1..=4).contains(&sub) {
            log::info!("Chain {}: setting chip connections {:#06X}", sub - 1, raw);
            Self::cascade_bitmap(&mut od, sub - 1, raw as u16);
        }

        let mut response = [0u8; 8];
        response[0] = 0x60;
        response[1..4].copy_from_slice(&request[1..4]);
        vec![Frame::new(self.response_id(), &response).expect("write response")]
    }

    /// Collects a reading, synthesizing live hardware where the dictionary
    /// only holds configuration.
    fn gather_value(&self, od: &ObjectDictionary, index: u16, sub: u8) -> crate::Result<Value> {
        let mut rng = rand::thread_rng();
        if (0x2200..0x2240).contains(&index) {
            let connected = matches!(od.value(index, SUB_STATUS), Ok(Some(Value::Bool(true))));
            if sub != SUB_STATUS && !connected {
                return Err(Error::ChipNotConnected);
            }
            if (SUB_REGISTER_BASE..SUB_REGISTER_BASE + 13).contains(&sub) {
                let register = ChipRegister::from_index(sub - SUB_REGISTER_BASE)
                    .expect("register subindex checked");
                return Ok(Value::U8(rng.gen_range(0..register.limit()) as u8));
            }
            if (SUB_ADC_BASE..SUB_ADC_BASE + 8).contains(&sub) {
                let channel = (sub - SUB_ADC_BASE) as u16;
                return Ok(Value::U16(channel * 0x2000 + rng.gen_range(0..0x400)));
            }
            if sub == SUB_MONITORING {
                let triplet = MonitoringTriplet {
                    temperature: 0x200 + rng.gen_range(0..0x20),
                    voltage1: 0x200 + rng.gen_range(0..0x20),
                    voltage2: 0x200 + rng.gen_range(0..0x20),
                };
                return Ok(Value::U32(triplet.pack()));
            }
        } else if index == 0x2300 && (1..=3).contains(&sub) {
            return Ok(Value::U16(sub as u16 * 0x2000 + rng.gen_range(0..0x100)));
        }
        Ok(od.value(index, sub)?.unwrap_or(Value::U32(0)))
    }

    /// Periodic monitoring broadcast sent after a SYNC, on the first
    /// transmit-PDO identifier.
    fn broadcast_monitoring(&self) -> Vec<Frame> {
        let mut rng = rand::thread_rng();
        let mut payload = [0u8; 6];
        payload[0] = 0x80;
        for byte in payload[1..5].iter_mut() {
            *byte = rng.gen();
        }
        vec![Frame::new(COBID_TPDO1 + self.node.raw() as u16, &payload).expect("pdo frame")]
    }

    /// Attaches the controller to one end of a virtual channel and serves
    /// requests until `shutdown` is set.
    pub fn spawn(
        self: Arc<Self>,
        mut channel: VirtualChannel,
        shutdown: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            DirectBus::open(&mut channel, 125_000).expect("virtual channel open");
            log::debug!("Simulated controller {} up", self.node);
            while !shutdown.load(Ordering::SeqCst) {
                match channel.read(Duration::from_millis(50)) {
                    Ok(Some(frame)) => {
                        for response in self.process(&frame) {
                            if channel.write(&response, Duration::from_millis(50)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(_) => return,
                }
            }
        })
    }
}

/// Stages a dictionary value for an expedited response: the four payload
/// bytes and the indicated data size. Values wider than four bytes would
/// need a segmented transfer and yield `None`.
fn stage_expedited(value: &Value) -> Option<([u8; 4], usize)> {
    if let Value::String(s) = value {
        let mut payload = [0u8; 4];
        let bytes = s.as_bytes();
        let n = bytes.len().min(4);
        payload[..n].copy_from_slice(&bytes[..n]);
        return Some((payload, 4));
    }
    let wire = value.to_wire()?;
    Some((wire.to_le_bytes(), expedited_len(wire) as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SimulatedController {
        SimulatedController::new(NodeId::new(42).unwrap())
    }

    fn sdo_read_frame(node: u8, index: u16, sub: u8) -> Frame {
        let mut payload = [0u8; 8];
        payload[0] = 0x40;
        payload[1..3].copy_from_slice(&index.to_le_bytes());
        payload[3] = sub;
        Frame::new(0x600 + node as u16, &payload).unwrap()
    }

    fn sdo_write_frame(node: u8, index: u16, sub: u8, value: u32, datasize: u8) -> Frame {
        let mut payload = [0u8; 8];
        payload[0] = 0b0010_0011 | ((4 - datasize) << 2);
        payload[1..3].copy_from_slice(&index.to_le_bytes());
        payload[3] = sub;
        payload[4..8].copy_from_slice(&value.to_le_bytes());
        Frame::new(0x600 + node as u16, &payload).unwrap()
    }

    fn abort_code(frame: &Frame) -> u32 {
        assert_eq!(frame.data()[0], 0x80);
        u32::from_le_bytes([frame.data()[4], frame.data()[5], frame.data()[6], frame.data()[7]])
    }

    #[test]
    fn serves_device_type() {
        let sim = sim();
        let responses = sim.process(&sdo_read_frame(42, 0x1000, 0));
        assert_eq!(responses.len(), 1);
        let r = &responses[0];
        assert_eq!(r.cob_id, 0x5AA);
        assert_eq!(r.data()[0], 0x4B);
        assert_eq!(&r.data()[1..4], &[0x00, 0x10, 0x00]);
        assert_eq!(&r.data()[4..6], &[0x92, 0x01]);
    }

    #[test]
    fn unknown_addresses_abort() {
        let sim = sim();
        let responses = sim.process(&sdo_read_frame(42, 0x5555, 0));
        assert_eq!(abort_code(&responses[0]), AbortCode::NoObject as u32);
        let responses = sim.process(&sdo_read_frame(42, 0x2000, 9));
        assert_eq!(abort_code(&responses[0]), AbortCode::NoSubindex as u32);
    }

    #[test]
    fn disconnected_chip_reads_abort_with_hardware_failure() {
        let sim = sim();
        let responses = sim.process(&sdo_read_frame(42, 0x2200, SUB_MONITORING));
        assert_eq!(abort_code(&responses[0]), AbortCode::HardwareFailure as u32);
        // The status bit itself stays readable.
        let responses = sim.process(&sdo_read_frame(42, 0x2200, SUB_STATUS));
        assert_eq!(responses[0].data()[0], 0x4F);
        assert_eq!(responses[0].data()[4], 0);
    }

    #[test]
    fn bitmap_write_cascades_into_status_bits() {
        let sim = sim();
        let responses = sim.process(&sdo_write_frame(42, 0x2000, 2, 0x0005, 2));
        assert_eq!(responses[0].data()[0], 0x60);
        // Chips 0 and 2 of chain 1 are now connected.
        let r = sim.process(&sdo_read_frame(42, 0x2210, SUB_STATUS));
        assert_eq!(r[0].data()[4], 1);
        let r = sim.process(&sdo_read_frame(42, 0x2212, SUB_STATUS));
        assert_eq!(r[0].data()[4], 1);
        let r = sim.process(&sdo_read_frame(42, 0x2211, SUB_STATUS));
        assert_eq!(r[0].data()[4], 0);
        // A connected chip now yields monitoring data with the validity
        // flag set.
        let r = sim.process(&sdo_read_frame(42, 0x2210, SUB_MONITORING));
        assert_eq!(r[0].data()[0], 0x43);
        let word = u32::from_le_bytes([
            r[0].data()[4],
            r[0].data()[5],
            r[0].data()[6],
            r[0].data()[7],
        ]);
        assert_eq!(word >> 31, 1);
    }

    #[test]
    fn read_only_entries_reject_writes() {
        let sim = sim();
        let responses = sim.process(&sdo_write_frame(42, 0x1000, 0, 1, 1));
        assert_eq!(abort_code(&responses[0]), AbortCode::WriteReadOnly as u32);
    }

    #[test]
    fn bad_command_specifier_aborts() {
        let sim = sim();
        let mut payload = [0u8; 8];
        payload[0] = 0xE0;
        let frame = Frame::new(0x62A, &payload).unwrap();
        let responses = sim.process(&frame);
        assert_eq!(abort_code(&responses[0]), AbortCode::InvalidCommand as u32);
    }

    #[test]
    fn ignores_other_nodes_and_error_frames() {
        let sim = sim();
        assert!(sim.process(&sdo_read_frame(41, 0x1000, 0)).is_empty());
        assert!(sim.process(&Frame::error_frame(0x62A)).is_empty());
    }

    #[test]
    fn sync_triggers_monitoring_broadcast() {
        let sim = sim();
        let sync = Frame::new(0x080, &[]).unwrap();
        let responses = sim.process(&sync);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].cob_id, 0x1AA);
        assert_eq!(responses[0].dlc, 6);
    }

    #[test]
    fn register_values_respect_their_limits() {
        let sim = sim();
        sim.preset_connected(0, 0x0001);
        for _ in 0..32 {
            let r = sim.process(&sdo_read_frame(
                42,
                0x2200,
                SUB_REGISTER_BASE | ChipRegister::ClockDiv.index(),
            ));
            assert!(r[0].data()[4] < 4);
        }
    }
}
