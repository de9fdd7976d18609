//! Mirror tree of one discovered controller.
//!
//! A fixed-shape replica of the hardware: four serial-chain sub-masters,
//! each with a connected-chip bitmap and up to sixteen analog chips, each
//! chip with a status bit, thirteen byte-wide registers, eight 10-bit ADC
//! channels and one packed monitoring triplet. The supervisory side reads
//! from this tree and external writes are staged through it.
//!
//! Every leaf remembers which side wrote it last ([`WriterTag`]); the
//! bridge uses that latch to tell its own echoes apart from changes that
//! must be forwarded to hardware.

use crate::{Error, Result};
use dcs_canif::NodeId;
use std::fmt;
use std::sync::Mutex;

/// Serial-chain sub-masters per controller.
pub const SUB_MASTERS: u8 = 4;
/// Chips per sub-master serial chain.
pub const CHIPS_PER_CHAIN: u8 = 16;
/// ADC channels per chip.
pub const ADC_CHANNELS: u8 = 8;
/// Mask of one 10-bit ADC or monitoring field.
pub const FIELD_MASK_10BIT: u16 = 0x3FF;
/// Mask of the 6-bit controller ADC trim field.
pub const ADC_TRIM_MASK: u8 = 0x3F;

/// Byte-wide configuration and status registers of one chip, in subindex
/// order. `index()` is the offset below the `0x10` register subindex base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipRegister {
    Control,
    ShuntTrim,
    ClockDiv,
    RefTrim,
    AdcGain,
    AdcRate,
    DacValue,
    DacSelect,
    LdoTrim,
    MonitorGain,
    MonitorSelect,
    AlarmMask,
    AlarmFlags,
}

impl ChipRegister {
    pub const ALL: [ChipRegister; 13] = [
        ChipRegister::Control,
        ChipRegister::ShuntTrim,
        ChipRegister::ClockDiv,
        ChipRegister::RefTrim,
        ChipRegister::AdcGain,
        ChipRegister::AdcRate,
        ChipRegister::DacValue,
        ChipRegister::DacSelect,
        ChipRegister::LdoTrim,
        ChipRegister::MonitorGain,
        ChipRegister::MonitorSelect,
        ChipRegister::AlarmMask,
        ChipRegister::AlarmFlags,
    ];

    pub fn index(self) -> u8 {
        Self::ALL.iter().position(|r| *r == self).unwrap() as u8
    }

    pub fn from_index(index: u8) -> Option<ChipRegister> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ChipRegister::Control => "Control",
            ChipRegister::ShuntTrim => "ShuntTrim",
            ChipRegister::ClockDiv => "ClockDiv",
            ChipRegister::RefTrim => "RefTrim",
            ChipRegister::AdcGain => "AdcGain",
            ChipRegister::AdcRate => "AdcRate",
            ChipRegister::DacValue => "DacValue",
            ChipRegister::DacSelect => "DacSelect",
            ChipRegister::LdoTrim => "LdoTrim",
            ChipRegister::MonitorGain => "MonitorGain",
            ChipRegister::MonitorSelect => "MonitorSelect",
            ChipRegister::AlarmMask => "AlarmMask",
            ChipRegister::AlarmFlags => "AlarmFlags",
        }
    }

    /// Exclusive upper bound of the register's value range on the device.
    pub fn limit(self) -> u16 {
        match self {
            ChipRegister::ClockDiv
            | ChipRegister::AdcGain
            | ChipRegister::AdcRate
            | ChipRegister::MonitorGain => 4,
            ChipRegister::DacSelect | ChipRegister::MonitorSelect => 8,
            _ => 256,
        }
    }
}

impl fmt::Display for ChipRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side performed the most recent update of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterTag {
    /// The poll supervisor, i.e. values read from hardware.
    Server,
    /// The supervisory protocol peer.
    External,
}

/// The three 10-bit monitoring fields of a chip, unpacked from the 32-bit
/// device-dictionary word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitoringTriplet {
    pub temperature: u16,
    pub voltage1: u16,
    pub voltage2: u16,
}

impl MonitoringTriplet {
    /// Unpacks a monitoring word, dropping the validity flag in bit 31.
    /// Layout: `[31]` validity, `[30:21]` temperature, `[20:11]` voltage 1,
    /// `[10:1]` voltage 2, `[0]` unused.
    pub fn unpack(word: u32) -> MonitoringTriplet {
        MonitoringTriplet {
            temperature: ((word >> 21) as u16) & FIELD_MASK_10BIT,
            voltage1: ((word >> 11) as u16) & FIELD_MASK_10BIT,
            voltage2: ((word >> 1) as u16) & FIELD_MASK_10BIT,
        }
    }

    /// Packs the triplet with the validity flag set.
    pub fn pack(&self) -> u32 {
        (1 << 31)
            | (((self.temperature & FIELD_MASK_10BIT) as u32) << 21)
            | (((self.voltage1 & FIELD_MASK_10BIT) as u32) << 11)
            | (((self.voltage2 & FIELD_MASK_10BIT) as u32) << 1)
    }
}

/// Address of one mirror leaf inside a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributePath {
    /// Controller-level ADC trimming bits.
    AdcTrim,
    /// Connected-chip bitmap of one sub-master; bit `i` is chip `i`.
    ConnectedChips { sub_master: u8 },
    ChipStatus { sub_master: u8, chip: u8 },
    ChipMonitoring { sub_master: u8, chip: u8 },
    ChipRegister {
        sub_master: u8,
        chip: u8,
        register: ChipRegister,
    },
    ChipAdc { sub_master: u8, chip: u8, channel: u8 },
}

impl AttributePath {
    /// Dictionary address of the leaf on the device.
    pub fn sdo_address(&self) -> (u16, u8) {
        fn chip_index(sub_master: u8, chip: u8) -> u16 {
            0x2200 | ((sub_master as u16) << 4) | chip as u16
        }
        match *self {
            AttributePath::AdcTrim => (0x2001, 0),
            AttributePath::ConnectedChips { sub_master } => (0x2000, 1 + sub_master),
            AttributePath::ChipMonitoring { sub_master, chip } => (chip_index(sub_master, chip), 0x01),
            AttributePath::ChipStatus { sub_master, chip } => (chip_index(sub_master, chip), 0x02),
            AttributePath::ChipRegister {
                sub_master,
                chip,
                register,
            } => (chip_index(sub_master, chip), 0x10 | register.index()),
            AttributePath::ChipAdc {
                sub_master,
                chip,
                channel,
            } => (chip_index(sub_master, chip), 0x20 | channel),
        }
    }

    fn bounds_ok(&self) -> bool {
        let (sub_master, chip, channel) = match *self {
            AttributePath::AdcTrim => return true,
            AttributePath::ConnectedChips { sub_master } => (sub_master, 0, 0),
            AttributePath::ChipStatus { sub_master, chip }
            | AttributePath::ChipMonitoring { sub_master, chip }
            | AttributePath::ChipRegister {
                sub_master, chip, ..
            } => (sub_master, chip, 0),
            AttributePath::ChipAdc {
                sub_master,
                chip,
                channel,
            } => (sub_master, chip, channel),
        };
        sub_master < SUB_MASTERS && chip < CHIPS_PER_CHAIN && channel < ADC_CHANNELS
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AttributePath::AdcTrim => write!(f, "AdcTrim"),
            AttributePath::ConnectedChips { sub_master } => {
                write!(f, "SubMaster{}.ConnectedChips", sub_master)
            }
            AttributePath::ChipStatus { sub_master, chip } => {
                write!(f, "SubMaster{}.Chip{}.Status", sub_master, chip)
            }
            AttributePath::ChipMonitoring { sub_master, chip } => {
                write!(f, "SubMaster{}.Chip{}.Monitoring", sub_master, chip)
            }
            AttributePath::ChipRegister {
                sub_master,
                chip,
                register,
            } => write!(f, "SubMaster{}.Chip{}.Regs.{}", sub_master, chip, register),
            AttributePath::ChipAdc {
                sub_master,
                chip,
                channel,
            } => write!(f, "SubMaster{}.Chip{}.Adc.Ch{}", sub_master, chip, channel),
        }
    }
}

/// Value of one mirror leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeValue {
    Flag(bool),
    Byte(u8),
    Word(u16),
    Monitoring(MonitoringTriplet),
}

impl AttributeValue {
    /// Wire form for the SDO write staged by the bridge.
    pub fn to_wire(&self) -> u32 {
        match *self {
            AttributeValue::Flag(b) => b as u32,
            AttributeValue::Byte(v) => v as u32,
            AttributeValue::Word(v) => v as u32,
            AttributeValue::Monitoring(t) => t.pack(),
        }
    }
}

/// Whether a `set` call changed the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Unchanged,
    Updated,
}

#[derive(Debug, Clone)]
struct Leaf<T> {
    value: T,
    writer: WriterTag,
}

impl<T: Default> Default for Leaf<T> {
    fn default() -> Leaf<T> {
        Leaf {
            value: T::default(),
            writer: WriterTag::Server,
        }
    }
}

#[derive(Default)]
struct ChipState {
    status: Leaf<bool>,
    registers: [Leaf<u8>; 13],
    adc: [Leaf<u16>; 8],
    monitoring: Leaf<MonitoringTriplet>,
}

#[derive(Default)]
struct SubMasterState {
    connected: Leaf<u16>,
    chips: [ChipState; 16],
}

#[derive(Default)]
struct MirrorState {
    adc_trim: Leaf<u8>,
    sub_masters: [SubMasterState; 4],
}

type Callback = Box<dyn Fn(&AttributePath, &AttributeValue, WriterTag) + Send + Sync>;

struct Subscriber {
    filter: Option<AttributePath>,
    callback: Callback,
}

/// Live mirror of one controller. Leaves are updated under one mutex per
/// controller so the writer tag stays coherent with the value;
/// notifications for the same leaf are serialized.
pub struct ControllerMirror {
    node: NodeId,
    state: Mutex<MirrorState>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ControllerMirror {
    pub fn new(node: NodeId) -> ControllerMirror {
        ControllerMirror {
            node,
            state: Mutex::new(MirrorState::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Registers a callback for updates of one leaf, or of every leaf when
    /// `filter` is `None`.
    pub fn subscribe<F>(&self, filter: Option<AttributePath>, callback: F)
    where
        F: Fn(&AttributePath, &AttributeValue, WriterTag) + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Subscriber {
            filter,
            callback: Box::new(callback),
        });
    }

    fn path_error(path: &AttributePath) -> Error {
        let (index, sub) = path.sdo_address();
        Error::UnknownSubindex(index, sub)
    }

    /// Reads the current value of a leaf.
    pub fn get(&self, path: AttributePath) -> Result<AttributeValue> {
        if !path.bounds_ok() {
            return Err(Self::path_error(&path));
        }
        let state = self.state.lock().unwrap();
        Ok(Self::read_leaf(&state, &path))
    }

    /// Writer tag recorded by the most recent update of a leaf.
    pub fn writer(&self, path: AttributePath) -> Result<WriterTag> {
        if !path.bounds_ok() {
            return Err(Self::path_error(&path));
        }
        let state = self.state.lock().unwrap();
        Ok(Self::leaf_writer(&state, &path))
    }

    fn leaf_writer(state: &MirrorState, path: &AttributePath) -> WriterTag {
        match *path {
            AttributePath::AdcTrim => state.adc_trim.writer,
            AttributePath::ConnectedChips { sub_master } => {
                state.sub_masters[sub_master as usize].connected.writer
            }
            AttributePath::ChipStatus { sub_master, chip } => {
                state.sub_masters[sub_master as usize].chips[chip as usize].status.writer
            }
            AttributePath::ChipMonitoring { sub_master, chip } => {
                state.sub_masters[sub_master as usize].chips[chip as usize]
                    .monitoring
                    .writer
            }
            AttributePath::ChipRegister {
                sub_master,
                chip,
                register,
            } => {
                state.sub_masters[sub_master as usize].chips[chip as usize].registers
                    [register.index() as usize]
                    .writer
            }
            AttributePath::ChipAdc {
                sub_master,
                chip,
                channel,
            } => {
                state.sub_masters[sub_master as usize].chips[chip as usize].adc[channel as usize]
                    .writer
            }
        }
    }

    fn read_leaf(state: &MirrorState, path: &AttributePath) -> AttributeValue {
        match *path {
            AttributePath::AdcTrim => AttributeValue::Byte(state.adc_trim.value),
            AttributePath::ConnectedChips { sub_master } => {
                AttributeValue::Word(state.sub_masters[sub_master as usize].connected.value)
            }
            AttributePath::ChipStatus { sub_master, chip } => AttributeValue::Flag(
                state.sub_masters[sub_master as usize].chips[chip as usize].status.value,
            ),
            AttributePath::ChipMonitoring { sub_master, chip } => AttributeValue::Monitoring(
                state.sub_masters[sub_master as usize].chips[chip as usize]
                    .monitoring
                    .value,
            ),
            AttributePath::ChipRegister {
                sub_master,
                chip,
                register,
            } => AttributeValue::Byte(
                state.sub_masters[sub_master as usize].chips[chip as usize].registers
                    [register.index() as usize]
                    .value,
            ),
            AttributePath::ChipAdc {
                sub_master,
                chip,
                channel,
            } => AttributeValue::Word(
                state.sub_masters[sub_master as usize].chips[chip as usize].adc
                    [channel as usize]
                    .value,
            ),
        }
    }

    /// Updates a leaf.
    ///
    /// An update carrying the value the leaf already holds does not emit a
    /// notification: an external echo is a complete no-op, a server write
    /// merely latches the writer tag so the next identical inbound
    /// external notification is suppressed. A changed value is stored,
    /// tagged and notified.
    pub fn set(
        &self,
        path: AttributePath,
        value: AttributeValue,
        writer: WriterTag,
    ) -> Result<SetOutcome> {
        if !path.bounds_ok() {
            return Err(Self::path_error(&path));
        }
        let changed = {
            let mut state = self.state.lock().unwrap();
            let current = Self::read_leaf(&state, &path);
            if current == value {
                if writer == WriterTag::Server {
                    Self::latch_writer(&mut state, &path, writer);
                }
                false
            } else {
                Self::write_leaf(&mut state, &path, &value, writer)?;
                true
            }
        };
        if changed {
            log::debug!("{} of node {} set to {:?}", path, self.node, value);
            self.notify(&path, &value, writer);
            Ok(SetOutcome::Updated)
        } else {
            Ok(SetOutcome::Unchanged)
        }
    }

    /// Re-emits the stored value of a leaf with its recorded writer tag,
    /// so a rejected external write snaps the peer's cache back.
    pub fn republish(&self, path: AttributePath) -> Result<()> {
        if !path.bounds_ok() {
            return Err(Self::path_error(&path));
        }
        let (value, writer) = {
            let state = self.state.lock().unwrap();
            (Self::read_leaf(&state, &path), Self::leaf_writer(&state, &path))
        };
        self.notify(&path, &value, writer);
        Ok(())
    }

    fn latch_writer(state: &mut MirrorState, path: &AttributePath, writer: WriterTag) {
        match *path {
            AttributePath::AdcTrim => state.adc_trim.writer = writer,
            AttributePath::ConnectedChips { sub_master } => {
                state.sub_masters[sub_master as usize].connected.writer = writer
            }
            AttributePath::ChipStatus { sub_master, chip } => {
                state.sub_masters[sub_master as usize].chips[chip as usize].status.writer = writer
            }
            AttributePath::ChipMonitoring { sub_master, chip } => {
                state.sub_masters[sub_master as usize].chips[chip as usize]
                    .monitoring
                    .writer = writer
            }
            AttributePath::ChipRegister {
                sub_master,
                chip,
                register,
            } => {
                state.sub_masters[sub_master as usize].chips[chip as usize].registers
                    [register.index() as usize]
                    .writer = writer
            }
            AttributePath::ChipAdc {
                sub_master,
                chip,
                channel,
            } => {
                state.sub_masters[sub_master as usize].chips[chip as usize].adc[channel as usize]
                    .writer = writer
            }
        }
    }

    /// Shape and range rules of one leaf: status takes a flag, registers
    /// and the 6-bit trim a byte, bitmaps and the 10-bit ADC channels a
    /// word, monitoring the triplet.
    fn check_value(path: &AttributePath, value: &AttributeValue) -> Result<()> {
        match (path, value) {
            (AttributePath::AdcTrim, AttributeValue::Byte(v)) if *v <= ADC_TRIM_MASK => Ok(()),
            (AttributePath::ConnectedChips { .. }, AttributeValue::Word(_)) => Ok(()),
            (AttributePath::ChipStatus { .. }, AttributeValue::Flag(_)) => Ok(()),
            (AttributePath::ChipMonitoring { .. }, AttributeValue::Monitoring(_)) => Ok(()),
            (AttributePath::ChipRegister { .. }, AttributeValue::Byte(_)) => Ok(()),
            (AttributePath::ChipAdc { .. }, AttributeValue::Word(v))
                if *v <= FIELD_MASK_10BIT =>
            {
                Ok(())
            }
            (AttributePath::AdcTrim, _) => Err(Error::TypeMismatch {
                expected: crate::value::DataType::U8,
            }),
            (AttributePath::ChipAdc { .. }, _) => Err(Error::TypeMismatch {
                expected: crate::value::DataType::U16,
            }),
            _ => Err(Error::TypeMismatch {
                expected: crate::value::DataType::U32,
            }),
        }
    }

    /// Checks that `value` fits the leaf at `path` without touching the
    /// mirror; the bridge runs this before staging a hardware write.
    pub fn validate(&self, path: AttributePath, value: &AttributeValue) -> Result<()> {
        if !path.bounds_ok() {
            return Err(Self::path_error(&path));
        }
        Self::check_value(&path, value)
    }

    fn write_leaf(
        state: &mut MirrorState,
        path: &AttributePath,
        value: &AttributeValue,
        writer: WriterTag,
    ) -> Result<()> {
        Self::check_value(path, value)?;
        match (*path, *value) {
            (AttributePath::AdcTrim, AttributeValue::Byte(v)) => {
                state.adc_trim = Leaf { value: v, writer };
            }
            (AttributePath::ConnectedChips { sub_master }, AttributeValue::Word(v)) => {
                state.sub_masters[sub_master as usize].connected = Leaf { value: v, writer };
            }
            (AttributePath::ChipStatus { sub_master, chip }, AttributeValue::Flag(v)) => {
                state.sub_masters[sub_master as usize].chips[chip as usize].status =
                    Leaf { value: v, writer };
            }
            (AttributePath::ChipMonitoring { sub_master, chip }, AttributeValue::Monitoring(v)) => {
                state.sub_masters[sub_master as usize].chips[chip as usize].monitoring =
                    Leaf { value: v, writer };
            }
            (
                AttributePath::ChipRegister {
                    sub_master,
                    chip,
                    register,
                },
                AttributeValue::Byte(v),
            ) => {
                state.sub_masters[sub_master as usize].chips[chip as usize].registers
                    [register.index() as usize] = Leaf { value: v, writer };
            }
            (
                AttributePath::ChipAdc {
                    sub_master,
                    chip,
                    channel,
                },
                AttributeValue::Word(v),
            ) => {
                state.sub_masters[sub_master as usize].chips[chip as usize].adc
                    [channel as usize] = Leaf { value: v, writer };
            }
            _ => unreachable!("value shape checked"),
        }
        Ok(())
    }

    fn notify(&self, path: &AttributePath, value: &AttributeValue, writer: WriterTag) {
        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter() {
            match &sub.filter {
                Some(filter) if filter != path => continue,
                _ => (sub.callback)(path, value, writer),
            }
        }
    }

    /// Chips marked present by a sub-master's bitmap, in ascending chip
    /// order; the least significant bit is chip 0.
    pub fn present_chips(&self, sub_master: u8) -> Result<Vec<u8>> {
        let bitmap = match self.get(AttributePath::ConnectedChips { sub_master })? {
            AttributeValue::Word(v) => v,
            _ => unreachable!(),
        };
        Ok((0..CHIPS_PER_CHAIN).filter(|i| bitmap & (1 << i) != 0).collect())
    }
}
