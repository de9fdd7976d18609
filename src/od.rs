//! In-memory object dictionary: schema plus live values.
//!
//! The dictionary is built once at startup from an EDS descriptor (see
//! [`crate::eds`]) and never resized afterwards; entry values mutate for
//! the whole run. Access attributes and per-entry typing are enforced on
//! every read and write.

use crate::value::{coerce, DataType, Value};
use crate::{Error, Result};
use num_derive::FromPrimitive;
use num_traits::cast::FromPrimitive as _;
use std::collections::BTreeMap;

/// Object type of a top-level entry, as encoded in the `ObjectType` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ObjectKind {
    Var = 7,
    Array = 8,
    Record = 9,
}

impl ObjectKind {
    pub fn from_code(code: u8) -> Option<ObjectKind> {
        ObjectKind::from_u8(code)
    }
}

/// Access attribute of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Ro,
    Wo,
    Rw,
    Const,
}

impl Access {
    pub fn from_keyword(raw: &str) -> Option<Access> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ro" => Some(Access::Ro),
            "wo" => Some(Access::Wo),
            "rw" => Some(Access::Rw),
            "const" => Some(Access::Const),
            _ => None,
        }
    }

    pub fn readable(self) -> bool {
        !matches!(self, Access::Wo)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Wo | Access::Rw)
    }
}

/// One addressable slot of the dictionary.
///
/// Reserved slots pad gaps in a compound entry's subindex sequence and
/// reject both reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub struct SubEntry {
    pub name: String,
    pub data_type: DataType,
    pub access: Access,
    pub default: Option<Value>,
    value: Option<Value>,
    pub reserved: bool,
}

impl SubEntry {
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        access: Access,
        default: Option<Value>,
    ) -> SubEntry {
        SubEntry {
            name: name.into(),
            data_type,
            access,
            default: default.clone(),
            value: default,
            reserved: false,
        }
    }

    fn reserved_slot() -> SubEntry {
        SubEntry {
            name: "reserved".into(),
            data_type: DataType::U8,
            access: Access::Ro,
            default: None,
            value: None,
            reserved: true,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Declared length for string types, taken from the default value.
    fn declared_len(&self) -> Option<usize> {
        match &self.default {
            Some(Value::String(s)) => Some(s.len()),
            Some(Value::Octets(o)) => Some(o.len()),
            _ => None,
        }
    }
}

/// Top-level dictionary entry. A `Var` holds exactly one slot at
/// subindex 0; the compound kinds hold a dense slot sequence whose
/// subindex 0 carries the count of meaningful subentries.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub index: u16,
    pub kind: ObjectKind,
    pub name: String,
    subs: Vec<SubEntry>,
}

impl Entry {
    pub fn new_var(
        index: u16,
        name: impl Into<String>,
        data_type: DataType,
        access: Access,
        default: Option<Value>,
    ) -> Entry {
        let name = name.into();
        let slot = SubEntry::new(name.clone(), data_type, access, default);
        Entry {
            index,
            kind: ObjectKind::Var,
            name,
            subs: vec![slot],
        }
    }

    pub fn new_compound(index: u16, kind: ObjectKind, name: impl Into<String>) -> Entry {
        Entry {
            index,
            kind,
            name: name.into(),
            subs: Vec::new(),
        }
    }

    pub fn sub(&self, sub: u8) -> Option<&SubEntry> {
        self.subs.get(sub as usize)
    }

    pub fn sub_count(&self) -> usize {
        self.subs.len()
    }

    pub fn subs(&self) -> impl Iterator<Item = &SubEntry> {
        self.subs.iter()
    }

    pub fn contains(&self, sub: u8) -> bool {
        self.sub(sub).map(|s| !s.reserved).unwrap_or(false)
    }

    fn meaningful_subs(&self) -> u8 {
        self.subs
            .iter()
            .skip(1)
            .filter(|s| !s.reserved)
            .count() as u8
    }
}

/// The object dictionary of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDictionary {
    entries: BTreeMap<u16, Entry>,
    node_id: u8,
    /// Commissioned bit rate in bit/s, if the descriptor carried one.
    pub bitrate: Option<u32>,
    direct: bool,
}

impl ObjectDictionary {
    pub fn new(node_id: u8) -> ObjectDictionary {
        ObjectDictionary {
            entries: BTreeMap::new(),
            node_id,
            bitrate: None,
            direct: false,
        }
    }

    /// Lets the owner write entries regardless of their access attribute.
    ///
    /// The device side of the protocol updates read-only monitoring slots
    /// itself; `Const` entries stay immutable even here.
    pub fn with_direct_access(mut self) -> ObjectDictionary {
        self.direct = true;
        self
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn add_entry(&mut self, entry: Entry) -> Result<()> {
        if self.entries.contains_key(&entry.index) {
            return Err(Error::Eds(format!(
                "index {:#06X} defined twice",
                entry.index
            )));
        }
        self.entries.insert(entry.index, entry);
        Ok(())
    }

    /// Appends a subentry, padding skipped subindexes with reserved slots
    /// so the sequence stays dense.
    pub fn add_sub_entry(&mut self, index: u16, sub: u8, slot: SubEntry) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(Error::UnknownIndex(index))?;
        if entry.kind == ObjectKind::Var {
            return Err(Error::Eds(format!(
                "entry {:#06X} is a Var and may not have subentries",
                index
            )));
        }
        while entry.subs.len() < sub as usize {
            entry.subs.push(SubEntry::reserved_slot());
        }
        if entry.subs.len() > sub as usize {
            return Err(Error::Eds(format!(
                "subindex {:#04X} of {:#06X} defined twice",
                sub, index
            )));
        }
        entry.subs.push(slot);
        Ok(())
    }

    /// Synthesizes the mandatory subindex 0 of compound entries whose
    /// descriptor did not spell it out, and logs entries whose declared
    /// object type does not match their populated slots.
    pub fn finish_load(&mut self) {
        for entry in self.entries.values_mut() {
            match entry.kind {
                ObjectKind::Var => {}
                _ => {
                    let count = entry.meaningful_subs();
                    if entry.subs.is_empty() {
                        log::warn!(
                            "Compound entry {:#06X} has no subindex 0; synthesizing one",
                            entry.index
                        );
                        entry.subs.push(SubEntry::new(
                            "Number of entries",
                            DataType::U8,
                            Access::Ro,
                            Some(Value::U8(count)),
                        ));
                    } else if entry.subs.len() == 1 {
                        log::debug!(
                            "Object type of {:#06X} is {:?} but only subindex 0 is populated",
                            entry.index,
                            entry.kind
                        );
                    }
                }
            }
        }
    }

    pub fn entry(&self, index: u16) -> Result<&Entry> {
        self.entries.get(&index).ok_or(Error::UnknownIndex(index))
    }

    pub fn contains(&self, index: u16, sub: u8) -> bool {
        self.entries
            .get(&index)
            .map(|e| e.contains(sub))
            .unwrap_or(false)
    }

    fn slot(&self, index: u16, sub: u8) -> Result<&SubEntry> {
        let entry = self.entry(index)?;
        match entry.sub(sub) {
            Some(slot) if !slot.reserved => Ok(slot),
            _ => Err(Error::UnknownSubindex(index, sub)),
        }
    }

    /// Reads the live value of a slot, enforcing the access attribute.
    pub fn value(&self, index: u16, sub: u8) -> Result<Option<Value>> {
        let slot = self.slot(index, sub)?;
        if !slot.access.readable() {
            return Err(Error::AccessDenied {
                index,
                sub,
                op: "read",
            });
        }
        Ok(slot.value.clone())
    }

    /// Writes a slot, enforcing access and coercing the value to the
    /// declared data type.
    pub fn set_value(&mut self, index: u16, sub: u8, value: Value) -> Result<()> {
        let direct = self.direct;
        let entry = self
            .entries
            .get_mut(&index)
            .ok_or(Error::UnknownIndex(index))?;
        let slot = match entry.subs.get_mut(sub as usize) {
            Some(slot) if !slot.reserved => slot,
            _ => return Err(Error::UnknownSubindex(index, sub)),
        };
        if slot.access == Access::Const || !(slot.access.writable() || direct) {
            return Err(Error::AccessDenied {
                index,
                sub,
                op: "written",
            });
        }
        let limit = slot.declared_len();
        slot.value = Some(coerce(slot.data_type, value, limit)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectDictionary {
        let mut od = ObjectDictionary::new(42);
        od.add_entry(Entry::new_var(
            0x1000,
            "Device type",
            DataType::U32,
            Access::Ro,
            Some(Value::U32(0x0192)),
        ))
        .unwrap();
        od.add_entry(Entry::new_compound(0x2000, ObjectKind::Record, "Chains"))
            .unwrap();
        od.add_sub_entry(
            0x2000,
            0,
            SubEntry::new("Number of entries", DataType::U8, Access::Ro, Some(Value::U8(4))),
        )
        .unwrap();
        for i in 1..=4u8 {
            od.add_sub_entry(
                0x2000,
                i,
                SubEntry::new(
                    format!("Chain {}", i - 1),
                    DataType::U16,
                    Access::Rw,
                    Some(Value::U16(0)),
                ),
            )
            .unwrap();
        }
        od.add_entry(Entry::new_var(
            0x2002,
            "Trigger",
            DataType::U8,
            Access::Wo,
            None,
        ))
        .unwrap();
        od.finish_load();
        od
    }

    #[test]
    fn get_set_get_round_trip() {
        let mut od = sample();
        assert_eq!(od.value(0x2000, 1).unwrap(), Some(Value::U16(0)));
        od.set_value(0x2000, 1, Value::U16(0x0005)).unwrap();
        assert_eq!(od.value(0x2000, 1).unwrap(), Some(Value::U16(0x0005)));
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut od = sample();
        assert!(matches!(
            od.set_value(0x1000, 0, Value::U32(1)),
            Err(Error::AccessDenied { op: "written", .. })
        ));
        assert!(matches!(
            od.set_value(0x2000, 0, Value::U8(3)),
            Err(Error::AccessDenied { .. })
        ));
    }

    #[test]
    fn write_only_rejects_reads() {
        let mut od = sample();
        od.set_value(0x2002, 0, Value::U8(1)).unwrap();
        assert!(matches!(
            od.value(0x2002, 0),
            Err(Error::AccessDenied { op: "read", .. })
        ));
    }

    #[test]
    fn unknown_addresses() {
        let od = sample();
        assert!(matches!(od.value(0x3000, 0), Err(Error::UnknownIndex(0x3000))));
        assert!(matches!(
            od.value(0x2000, 9),
            Err(Error::UnknownSubindex(0x2000, 9))
        ));
    }

    #[test]
    fn reserved_slots_reject_access() {
        let mut od = ObjectDictionary::new(1);
        od.add_entry(Entry::new_compound(0x2100, ObjectKind::Array, "Sparse"))
            .unwrap();
        od.add_sub_entry(
            0x2100,
            0,
            SubEntry::new("Number of entries", DataType::U8, Access::Ro, Some(Value::U8(1))),
        )
        .unwrap();
        od.add_sub_entry(
            0x2100,
            3,
            SubEntry::new("Slot", DataType::U8, Access::Rw, None),
        )
        .unwrap();
        od.finish_load();
        assert!(matches!(
            od.value(0x2100, 1),
            Err(Error::UnknownSubindex(0x2100, 1))
        ));
        assert!(matches!(
            od.set_value(0x2100, 2, Value::U8(1)),
            Err(Error::UnknownSubindex(0x2100, 2))
        ));
        assert!(od.contains(0x2100, 3));
    }

    #[test]
    fn type_mismatch_on_write() {
        let mut od = sample();
        assert!(matches!(
            od.set_value(0x2000, 1, Value::U32(0x1_0000)),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn direct_access_bypasses_ro_but_not_const() {
        let mut od = sample().with_direct_access();
        od.set_value(0x1000, 0, Value::U32(7)).unwrap();
        assert_eq!(od.value(0x1000, 0).unwrap(), Some(Value::U32(7)));

        let mut od = ObjectDictionary::new(1).with_direct_access();
        od.add_entry(Entry::new_var(
            0x1008,
            "Device name",
            DataType::VisibleString,
            Access::Const,
            Some(Value::String("DCS".into())),
        ))
        .unwrap();
        assert!(matches!(
            od.set_value(0x1008, 0, Value::String("other".into())),
            Err(Error::AccessDenied { .. })
        ));
    }

    #[test]
    fn var_entries_answer_at_subindex_zero() {
        let od = sample();
        assert_eq!(od.value(0x1000, 0).unwrap(), Some(Value::U32(0x0192)));
        assert!(od.contains(0x1000, 0));
        assert!(!od.contains(0x1000, 1));
    }
}
