//! EDS descriptor consumption.
//!
//! Reads the flat-section electronic-data-sheet format: `[XXXX]` sections
//! describe top-level entries, `[XXXXsubNN]` sections their subentries and
//! `[DeviceComissioning]` the commissioned bit rate and node id. Only the
//! keys the engine consumes are interpreted; everything else is carried
//! over the parser untouched.

use crate::od::{Access, Entry, ObjectDictionary, ObjectKind, SubEntry};
use crate::value::{parse_default, parse_int, DataType};
use crate::{Error, Result};

struct Section {
    name: String,
    keys: Vec<(String, String)>,
}

impl Section {
    fn get(&self, key: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn split_sections(source: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    for (lineno, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            let name = line
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .ok_or_else(|| Error::Eds(format!("bad section header on line {}", lineno + 1)))?;
            sections.push(Section {
                name: name.to_string(),
                keys: Vec::new(),
            });
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim();
        let value = parts
            .next()
            .ok_or_else(|| Error::Eds(format!("line {} is neither section nor key", lineno + 1)))?
            .trim();
        let section = sections
            .last_mut()
            .ok_or_else(|| Error::Eds(format!("key before any section on line {}", lineno + 1)))?;
        section.keys.push((key.to_string(), value.to_string()));
    }
    Ok(sections)
}

fn section_index(name: &str) -> Option<u16> {
    if name.len() == 4 && name.chars().all(|c| c.is_ascii_hexdigit()) {
        u16::from_str_radix(name, 16).ok()
    } else {
        None
    }
}

fn section_subindex(name: &str) -> Option<(u16, u8)> {
    let sub_at = name.to_ascii_lowercase().find("sub")?;
    if sub_at != 4 {
        return None;
    }
    let index = section_index(&name[..4])?;
    let sub = u8::from_str_radix(&name[sub_at + 3..], 16).ok()?;
    Some((index, sub))
}

fn required<'a>(section: &'a Section, key: &str) -> Result<&'a str> {
    section
        .get(key)
        .ok_or_else(|| Error::Eds(format!("section [{}] is missing {}", section.name, key)))
}

fn parse_data_type(section: &Section) -> Result<DataType> {
    let raw = required(section, "DataType")?;
    let code = parse_int(raw)
        .and_then(|v| if (0..=0xFFFF).contains(&v) { Some(v as u16) } else { None })
        .ok_or_else(|| Error::Eds(format!("bad DataType {:?} in [{}]", raw, section.name)))?;
    DataType::from_code(code)
        .ok_or_else(|| Error::Eds(format!("unsupported DataType {:#06X} in [{}]", code, section.name)))
}

fn parse_access(section: &Section) -> Result<Access> {
    let raw = required(section, "AccessType")?;
    Access::from_keyword(raw)
        .ok_or_else(|| Error::Eds(format!("bad AccessType {:?} in [{}]", raw, section.name)))
}

/// Builds an object dictionary from an EDS descriptor.
///
/// `$NODEID` defaults are substituted with `node_id`. Entries whose
/// declared object type does not match their populated subindexes are
/// accepted but logged.
pub fn load_from_eds(source: &str, node_id: u8) -> Result<ObjectDictionary> {
    log::debug!("Importing object dictionary from EDS");
    let sections = split_sections(source)?;
    let mut od = ObjectDictionary::new(node_id);

    for section in &sections {
        if section.name.eq_ignore_ascii_case("DeviceComissioning") {
            if let Some(raw) = section.get("Baudrate") {
                match parse_int(raw) {
                    Some(kbit) if kbit > 0 => od.bitrate = Some(kbit as u32 * 1000),
                    _ => log::warn!("Ignoring unparsable Baudrate {:?}", raw),
                }
            }
            if let Some(raw) = section.get("NodeID") {
                match parse_int(raw) {
                    Some(id) if (1..=127).contains(&id) => {
                        log::debug!("Descriptor commissions node id {}", id)
                    }
                    _ => log::warn!("Ignoring unusable NodeID {:?}", raw),
                }
            }
            continue;
        }

        if let Some(index) = section_index(&section.name) {
            let name = required(&section, "ParameterName")?;
            let kind = match section.get("ObjectType") {
                Some(raw) => parse_int(raw)
                    .and_then(|v| ObjectKind::from_code(v as u8))
                    .ok_or_else(|| {
                        Error::Eds(format!("bad ObjectType {:?} in [{}]", raw, section.name))
                    })?,
                None => {
                    log::debug!("Section [{}] has no ObjectType; assuming Var", section.name);
                    ObjectKind::Var
                }
            };
            if kind == ObjectKind::Var {
                let data_type = parse_data_type(&section)?;
                let access = parse_access(&section)?;
                let default = match section.get("DefaultValue") {
                    Some(raw) => Some(parse_default(data_type, raw, node_id)?),
                    None => None,
                };
                od.add_entry(Entry::new_var(index, name, data_type, access, default))?;
            } else {
                od.add_entry(Entry::new_compound(index, kind, name))?;
                if section.get("CompactSubObj").is_some() {
                    log::error!(
                        "CompactSubObj in [{}] is not supported; only subindex 0 is created",
                        section.name
                    );
                    od.add_sub_entry(
                        index,
                        0,
                        SubEntry::new(
                            "Number of entries",
                            DataType::U8,
                            Access::Ro,
                            Some(crate::value::Value::U8(0)),
                        ),
                    )?;
                }
            }
            continue;
        }

        if let Some((index, sub)) = section_subindex(&section.name) {
            let entry = od.entry(index).map_err(|_| {
                Error::Eds(format!(
                    "section [{}] references undefined entry {:#06X}",
                    section.name, index
                ))
            })?;
            if entry.kind == ObjectKind::Var {
                log::error!(
                    "Top-level entry {:#06X} is a Var and may not have subentries",
                    index
                );
                continue;
            }
            let name = required(&section, "ParameterName")?;
            let data_type = parse_data_type(&section)?;
            let access = parse_access(&section)?;
            let default = match section.get("DefaultValue") {
                Some(raw) => Some(parse_default(data_type, raw, node_id)?),
                None => None,
            };
            od.add_sub_entry(index, sub, SubEntry::new(name, data_type, access, default))?;
            continue;
        }

        // FileInfo, DeviceInfo, MandatoryObjects etc. carry nothing the
        // engine consumes.
        log::trace!("Skipping EDS section [{}]", section.name);
    }

    od.finish_load();
    log::debug!("Created object dictionary with {} entries from EDS", od.len());
    Ok(od)
}
