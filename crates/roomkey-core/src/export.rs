//! Installation export ingestion
//!
//! The export is a comma-separated report with a fixed preamble. Its first
//! region lists devices and their buttons, where repeated identifying fields
//! are left blank and must be carried forward from earlier rows. A later
//! region holds named sections of key/value rows (zones, variables, ...).
//!
//! Ingestion makes two independent passes over the same input and returns
//! both results together. Malformed rows are skipped, never fatal.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::device::{normalize_id, Button, Device, DeviceId, RoomTopology, Sections};

/// Minimum column count of a device-region row
const MIN_DEVICE_COLUMNS: usize = 6;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to read export {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Layout knobs of the export format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportFormat {
    /// Leading lines skipped by both passes
    pub preamble_lines: usize,
    /// Hierarchy separator inside the path column
    pub path_separator: char,
    /// Substring of the type tag that marks a button row
    pub button_marker: String,
    /// Extra trailing tokens stripped from paths before splitting
    pub path_suffixes: Vec<String>,
    /// First-column value that opens the section region
    pub section_anchor: String,
    /// Name of the last section; the pass ends after its entries
    pub section_terminator: String,
}

impl Default for ExportFormat {
    fn default() -> Self {
        Self {
            preamble_lines: 6,
            path_separator: '\\',
            button_marker: "Button".to_string(),
            path_suffixes: Vec::new(),
            section_anchor: "Zone Name".to_string(),
            section_terminator: "Thermostat Mode".to_string(),
        }
    }
}

/// Result of ingesting one export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ingestion {
    pub topology: RoomTopology,
    pub sections: Sections,
}

/// Read and parse an export file
pub fn load_export(path: &Path, format: &ExportFormat) -> Result<Ingestion, ExportError> {
    let bytes = std::fs::read(path).map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let ingestion = parse_export(&bytes, format);
    info!(
        path = %path.display(),
        rooms = ingestion.topology.rooms.len(),
        devices = ingestion.topology.device_count(),
        sections = ingestion.sections.sections.len(),
        "Loaded export"
    );
    Ok(ingestion)
}

/// Parse export bytes into topology and sections
pub fn parse_export(bytes: &[u8], format: &ExportFormat) -> Ingestion {
    let text = String::from_utf8_lossy(bytes);
    let rows: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .skip(format.preamble_lines)
        .collect();

    let topology = parse_devices(&rows, format);
    let sections = parse_sections(&rows, format);

    Ingestion { topology, sections }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Ordinal carried by a button tag: its trailing ASCII digit
fn button_ordinal(tag: &str) -> Option<u8> {
    tag.trim_end()
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .and_then(|d| u8::try_from(d).ok())
}

/// Whether an ordinal falls in one of the keypad bands (1-4, 5-8)
fn is_banded(ordinal: u8) -> bool {
    (1..=8).contains(&ordinal)
}

/// Identity of the device that button rows attach to
struct Cursor {
    room: String,
    name: String,
    id: DeviceId,
    last_ordinal: u8,
}

/// Pass 1 state: the carry-forward cursor plus the topology being built
struct DevicePass<'a> {
    format: &'a ExportFormat,
    topology: RoomTopology,
    cursor: Option<Cursor>,
}

impl<'a> DevicePass<'a> {
    fn new(format: &'a ExportFormat) -> Self {
        Self {
            format,
            topology: RoomTopology::new(),
            cursor: None,
        }
    }

    fn row(&mut self, line_no: usize, columns: &[&str]) {
        let path = columns[0];
        let model = columns[1].trim();
        let id = columns[2];
        let tag = columns[3].trim();
        let label = columns[5].trim();

        let carries_button = tag.contains(self.format.button_marker.as_str()) && !label.is_empty();

        if is_blank(id) {
            if carries_button {
                self.attach_button(line_no, tag, label);
            }
            return;
        }

        let Some((room, name)) = self.split_path(path) else {
            trace!(line = line_no, "Skipping device row without usable path");
            return;
        };

        let id = DeviceId::from_export(id);
        let room_entry = self.topology.room_entry(&room);
        let existing = room_entry
            .devices
            .iter()
            .position(|d| d.name == name && d.id == id);
        let button_count = match existing {
            Some(idx) => room_entry.devices[idx].buttons.len(),
            None => {
                debug!(room = %room, device = %name, id = %id, model = %model, "Registered device");
                room_entry.devices.push(Device::new(name.clone(), model, id.clone()));
                0
            }
        };

        self.cursor = Some(Cursor {
            room,
            name,
            id,
            last_ordinal: u8::try_from(button_count).unwrap_or(u8::MAX),
        });

        if carries_button {
            self.attach_button(line_no, tag, label);
        }
    }

    /// Split a path into (room key, device name), carrying forward when blank
    fn split_path(&self, raw: &str) -> Option<(String, String)> {
        let sep = self.format.path_separator;
        let mut path = raw.trim_end();
        loop {
            let before = path.len();
            path = path.trim_end_matches(sep).trim_end();
            for suffix in &self.format.path_suffixes {
                if let Some(stripped) = path.strip_suffix(suffix.as_str()) {
                    path = stripped.trim_end();
                }
            }
            if path.len() == before {
                break;
            }
        }

        let path = if path.trim().is_empty() {
            let cursor = self.cursor.as_ref()?;
            format!("{}{}{}", cursor.room, sep, cursor.name)
        } else {
            path.to_string()
        };

        let (room, name) = path.rsplit_once(sep)?;
        if room.trim().is_empty() || name.trim().is_empty() {
            return None;
        }
        Some((room.to_string(), name.to_string()))
    }

    fn attach_button(&mut self, line_no: usize, tag: &str, label: &str) {
        let Some(ordinal) = button_ordinal(tag) else {
            trace!(line = line_no, tag = %tag, "Skipping button without ordinal");
            return;
        };
        let Some(cursor) = self.cursor.as_mut() else {
            trace!(line = line_no, "Skipping button before any device");
            return;
        };
        let Some(device) = self
            .topology
            .room_mut(&cursor.room)
            .and_then(|room| {
                room.devices
                    .iter_mut()
                    .find(|d| d.name == cursor.name && d.id == cursor.id)
            })
        else {
            return;
        };

        if is_banded(ordinal) {
            let slot = usize::from(ordinal) - 1;
            if device.buttons.get(slot).is_some_and(|b| b.placeholder) {
                debug!(device = %cursor.id, ordinal, "Replacing placeholder button");
                device.buttons[slot] = Button::new(label, tag);
                return;
            }
            if ordinal > cursor.last_ordinal.saturating_add(1) {
                for missing in cursor.last_ordinal + 1..ordinal {
                    debug!(device = %cursor.id, ordinal = missing, "Filling missing button");
                    device.buttons.push(Button::missing(missing));
                }
            }
            if ordinal > cursor.last_ordinal {
                cursor.last_ordinal = ordinal;
            }
        }

        device.buttons.push(Button::new(label, tag));
    }
}

/// Pass 1: rooms, devices and buttons
fn parse_devices(rows: &[&str], format: &ExportFormat) -> RoomTopology {
    let mut pass = DevicePass::new(format);
    for (idx, line) in rows.iter().enumerate() {
        let columns: Vec<&str> = line.split(',').collect();
        if columns.len() < MIN_DEVICE_COLUMNS {
            continue;
        }
        pass.row(idx + format.preamble_lines + 1, &columns);
    }
    pass.topology
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionState {
    BeforeAnchor,
    AwaitingSectionName,
    InSection,
}

/// Pass 2: named key/value sections
fn parse_sections(rows: &[&str], format: &ExportFormat) -> Sections {
    let mut sections = Sections::default();
    let mut state = SectionState::BeforeAnchor;
    let mut current: Option<String> = None;
    let mut in_terminator = false;

    for line in rows {
        let mut columns = line.split(',');
        let key = columns.next().unwrap_or("").trim();
        let value = columns.next().unwrap_or("").trim();

        if key.is_empty() && in_terminator {
            break;
        }

        match state {
            SectionState::BeforeAnchor => {
                if key == format.section_anchor {
                    sections.entry(key);
                    current = Some(key.to_string());
                    state = SectionState::InSection;
                }
            }
            SectionState::AwaitingSectionName => {
                if key.is_empty() {
                    continue;
                }
                sections.entry(key);
                in_terminator = key == format.section_terminator;
                current = Some(key.to_string());
                state = SectionState::InSection;
            }
            SectionState::InSection => {
                if key.is_empty() {
                    state = SectionState::AwaitingSectionName;
                } else if key == format.section_anchor || key == format.section_terminator {
                    sections.entry(key);
                    in_terminator = key == format.section_terminator;
                    current = Some(key.to_string());
                } else if !value.is_empty() {
                    if let Some(name) = current.as_deref() {
                        sections.entry(name).insert(key, normalize_id(value));
                    }
                }
            }
        }
    }

    sections
}
