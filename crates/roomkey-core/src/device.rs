//! Device types for the room/device/button model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Backlight level sentinel for "not yet reported"
pub const UNKNOWN_LEVEL: i32 = -1;

/// Strip everything up to and including the last `/` of an exported ID.
///
/// The export sometimes qualifies IDs with a processor or link prefix
/// (`"A/12"`); the control network only knows the trailing part.
pub fn normalize_id(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Canonical device identifier as addressed on the control network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a DeviceId from an export ID field, normalizing it
    pub fn from_export(raw: &str) -> Self {
        Self(normalize_id(raw).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::from_export(value)
    }
}

/// Reported state of a keypad button LED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonState {
    Active,
    Inactive,
    Unknown,
}

impl Default for ButtonState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl ButtonState {
    /// Map a protocol flag (`0`/`1`) to a state
    pub fn from_flag(flag: &str) -> Self {
        match flag.trim() {
            "1" => Self::Active,
            "0" => Self::Inactive,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ButtonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Which backlight register of a keypad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backlight {
    /// Level of LEDs whose button is active (register 36)
    Active,
    /// Level of LEDs whose button is inactive (register 37)
    Inactive,
}

impl Backlight {
    /// Protocol register number under the backlight sub-address
    pub fn register(self) -> u8 {
        match self {
            Self::Active => 36,
            Self::Inactive => 37,
        }
    }
}

/// A button entry of a device, in ordinal order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Engraving/label text
    pub label: String,
    /// Raw type tag from the export (e.g. "Button 3")
    pub tag: String,
    /// Synthesized to fill an ordinal gap
    #[serde(default)]
    pub placeholder: bool,
}

impl Button {
    pub fn new(label: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tag: tag.into(),
            placeholder: false,
        }
    }

    /// Placeholder for an ordinal the export skipped
    pub fn missing(ordinal: u8) -> Self {
        Self {
            label: format!("(missing button {})", ordinal),
            tag: format!("Button {}", ordinal),
            placeholder: true,
        }
    }
}

/// A device in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Last path segment of the export path
    pub name: String,
    /// Model number (e.g. "MWP-U-4W")
    pub model: String,
    /// Canonical network ID
    pub id: DeviceId,
    /// Buttons in ordinal order (ordinal = index + 1)
    pub buttons: Vec<Button>,
    /// Reported LED state by 1-based ordinal
    #[serde(default)]
    pub button_states: BTreeMap<u8, ButtonState>,
    /// Active backlight level, `UNKNOWN_LEVEL` until reported
    pub active_brightness: i32,
    /// Inactive backlight level, `UNKNOWN_LEVEL` until reported
    pub inactive_brightness: i32,
}

impl Device {
    pub fn new(name: impl Into<String>, model: impl Into<String>, id: DeviceId) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            id,
            buttons: Vec::new(),
            button_states: BTreeMap::new(),
            active_brightness: UNKNOWN_LEVEL,
            inactive_brightness: UNKNOWN_LEVEL,
        }
    }

    pub fn button_state(&self, ordinal: u8) -> ButtonState {
        self.button_states
            .get(&ordinal)
            .copied()
            .unwrap_or_default()
    }

    pub fn backlight(&self, kind: Backlight) -> i32 {
        match kind {
            Backlight::Active => self.active_brightness,
            Backlight::Inactive => self.inactive_brightness,
        }
    }

    /// Set a backlight level, returning true if it changed
    pub fn set_backlight(&mut self, kind: Backlight, level: i32) -> bool {
        let slot = match kind {
            Backlight::Active => &mut self.active_brightness,
            Backlight::Inactive => &mut self.inactive_brightness,
        };
        if *slot == level {
            return false;
        }
        *slot = level;
        true
    }

    /// Whether the model belongs to one of the given families
    pub fn is_model_family(&self, prefixes: &[String]) -> bool {
        prefixes.iter().any(|p| self.model.starts_with(p.as_str()))
    }

    /// Physical button count implied by the model number, if recognizable
    pub fn keypad_width(&self) -> Option<u8> {
        if self.model.contains("-2W") {
            Some(2)
        } else if self.model.contains("-4W") {
            Some(4)
        } else {
            None
        }
    }

    /// Number of buttons that came from the export (placeholders excluded)
    pub fn real_button_count(&self) -> usize {
        self.buttons.iter().filter(|b| !b.placeholder).count()
    }
}

/// A room and its devices in export order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub key: String,
    pub devices: Vec<Device>,
}

/// Room -> device hierarchy, rooms in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomTopology {
    pub rooms: Vec<Room>,
}

impl RoomTopology {
    pub fn new() -> Self {
        Self { rooms: Vec::new() }
    }

    pub fn room(&self, key: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.key == key)
    }

    pub fn room_mut(&mut self, key: &str) -> Option<&mut Room> {
        self.rooms.iter_mut().find(|r| r.key == key)
    }

    /// Get a room, creating it at the end if it does not exist
    pub fn room_entry(&mut self, key: &str) -> &mut Room {
        let idx = match self.rooms.iter().position(|r| r.key == key) {
            Some(idx) => idx,
            None => {
                self.rooms.push(Room {
                    key: key.to_string(),
                    devices: Vec::new(),
                });
                self.rooms.len() - 1
            }
        };
        &mut self.rooms[idx]
    }

    pub fn room_keys(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(|r| r.key.as_str())
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.rooms.iter().flat_map(|r| r.devices.iter())
    }

    /// First device with the given ID across all rooms
    pub fn find_device(&self, id: &str) -> Option<&Device> {
        self.devices().find(|d| d.id.as_str() == id)
    }

    pub fn find_device_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.rooms
            .iter_mut()
            .flat_map(|r| r.devices.iter_mut())
            .find(|d| d.id.as_str() == id)
    }

    pub fn device_count(&self) -> usize {
        self.rooms.iter().map(|r| r.devices.len()).sum()
    }
}

/// One key/value row of a section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionEntry {
    pub key: String,
    pub value: String,
}

/// A named group of key/value entries from the export's second region
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub entries: Vec<SectionEntry>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Insert an entry, overwriting the value of an existing key in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.value = value,
            None => self.entries.push(SectionEntry { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }
}

/// All sections in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sections {
    pub sections: Vec<Section>,
}

impl Sections {
    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Get a section, creating it at the end if it does not exist
    pub fn entry(&mut self, name: &str) -> &mut Section {
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    /// First entry (section name, entry) whose value equals `value`
    pub fn find_by_value(&self, value: &str) -> Option<(&Section, &SectionEntry)> {
        self.sections.iter().find_map(|section| {
            section
                .entries
                .iter()
                .find(|e| e.value == value)
                .map(|entry| (section, entry))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
