//! Device registry: the live room/device/button state
//!
//! The registry owns the current ingestion result and is the single source of
//! truth for button and backlight state. The response dispatcher is its only
//! writer; front ends read snapshots at any time and must tolerate a value
//! changing between two reads.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::device::{Backlight, ButtonState, Device, Room, Section, SectionEntry, Sections};
use crate::export::Ingestion;
use crate::notify::{ChangeNotifier, Notification};

/// Model prefixes of the keypad families worth polling
pub const DEFAULT_KEYPAD_MODELS: &[&str] = &["MWP-U", "MWP-B"];

/// Registry of devices and sections, with change notifications
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    state: RwLock<Ingestion>,
    notifier: ChangeNotifier,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding an ingestion result
    pub fn from_ingestion(ingestion: Ingestion) -> Self {
        Self {
            state: RwLock::new(ingestion),
            notifier: ChangeNotifier::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Ingestion> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ingestion> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Replace the whole model with a new load
    pub fn load(&self, ingestion: Ingestion) {
        let rooms = ingestion.topology.rooms.len();
        let devices = ingestion.topology.device_count();
        *self.write() = ingestion;
        info!(rooms, devices, "Registry loaded");
        self.notifier.publish(Notification::Reloaded);
    }

    /// Snapshot of the whole model
    pub fn snapshot(&self) -> Ingestion {
        self.read().clone()
    }

    pub fn rooms(&self) -> Vec<String> {
        self.read()
            .topology
            .room_keys()
            .map(str::to_string)
            .collect()
    }

    pub fn room(&self, key: &str) -> Option<Room> {
        self.read().topology.room(key).cloned()
    }

    pub fn room_devices(&self, key: &str) -> Vec<Device> {
        self.read()
            .topology
            .room(key)
            .map(|r| r.devices.clone())
            .unwrap_or_default()
    }

    pub fn sections(&self) -> Sections {
        self.read().sections.clone()
    }

    pub fn section(&self, name: &str) -> Option<Section> {
        self.read().sections.get(name).cloned()
    }

    /// Find a device by ID across all rooms
    pub fn find_device(&self, id: &str) -> Option<Device> {
        self.read().topology.find_device(id).cloned()
    }

    pub fn button_state(&self, id: &str, ordinal: u8) -> Option<ButtonState> {
        self.read()
            .topology
            .find_device(id)
            .map(|d| d.button_state(ordinal))
    }

    /// Record a button state and notify; returns false for unknown devices
    pub fn set_button_state(&self, id: &str, ordinal: u8, state: ButtonState) -> bool {
        let device_id = {
            let mut guard = self.write();
            let Some(device) = guard.topology.find_device_mut(id) else {
                debug!(device = %id, ordinal, "Button state for unknown device");
                return false;
            };
            device.button_states.insert(ordinal, state);
            device.id.clone()
        };
        debug!(device = %device_id, ordinal, state = %state, "Button state updated");
        self.notifier.button_changed(device_id, ordinal, state);
        true
    }

    pub fn backlight(&self, id: &str, kind: Backlight) -> Option<i32> {
        self.read()
            .topology
            .find_device(id)
            .map(|d| d.backlight(kind))
    }

    /// Record a backlight level, notifying only when it changed
    pub fn set_backlight(&self, id: &str, kind: Backlight, level: i32) -> bool {
        let changed = {
            let mut guard = self.write();
            let Some(device) = guard.topology.find_device_mut(id) else {
                debug!(device = %id, ?kind, level, "Backlight level for unknown device");
                return false;
            };
            device.set_backlight(kind, level).then(|| device.id.clone())
        };
        if let Some(device_id) = changed {
            debug!(device = %device_id, ?kind, level, "Backlight level updated");
            self.notifier.publish(Notification::BacklightChanged {
                device_id,
                kind,
                level,
            });
        }
        true
    }

    /// Devices of a room whose model starts with one of the prefixes
    pub fn keypads_in_room(&self, room: &str, model_prefixes: &[String]) -> Vec<Device> {
        self.read()
            .topology
            .room(room)
            .map(|r| {
                r.devices
                    .iter()
                    .filter(|d| d.is_model_family(model_prefixes))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First section entry whose value equals `value`, as (section name, entry)
    pub fn find_section_entry(&self, value: &str) -> Option<(String, SectionEntry)> {
        self.read()
            .sections
            .find_by_value(value)
            .map(|(section, entry)| (section.name.clone(), entry.clone()))
    }

    /// Correlate a reported level with a section entry and notify
    pub fn report_level(&self, id: &str, percentage: f64) -> bool {
        let Some((section, entry)) = self.find_section_entry(id) else {
            debug!(id = %id, percentage, "Level for ID not found in any section");
            return false;
        };
        debug!(id = %id, section = %section, key = %entry.key, percentage, "Level reported");
        self.notifier.publish(Notification::BrightnessChanged {
            id: id.to_string(),
            percentage,
            section,
            key: entry.key,
        });
        true
    }
}
