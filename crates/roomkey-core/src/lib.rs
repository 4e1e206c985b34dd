//! roomkey Core - Device model, export ingestion, and device registry
//!
//! This crate provides the foundational types for the roomkey system:
//! - Room/device/button model for keypad installations
//! - Two-pass ingestion of the tabular installation export
//! - Device registry holding live button and backlight state
//! - Change notifications for observers of the registry

pub mod device;
pub mod export;
pub mod notify;
pub mod registry;

pub use device::{
    normalize_id, Backlight, Button, ButtonState, Device, DeviceId, Room, RoomTopology, Section,
    SectionEntry, Sections, UNKNOWN_LEVEL,
};
pub use export::{load_export, parse_export, ExportError, ExportFormat, Ingestion};
pub use notify::{ChangeNotifier, Notification};
pub use registry::{DeviceRegistry, DEFAULT_KEYPAD_MODELS};
