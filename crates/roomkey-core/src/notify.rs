//! Change notifications for registry observers

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::device::{Backlight, ButtonState, DeviceId};

/// Default capacity of the notification channel
const CHANNEL_CAPACITY: usize = 256;

/// Event published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A button LED state was reported
    ButtonChanged {
        device_id: DeviceId,
        ordinal: u8,
        state: ButtonState,
    },
    /// A lighting level was reported for an ID known to a section
    BrightnessChanged {
        id: String,
        percentage: f64,
        section: String,
        key: String,
    },
    /// A keypad backlight level changed
    BacklightChanged {
        device_id: DeviceId,
        kind: Backlight,
        level: i32,
    },
    /// Free-form protocol log line
    Log { text: String },
    /// The registry was replaced by a new load
    Reloaded,
}

/// Publish/subscribe handle; clones share the same channel
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish a notification; having no subscribers is not an error
    pub fn publish(&self, notification: Notification) {
        trace!(?notification, "Publishing notification");
        let _ = self.tx.send(notification);
    }

    pub fn button_changed(&self, device_id: DeviceId, ordinal: u8, state: ButtonState) {
        self.publish(Notification::ButtonChanged {
            device_id,
            ordinal,
            state,
        });
    }

    pub fn log_line(&self, text: impl Into<String>) {
        self.publish(Notification::Log { text: text.into() });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
