//! Outbound command encoding and batch query helpers
//!
//! Every command is one line with no reply token. Replies arrive later on the
//! same stream and are matched by the dispatcher purely by the ID they carry.

use roomkey_core::{Backlight, Device, DeviceRegistry, Section};
use std::fmt;
use tracing::{debug, info};

use crate::session::{ProtocolSession, SessionError};

/// Sub-address of the keypad backlight registers
pub const BACKLIGHT_COMPONENT: u8 = 89;

/// Action number of a button LED state query
pub const LED_STATE_ACTION: u8 = 9;

/// Output channel carrying the lighting level
pub const LEVEL_CHANNEL: u8 = 1;

/// Commands understood by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `?DEVICE,<id>,89,<36|37>`
    QueryBacklight { device_id: String, kind: Backlight },
    /// `?DEVICE,<id>,8<n>,9`
    QueryButton { device_id: String, ordinal: u8 },
    /// `?OUTPUT,<id>,1`
    QueryOutput { id: String },
    /// `GETTIME`
    GetTime,
    /// `SETTIME,<hour>`
    SetTime { hour: u8 },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::QueryBacklight { device_id, kind } => write!(
                f,
                "?DEVICE,{},{},{}",
                device_id,
                BACKLIGHT_COMPONENT,
                kind.register()
            ),
            Command::QueryButton { device_id, ordinal } => {
                write!(f, "?DEVICE,{},8{},{}", device_id, ordinal, LED_STATE_ACTION)
            }
            Command::QueryOutput { id } => write!(f, "?OUTPUT,{},{}", id, LEVEL_CHANNEL),
            Command::GetTime => f.write_str("GETTIME"),
            Command::SetTime { hour } => write!(f, "SETTIME,{}", hour),
        }
    }
}

/// Batch query helpers over a session; no reply waiting
pub struct CommandSender<'a> {
    session: &'a ProtocolSession,
}

impl<'a> CommandSender<'a> {
    pub fn new(session: &'a ProtocolSession) -> Self {
        Self { session }
    }

    /// Send one command
    pub async fn send(&self, command: &Command) -> Result<(), SessionError> {
        debug!(command = %command, "Sending command");
        self.session.send(&command.to_string()).await
    }

    /// Active and inactive backlight queries for every keypad of a room
    pub async fn query_backlights(
        &self,
        registry: &DeviceRegistry,
        room: &str,
        model_prefixes: &[String],
    ) -> Result<usize, SessionError> {
        let keypads = registry.keypads_in_room(room, model_prefixes);
        let mut sent = 0;
        for device in &keypads {
            for kind in [Backlight::Active, Backlight::Inactive] {
                self.send(&Command::QueryBacklight {
                    device_id: device.id.to_string(),
                    kind,
                })
                .await?;
                sent += 1;
            }
        }
        info!(room = %room, keypads = keypads.len(), "Queried backlight levels");
        Ok(sent)
    }

    /// One LED state query per button ordinal of the device
    pub async fn query_buttons(&self, device: &Device) -> Result<usize, SessionError> {
        let count = u8::try_from(device.buttons.len()).unwrap_or(u8::MAX);
        for ordinal in 1..=count {
            self.send(&Command::QueryButton {
                device_id: device.id.to_string(),
                ordinal,
            })
            .await?;
        }
        debug!(device = %device.id, buttons = count, "Queried button states");
        Ok(usize::from(count))
    }

    pub async fn query_output(&self, id: &str) -> Result<(), SessionError> {
        self.send(&Command::QueryOutput { id: id.to_string() }).await
    }

    /// Level query for every entry value of a section
    pub async fn query_section_levels(&self, section: &Section) -> Result<usize, SessionError> {
        for entry in &section.entries {
            self.query_output(&entry.value).await?;
        }
        info!(section = %section.name, entries = section.entries.len(), "Queried section levels");
        Ok(section.entries.len())
    }

    pub async fn get_time(&self) -> Result<(), SessionError> {
        self.send(&Command::GetTime).await
    }

    pub async fn set_time(&self, hour: u8) -> Result<(), SessionError> {
        self.send(&Command::SetTime { hour }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomkey_core::{parse_export, ExportFormat, DEFAULT_KEYPAD_MODELS};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_command_lines() {
        let active = Command::QueryBacklight {
            device_id: "55".into(),
            kind: Backlight::Active,
        };
        let inactive = Command::QueryBacklight {
            device_id: "55".into(),
            kind: Backlight::Inactive,
        };
        assert_eq!(active.to_string(), "?DEVICE,55,89,36");
        assert_eq!(inactive.to_string(), "?DEVICE,55,89,37");
        assert_eq!(
            Command::QueryButton {
                device_id: "55".into(),
                ordinal: 3
            }
            .to_string(),
            "?DEVICE,55,83,9"
        );
        assert_eq!(Command::QueryOutput { id: "21".into() }.to_string(), "?OUTPUT,21,1");
        assert_eq!(Command::GetTime.to_string(), "GETTIME");
        assert_eq!(Command::SetTime { hour: 7 }.to_string(), "SETTIME,7");
    }

    #[tokio::test]
    async fn test_batch_queries_write_expected_lines() {
        let export = "\n\n\n\n\n\n\
Home\\Kitchen\\Keypad 1,MWP-U-4W,55,,,\n\
,,,Button 1,,On\n\
,,,Button 3,,Scene\n\
Home\\Kitchen\\Dimmer,HQRD-6D,60,,,\n\
Zone Name\n\
Kitchen Downlights,21\n\
Island,22\n";
        let registry =
            DeviceRegistry::from_ingestion(parse_export(export.as_bytes(), &ExportFormat::default()));
        let families: Vec<String> = DEFAULT_KEYPAD_MODELS.iter().map(|s| s.to_string()).collect();

        let (client, mut server) = tokio::io::duplex(4096);
        let session = ProtocolSession::new(Default::default());
        session.attach(client).await;
        let sender = CommandSender::new(&session);

        assert_eq!(
            sender
                .query_backlights(&registry, "Home\\Kitchen", &families)
                .await
                .unwrap(),
            2
        );
        let keypad = registry.find_device("55").unwrap();
        assert_eq!(sender.query_buttons(&keypad).await.unwrap(), 3);
        let zones = registry.section("Zone Name").unwrap();
        assert_eq!(sender.query_section_levels(&zones).await.unwrap(), 2);
        sender.set_time(18).await.unwrap();
        session.close().await;

        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        let lines: Vec<&str> = written.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(
            lines,
            vec![
                "?DEVICE,55,89,36",
                "?DEVICE,55,89,37",
                "?DEVICE,55,81,9",
                "?DEVICE,55,82,9",
                "?DEVICE,55,83,9",
                "?OUTPUT,21,1",
                "?OUTPUT,22,1",
                "SETTIME,18",
            ]
        );
    }
}
