//! Application state: registry, session, and dispatcher wiring

use anyhow::{Context, Result};
use roomkey_core::{load_export, DeviceRegistry, Notification};
use roomkey_telnet::{CommandSender, LineBuffer, ProtocolSession, ResponseDispatcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Shared application state
pub struct AppState {
    /// Device registry
    pub registry: Arc<DeviceRegistry>,
    /// Session to the processor
    pub session: ProtocolSession,
    /// Inbound line buffer shared with the reader task
    pub buffer: LineBuffer,
    /// Configuration
    pub config: Config,
    scanner: Option<JoinHandle<()>>,
}

impl AppState {
    /// Create new application state with an empty registry
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let session = ProtocolSession::new(config.to_session_config())
            .with_notifier(registry.notifier().clone());

        Self {
            registry,
            session,
            buffer: LineBuffer::new(),
            config,
            scanner: None,
        }
    }

    /// Ingest an export into the registry
    pub fn load_export(&self, path: &Path) -> Result<()> {
        let ingestion = load_export(path, &self.config.to_export_format())
            .with_context(|| format!("loading export {}", path.display()))?;
        self.registry.load(ingestion);
        Ok(())
    }

    /// Connect and log in
    pub async fn connect(&self) -> Result<()> {
        let connection = &self.config.connection;
        self.session
            .connect(&connection.host, connection.port)
            .await
            .context("connecting to processor")?;
        self.session
            .login(&self.config.to_login_mode())
            .await
            .context("logging in")?;
        Ok(())
    }

    /// Start the reader task and the periodic dispatcher scan
    pub async fn start(&mut self) -> Result<()> {
        self.session.start_listening(self.buffer.clone()).await?;

        let dispatcher = ResponseDispatcher::new(self.buffer.clone(), self.registry.clone());
        let period = Duration::from_millis(self.config.polling.scan_interval_ms.max(1));
        self.scanner = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                dispatcher.scan();
            }
        }));
        info!(
            interval_ms = period.as_millis() as u64,
            "Dispatcher scan started"
        );
        Ok(())
    }

    /// Query backlight, LED state, and zone levels; `room` limits the keypads polled
    pub async fn poll(&self, room: Option<&str>) -> Result<usize> {
        let sender = CommandSender::new(&self.session);
        let families = &self.config.polling.keypad_models;
        let rooms = match room {
            Some(room) => vec![room.to_string()],
            None => self.registry.rooms(),
        };

        let mut sent = 0;
        for room in &rooms {
            sent += sender
                .query_backlights(&self.registry, room, families)
                .await?;
            for keypad in self.registry.keypads_in_room(room, families) {
                sent += sender.query_buttons(&keypad).await?;
            }
        }
        if let Some(zones) = self.registry.section(&self.config.export.section_anchor) {
            sent += sender.query_section_levels(&zones).await?;
        }

        info!(rooms = rooms.len(), commands = sent, "Poll sent");
        Ok(sent)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.registry.subscribe()
    }

    /// Stop scanning and close the session
    pub async fn shutdown(&mut self) {
        if let Some(scanner) = self.scanner.take() {
            scanner.abort();
        }
        self.session.close().await;
        debug!("State shut down");
    }
}

/// Render a notification as one console line
pub fn describe(notification: &Notification) -> String {
    match notification {
        Notification::ButtonChanged {
            device_id,
            ordinal,
            state,
        } => format!("button  {} #{} {}", device_id, ordinal, state),
        Notification::BrightnessChanged {
            id,
            percentage,
            section,
            key,
        } => format!("level   {} ({} / {}) {:.2}%", id, section, key, percentage),
        Notification::BacklightChanged {
            device_id,
            kind,
            level,
        } => format!("backlit {} {:?} {}", device_id, kind, level),
        Notification::Log { text } => format!("log     {}", text),
        Notification::Reloaded => "reload".to_string(),
    }
}

/// Print notifications until the channel closes
pub async fn print_notifications(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => println!("{}", describe(&notification)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Notification consumer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
