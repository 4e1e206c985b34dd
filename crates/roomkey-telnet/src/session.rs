//! Persistent line-oriented session with the control processor
//!
//! The session owns one bidirectional byte stream. Outbound commands are
//! single lines written without waiting for a reply; inbound traffic after
//! login is consumed by a background reader task that appends it to a
//! [`LineBuffer`] for the dispatcher to scan.

use roomkey_core::ChangeNotifier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::buffer::LineBuffer;

/// Default control port
pub const DEFAULT_PORT: u16 = 23;

/// Line terminator for outbound commands
const LINE_END: &[u8] = b"\r\n";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out while {0}")]
    Timeout(&'static str),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Session reader is owned by the listener")]
    ReaderDetached,
    #[error("Login failed: {0}")]
    LoginFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Login handshake selected by configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMode {
    /// Prompt, username, prompt, password, prompt
    Credentials { username: String, password: String },
    /// Prompt, single selector token, prompt
    Token { token: String },
}

/// Session timing and sizing
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed for the TCP connect
    pub connect_timeout_ms: u64,
    /// Time allowed for each login prompt to arrive
    pub prompt_timeout_ms: u64,
    /// Read size of the background reader
    pub read_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            prompt_timeout_ms: 5000,
            read_chunk: 1024,
        }
    }
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// A session over one transport
pub struct ProtocolSession {
    config: SessionConfig,
    reader: Mutex<Option<ReadHalf<BoxedTransport>>>,
    writer: Mutex<Option<WriteHalf<BoxedTransport>>>,
    connected: AtomicBool,
    listening: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    notifier: Option<ChangeNotifier>,
}

impl ProtocolSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            listening: Arc::new(AtomicBool::new(false)),
            reader_task: std::sync::Mutex::new(None),
            notifier: None,
        }
    }

    /// Mirror every sent line to a notifier as a log line
    pub fn with_notifier(mut self, notifier: ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Open a TCP connection to the processor
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), SessionError> {
        let addr = format!("{}:{}", host, port);
        info!(addr = %addr, "Connecting");

        let duration = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = timeout(duration, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| SessionError::Timeout("connecting"))?
            .map_err(|source| SessionError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        self.attach(stream).await;
        info!(addr = %addr, "Connected");
        Ok(())
    }

    /// Use an already established stream as the transport
    pub async fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_connected() {
            self.close().await;
        }
        let boxed: BoxedTransport = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Run the login handshake; on failure the session is closed
    pub async fn login(&self, mode: &LoginMode) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }

        match self.handshake(mode).await {
            Ok(()) => {
                info!("Logged in");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.close().await;
                Err(SessionError::LoginFailed(e.to_string()))
            }
        }
    }

    async fn handshake(&self, mode: &LoginMode) -> Result<(), SessionError> {
        match mode {
            LoginMode::Credentials { username, password } => {
                self.read_prompt("waiting for login prompt").await?;
                self.write_line(username, true).await?;
                self.read_prompt("waiting for password prompt").await?;
                self.write_line(password, false).await?;
                self.read_prompt("waiting for command prompt").await?;
            }
            LoginMode::Token { token } => {
                self.read_prompt("waiting for login prompt").await?;
                self.write_line(token, false).await?;
                self.read_prompt("waiting for command prompt").await?;
            }
        }
        Ok(())
    }

    /// Wait for any bytes; their content is logged, not checked
    async fn read_prompt(&self, stage: &'static str) -> Result<(), SessionError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(SessionError::ReaderDetached)?;

        let mut buf = vec![0u8; self.config.read_chunk];
        let duration = Duration::from_millis(self.config.prompt_timeout_ms);
        let n = timeout(duration, reader.read(&mut buf))
            .await
            .map_err(|_| SessionError::Timeout(stage))??;
        if n == 0 {
            return Err(SessionError::ConnectionClosed);
        }

        debug!(
            stage = stage,
            prompt = %String::from_utf8_lossy(&buf[..n]).trim(),
            "Received prompt"
        );
        Ok(())
    }

    /// Write one command line; never waits for a reply
    pub async fn send(&self, line: &str) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.write_line(line, true).await
    }

    async fn write_line(&self, line: &str, loggable: bool) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;

        writer.write_all(line.as_bytes()).await?;
        writer.write_all(LINE_END).await?;
        writer.flush().await?;

        if loggable {
            trace!(line = %line, "Sent line");
            if let Some(notifier) = &self.notifier {
                notifier.log_line(format!("> {}", line));
            }
        } else {
            trace!("Sent redacted line");
        }
        Ok(())
    }

    /// Hand the read half to a background task feeding `buffer`
    pub async fn start_listening(&self, buffer: LineBuffer) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(SessionError::ReaderDetached)?;

        self.listening.store(true, Ordering::SeqCst);
        let listening = self.listening.clone();
        let chunk = self.config.read_chunk;
        let handle = tokio::spawn(read_loop(reader, buffer, listening, chunk));

        if let Some(old) = self.task_slot().replace(handle) {
            old.abort();
        }
        debug!("Listener started");
        Ok(())
    }

    /// Ask the listener to stop after its current read completes
    pub fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    /// Whether the background reader task is still running
    pub fn reader_active(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader_task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dispose of the transport and the listener
    pub async fn close(&self) {
        self.listening.store(false, Ordering::SeqCst);

        let task = self.task_slot().take();
        if let Some(task) = task {
            task.abort();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Shutdown failed");
            }
        }
        self.reader.lock().await.take();

        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Session closed");
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        if let Some(task) = self.task_slot().take() {
            task.abort();
        }
    }
}

/// Background reader: runs while the flag is set, exits on EOF or error
async fn read_loop(
    mut reader: ReadHalf<BoxedTransport>,
    buffer: LineBuffer,
    listening: Arc<AtomicBool>,
    chunk: usize,
) {
    let mut buf = vec![0u8; chunk];
    while listening.load(Ordering::SeqCst) {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Connection closed by peer");
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "Received data");
                buffer.append(&buf[..n]);
            }
            Err(e) => {
                warn!(error = %e, "Read failed, listener stopping");
                break;
            }
        }
    }
    listening.store(false, Ordering::SeqCst);
    debug!("Listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    fn quick_config() -> SessionConfig {
        SessionConfig {
            prompt_timeout_ms: 200,
            ..SessionConfig::default()
        }
    }

    async fn read_line(server: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let session = ProtocolSession::new(SessionConfig::default());
        assert!(matches!(
            session.send("?DEVICE,55,89,36").await,
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            session.login(&LoginMode::Token { token: "1".into() }).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_credentials_login_sequence() {
        let (client, server) = tokio::io::duplex(1024);
        let session = ProtocolSession::new(quick_config());
        session.attach(client).await;

        let server_task = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            server.get_mut().write_all(b"login: ").await.unwrap();
            let user = read_line(&mut server).await;
            server.get_mut().write_all(b"password: ").await.unwrap();
            let pass = read_line(&mut server).await;
            server.get_mut().write_all(b"QNET> ").await.unwrap();
            let command = read_line(&mut server).await;
            (user, pass, command)
        });

        session
            .login(&LoginMode::Credentials {
                username: "admin".into(),
                password: "secret".into(),
            })
            .await
            .unwrap();
        session.send("?DEVICE,55,89,36").await.unwrap();

        let (user, pass, command) = server_task.await.unwrap();
        assert_eq!(user, "admin\r\n");
        assert_eq!(pass, "secret\r\n");
        assert_eq!(command, "?DEVICE,55,89,36\r\n");
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_token_login_sequence() {
        let (client, server) = tokio::io::duplex(1024);
        let session = ProtocolSession::new(quick_config());
        session.attach(client).await;

        let server_task = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            server.get_mut().write_all(b"Select: ").await.unwrap();
            let token = read_line(&mut server).await;
            server.get_mut().write_all(b"QNET> ").await.unwrap();
            token
        });

        session
            .login(&LoginMode::Token { token: "2".into() })
            .await
            .unwrap();
        assert_eq!(server_task.await.unwrap(), "2\r\n");
    }

    #[tokio::test]
    async fn test_login_fails_when_peer_closes() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let session = ProtocolSession::new(quick_config());
        session.attach(client).await;

        let err = session
            .login(&LoginMode::Token { token: "1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LoginFailed(_)));
        assert!(!session.is_connected());
        assert!(matches!(
            session.send("GETTIME").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_login_times_out_on_silence() {
        let (client, _server) = tokio::io::duplex(1024);
        let session = ProtocolSession::new(SessionConfig {
            prompt_timeout_ms: 20,
            ..SessionConfig::default()
        });
        session.attach(client).await;

        let err = session
            .login(&LoginMode::Token { token: "1".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Timed out"));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_listener_feeds_buffer_until_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        let session = ProtocolSession::new(quick_config());
        session.attach(client).await;

        let buffer = LineBuffer::new();
        session.start_listening(buffer.clone()).await.unwrap();
        assert!(session.is_listening());

        server.write_all(b"~DEVICE,55,82,9,1\r\n").await.unwrap();
        let mut line = None;
        for _ in 0..100 {
            line = buffer.next_line();
            if line.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(line.as_deref(), Some("~DEVICE,55,82,9,1"));

        drop(server);
        for _ in 0..100 {
            if !session.is_listening() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!session.is_listening());
    }

    async fn wait_for_reader_exit(session: &ProtocolSession) {
        for _ in 0..100 {
            if !session.reader_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_stop_listening_is_observed_after_pending_read() {
        let (client, mut server) = tokio::io::duplex(1024);
        let session = ProtocolSession::new(quick_config());
        session.attach(client).await;

        let buffer = LineBuffer::new();
        session.start_listening(buffer.clone()).await.unwrap();

        server.write_all(b"~DEVICE,55,81,9,1\r\n").await.unwrap();
        let mut first = None;
        for _ in 0..100 {
            first = buffer.next_line();
            if first.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(first.as_deref(), Some("~DEVICE,55,81,9,1"));

        // The reader is parked in a read; clearing the flag cannot interrupt it.
        session.stop_listening();
        assert!(!session.is_listening());
        assert!(session.reader_active());

        server.write_all(b"~DEVICE,55,82,9,0\r\n").await.unwrap();
        wait_for_reader_exit(&session).await;
        assert!(!session.reader_active());
        assert_eq!(buffer.next_line().as_deref(), Some("~DEVICE,55,82,9,0"));

        server.write_all(b"~DEVICE,55,83,9,1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(buffer.next_line().is_none());
        assert!(!session.is_listening());
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_stop_listening_before_first_read() {
        let (client, mut server) = tokio::io::duplex(1024);
        let session = ProtocolSession::new(quick_config());
        session.attach(client).await;

        let buffer = LineBuffer::new();
        session.start_listening(buffer.clone()).await.unwrap();
        session.stop_listening();
        wait_for_reader_exit(&session).await;
        assert!(!session.reader_active());

        server.write_all(b"~DEVICE,55,81,9,1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(buffer.drain_lines().is_empty());
        assert_eq!(buffer.pending(), 0);
        assert!(!session.is_listening());
    }

    #[tokio::test]
    async fn test_close_disposes_everything() {
        let (client, _server) = tokio::io::duplex(1024);
        let session = ProtocolSession::new(quick_config());
        session.attach(client).await;
        session.start_listening(LineBuffer::new()).await.unwrap();

        session.close().await;
        assert!(!session.is_connected());
        assert!(!session.is_listening());
        assert!(matches!(
            session.start_listening(LineBuffer::new()).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_sent_lines_are_logged_to_notifier() {
        let (client, _server) = tokio::io::duplex(1024);
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();
        let session = ProtocolSession::new(quick_config()).with_notifier(notifier);
        session.attach(client).await;

        session.send("GETTIME").await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            roomkey_core::Notification::Log {
                text: "> GETTIME".to_string()
            }
        );
    }
}
