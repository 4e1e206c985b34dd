//! roomkey Telnet - Line-protocol session for keypad control networks
//!
//! This crate owns the live side of roomkey:
//! - a persistent line-oriented session with a two-mode login handshake
//! - fire-and-forget status queries for keypads, buttons and outputs
//! - a background reader feeding a shared line buffer
//! - a table-driven dispatcher reconciling status lines with the registry

pub mod buffer;
pub mod command;
pub mod dispatch;
pub mod session;

pub use buffer::LineBuffer;
pub use command::{Command, CommandSender};
pub use dispatch::{ResponseDispatcher, ScanReport, PROMPT_TOKEN};
pub use session::{LoginMode, ProtocolSession, SessionConfig, SessionError, DEFAULT_PORT};
