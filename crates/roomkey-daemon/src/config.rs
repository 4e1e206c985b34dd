//! Configuration loading and validation

use anyhow::{Context, Result};
use roomkey_core::{ExportFormat, DEFAULT_KEYPAD_MODELS};
use roomkey_telnet::{LoginMode, SessionConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Processor host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Control port
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Time allowed for each login prompt
    #[serde(default = "default_timeout_ms")]
    pub prompt_timeout_ms: u64,
    #[serde(default)]
    pub login: LoginConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_timeout_ms(),
            prompt_timeout_ms: default_timeout_ms(),
            login: LoginConfig::default(),
        }
    }
}

fn default_host() -> String {
    "192.168.1.50".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Login handshake variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoginConfig {
    Credentials { username: String, password: String },
    Token { token: String },
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self::Credentials {
            username: "lutron".to_string(),
            password: "integration".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Installation export to load for `monitor`
    #[serde(default = "default_export_path")]
    pub path: String,
    #[serde(default = "default_preamble_lines")]
    pub preamble_lines: usize,
    #[serde(default = "default_section_anchor")]
    pub section_anchor: String,
    #[serde(default = "default_section_terminator")]
    pub section_terminator: String,
    /// Trailing path tokens stripped before the room/name split
    #[serde(default)]
    pub path_suffixes: Vec<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            path: default_export_path(),
            preamble_lines: default_preamble_lines(),
            section_anchor: default_section_anchor(),
            section_terminator: default_section_terminator(),
            path_suffixes: Vec::new(),
        }
    }
}

fn default_export_path() -> String {
    "./export.csv".to_string()
}

fn default_preamble_lines() -> usize {
    ExportFormat::default().preamble_lines
}

fn default_section_anchor() -> String {
    ExportFormat::default().section_anchor
}

fn default_section_terminator() -> String {
    ExportFormat::default().section_terminator
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Dispatcher scan tick
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    /// Model prefixes of the keypads polled for backlight and LED state
    #[serde(default = "default_keypad_models")]
    pub keypad_models: Vec<String>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval(),
            keypad_models: default_keypad_models(),
        }
    }
}

fn default_scan_interval() -> u64 {
    100
}

fn default_keypad_models() -> Vec<String> {
    DEFAULT_KEYPAD_MODELS.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Convert to SessionConfig
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout_ms: self.connection.connect_timeout_ms,
            prompt_timeout_ms: self.connection.prompt_timeout_ms,
            ..SessionConfig::default()
        }
    }

    pub fn to_login_mode(&self) -> LoginMode {
        match &self.connection.login {
            LoginConfig::Credentials { username, password } => LoginMode::Credentials {
                username: username.clone(),
                password: password.clone(),
            },
            LoginConfig::Token { token } => LoginMode::Token {
                token: token.clone(),
            },
        }
    }

    /// Convert to ExportFormat
    pub fn to_export_format(&self) -> ExportFormat {
        ExportFormat {
            preamble_lines: self.export.preamble_lines,
            section_anchor: self.export.section_anchor.clone(),
            section_terminator: self.export.section_terminator.clone(),
            path_suffixes: self.export.path_suffixes.clone(),
            ..ExportFormat::default()
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.connection.port, 23);
        assert_eq!(config.polling.scan_interval_ms, 100);
        assert_eq!(config.polling.keypad_models, vec!["MWP-U", "MWP-B"]);
        assert_eq!(config.to_export_format(), ExportFormat::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomkey.toml");
        std::fs::write(
            &path,
            r#"
[connection]
host = "10.0.0.8"

[connection.login]
mode = "token"
token = "2"

[export]
path_suffixes = ["(Main)"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.connection.host, "10.0.0.8");
        assert_eq!(config.connection.prompt_timeout_ms, 5000);
        assert_eq!(config.to_login_mode(), LoginMode::Token { token: "2".into() });
        assert_eq!(config.export.preamble_lines, 6);
        assert_eq!(config.to_export_format().path_suffixes, vec!["(Main)"]);
    }

    #[test]
    fn test_saved_default_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomkey.toml");
        save_default_config(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("mode = \"credentials\""));

        let config = load_config(&path).unwrap();
        assert_eq!(config.connection.login, LoginConfig::default());
        assert_eq!(config.export.path, "./export.csv");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomkey.toml");
        std::fs::write(&path, "[connection]\nport = \"twenty-three\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("parsing"));
    }
}
