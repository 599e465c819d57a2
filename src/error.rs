use std::path::PathBuf;

use crate::update::FirmwareVersion;

/// Central error type for macropadd.
#[derive(Debug, thiserror::Error)]
pub enum PadError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("no matching keypad found")]
    DeviceNotFound,

    #[error("device link error: {0}")]
    DeviceLink(String),

    #[error("HID error: {0}")]
    Hid(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("firmware update failed: {0}")]
    Update(#[from] UpdateError),

    #[error("action error: {0}")]
    Action(String),

    #[error("HTTP action failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("shell command failed: {command}: {message}")]
    Shell { command: String, message: String },

    #[error("LED source error: {0}")]
    SourceResolution(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watcher error: {0}")]
    Watcher(String),
}

/// Failure of one firmware update attempt. The device is left in its
/// last-acknowledged state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("device session closed during update")]
    SessionClosed,

    #[error("device is not connected")]
    NotConnected,

    #[error("an update is already running")]
    Busy,

    #[error("device did not acknowledge update start")]
    BeginRejected,

    #[error("chunk {seq} rejected after {attempts} attempts")]
    ChunkRejected { seq: u16, attempts: u32 },

    #[error("device did not acknowledge update end")]
    EndRejected,

    #[error("checksum mismatch: image {expected:08x}, device {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("device reports version {actual} after update, expected {expected}")]
    VersionMismatch {
        expected: FirmwareVersion,
        actual: FirmwareVersion,
    },

    #[error("device did not report its version after update")]
    VersionUnconfirmed,

    #[error("image too large: {0} bytes")]
    ImageTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, PadError>;
