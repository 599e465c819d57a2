use crate::update::FirmwareVersion;
use serde::Serialize;
use std::fmt;

/// Lifecycle of the link to the physical keypad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSessionState {
    #[default]
    Disconnected,
    Connecting,
    /// Handshake (version exchange) completed.
    Connected,
    /// Exclusive firmware transfer; only entered from `Connected`.
    Updating,
}

/// Lifecycle of the meeting client connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConferenceConnectionState {
    #[default]
    Disconnected,
    Handshaking,
    Authenticated,
    /// Soft failure retried with backoff; known facts are kept, marked stale.
    Degraded(String),
}

impl ConferenceConnectionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

/// Keypad model reported in the version reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HardwareVariant {
    #[default]
    Unknown,
    SingleButton,
    FiveButtonUsb,
    FiveButtonBt,
    TenButtonUsb,
    TenButtonBt,
}

impl HardwareVariant {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::SingleButton,
            0x02 => Self::FiveButtonUsb,
            0x03 => Self::FiveButtonBt,
            0x04 => Self::TenButtonUsb,
            0x05 => Self::TenButtonBt,
            _ => Self::Unknown,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Unknown => 0x00,
            Self::SingleButton => 0x01,
            Self::FiveButtonUsb => 0x02,
            Self::FiveButtonBt => 0x03,
            Self::TenButtonUsb => 0x04,
            Self::TenButtonBt => 0x05,
        }
    }
}

impl fmt::Display for HardwareVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::SingleButton => "SINGLE_BUTTON",
            Self::FiveButtonUsb => "FIVE_BUTTON_USB",
            Self::FiveButtonBt => "FIVE_BUTTON_BT",
            Self::TenButtonUsb => "TEN_BUTTON_USB",
            Self::TenButtonBt => "TEN_BUTTON_BT",
        };
        f.write_str(name)
    }
}

/// What we know about the connected keypad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub variant: HardwareVariant,
    pub version: FirmwareVersion,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub state: DeviceSessionState,
    pub info: Option<DeviceInfo>,
}

impl DeviceStatus {
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            DeviceSessionState::Connected | DeviceSessionState::Updating
        )
    }
}
