use crate::conference::facts::TeamsPredicate;
use crate::conference::messages::{ActionParameter, MeetingAction, Reaction};
use crate::event::{ButtonId, LedColor};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub teams: TeamsConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Action chains per button.
    #[serde(default)]
    pub buttons: Vec<ButtonConfig>,
    /// LED slot definitions.
    #[serde(default)]
    pub leds: Vec<LedSlot>,
}

impl AppConfig {
    pub fn button(&self, id: ButtonId) -> Option<&ButtonConfig> {
        self.buttons.iter().find(|b| b.id == id)
    }
}

/// Keypad discovery and link settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Tried in order, first match wins.
    #[serde(default = "default_identifications")]
    pub identifications: Vec<DeviceIdentification>,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive unanswered heartbeats before the link is declared lost.
    #[serde(default = "default_heartbeat_misses")]
    pub heartbeat_misses: u32,

    /// How long to wait for the version reply when opening.
    #[serde(default = "default_version_timeout")]
    pub version_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Check the release feed and update firmware after connecting.
    #[serde(default)]
    pub auto_update: bool,

    #[serde(default = "default_release_url")]
    pub release_url: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            identifications: default_identifications(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_misses: default_heartbeat_misses(),
            version_timeout_ms: default_version_timeout(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            auto_update: false,
            release_url: default_release_url(),
        }
    }
}

/// Matches one physical keypad among enumerated HID devices.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceIdentification {
    #[serde(default)]
    pub vendor_id: u16,
    #[serde(default)]
    pub product_id: u16,
    #[serde(default)]
    pub serial_number: Option<String>,
}

impl DeviceIdentification {
    /// A zero vendor and product id matches any device with the given serial.
    pub fn matches(&self, vendor_id: u16, product_id: u16, serial: Option<&str>) -> bool {
        let ids_match = (self.vendor_id == 0 && self.product_id == 0)
            || (self.vendor_id == vendor_id && self.product_id == product_id);
        let serial_match = match self.serial_number.as_deref() {
            Some(wanted) => serial == Some(wanted),
            None => true,
        };
        ids_match && serial_match
    }
}

/// Firmware transfer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Same-chunk retries before the whole update is aborted.
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            chunk_retries: default_chunk_retries(),
        }
    }
}

/// Meeting client local API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TeamsConfig {
    #[serde(default = "default_teams_url")]
    pub url: String,

    /// Pairing token from a previous approval.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    #[serde(default = "default_device_name")]
    pub device: String,

    #[serde(default = "default_app_name")]
    pub app: String,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default = "default_teams_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Time allowed for the first answer after connecting.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

impl Default for TeamsConfig {
    fn default() -> Self {
        Self {
            url: default_teams_url(),
            token: None,
            manufacturer: default_manufacturer(),
            device: default_device_name(),
            app: default_app_name(),
            app_version: default_app_version(),
            reconnect_initial_ms: default_teams_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

/// Virtual keypad relay bind address.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Hold time that turns a press into a long press.
    #[serde(default = "default_long_press")]
    pub long_press_ms: u64,

    /// Timeout for `command` actions without their own timeout.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            long_press_ms: default_long_press(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

/// Action chains bound to one button.
#[derive(Debug, Clone, Deserialize)]
pub struct ButtonConfig {
    pub id: ButtonId,

    /// Fired on a short press.
    #[serde(default)]
    pub short: Vec<ActionDetail>,

    /// Fired once the button is held past the long-press threshold.
    #[serde(default)]
    pub long: Vec<ActionDetail>,
}

/// One entry of an action chain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionDetail {
    Webhook {
        #[serde(default = "default_http_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        params: HashMap<String, String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
        /// Falls back to the dispatcher's `command_timeout_ms`.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Keyboard {
        keyboard: KeyboardAction,
    },
    Mouse {
        mouse: MouseAction,
    },
    TeamsReaction {
        reaction: Reaction,
    },
    MeetingAction {
        meeting_action: MeetingAction,
        /// `type` of actions that take one, e.g. `chat` for `toggle-ui`.
        #[serde(default, rename = "type")]
        parameter: Option<ActionParameter>,
    },
    ActivateTeams,
    Command {
        command: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Delay {
        seconds: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyboardAction {
    Press {
        key: String,
    },
    Release {
        key: String,
    },
    Tap {
        key: String,
        #[serde(default)]
        modifiers: Vec<String>,
    },
    Type {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseAction {
    Move {
        x: i32,
        y: i32,
    },
    Set {
        x: i32,
        y: i32,
    },
    Click {
        button: String,
        #[serde(default = "default_click_count")]
        count: u32,
    },
    Press {
        button: String,
    },
    Release {
        button: String,
    },
}

/// One button's LED and the source its color is resolved from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LedSlot {
    pub button: ButtonId,
    #[serde(flatten)]
    pub source: LedSource,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum LedSource {
    /// Follows one meeting predicate.
    TeamsState {
        state: TeamsPredicate,
        #[serde(default = "default_color_on")]
        color_on: LedColor,
        #[serde(default = "default_color_off")]
        color_off: LedColor,
    },
    /// Exit status of a command selects between two colors.
    ResultCommand {
        command: String,
        /// Seconds between runs.
        #[serde(default = "default_poll_interval")]
        interval: f64,
        /// Seconds before the command is killed.
        #[serde(default = "default_poll_timeout")]
        timeout: f64,
        #[serde(default = "default_color_on")]
        color_on: LedColor,
        #[serde(default = "default_color_off")]
        color_off: LedColor,
    },
    /// The command prints a color name.
    ColorCommand {
        command: String,
        #[serde(default = "default_poll_interval")]
        interval: f64,
        #[serde(default = "default_poll_timeout")]
        timeout: f64,
    },
    /// Set from the relay's HTTP surface.
    Webhook,
    Off,
}

impl LedSource {
    /// Command, interval and timeout of a polled source.
    pub fn poll(&self) -> Option<CommandPoll<'_>> {
        match self {
            LedSource::ResultCommand {
                command,
                interval,
                timeout,
                ..
            }
            | LedSource::ColorCommand {
                command,
                interval,
                timeout,
            } => Some(CommandPoll {
                command,
                interval: secs_or(*interval, Duration::from_secs(5)),
                timeout: secs_or(*timeout, Duration::from_millis(500)),
            }),
            _ => None,
        }
    }
}

/// A periodically polled external command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPoll<'a> {
    pub command: &'a str,
    pub interval: Duration,
    pub timeout: Duration,
}

fn secs_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or(fallback)
}

// --- Defaults ---

fn default_identifications() -> Vec<DeviceIdentification> {
    [(0x1D50, 0x6189), (0x1D50, 0x60C6), (0x1209, 0x0001)]
        .into_iter()
        .map(|(vendor_id, product_id)| DeviceIdentification {
            vendor_id,
            product_id,
            serial_number: None,
        })
        .collect()
}

fn default_heartbeat_interval() -> u64 {
    2000
}

fn default_heartbeat_misses() -> u32 {
    3
}

fn default_version_timeout() -> u64 {
    1000
}

fn default_reconnect_initial() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    10_000
}

fn default_release_url() -> String {
    "https://api.github.com/repos/mutenix-org/firmware-macroboard/releases/latest".to_string()
}

fn default_ack_timeout() -> u64 {
    1000
}

fn default_chunk_retries() -> u32 {
    3
}

fn default_teams_url() -> String {
    "ws://127.0.0.1:8124".to_string()
}

fn default_manufacturer() -> String {
    "macropadd".to_string()
}

fn default_device_name() -> String {
    "macropad".to_string()
}

fn default_app_name() -> String {
    "macropadd".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_teams_reconnect_initial() -> u64 {
    250
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    12909
}

fn default_long_press() -> u64 {
    400
}

fn default_command_timeout() -> u64 {
    10_000
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_click_count() -> u32 {
    1
}

fn default_color_on() -> LedColor {
    LedColor::Green
}

fn default_color_off() -> LedColor {
    LedColor::Red
}

fn default_poll_interval() -> f64 {
    5.0
}

fn default_poll_timeout() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conference::messages::UiTarget;

    #[test]
    fn parse_minimal_config() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.relay.bind_port, 12909);
        assert_eq!(config.dispatch.long_press_ms, 400);
        assert_eq!(config.device.identifications.len(), 3);
        assert!(config.buttons.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[device]
identifications = [{ vendor_id = 0x1d50, product_id = 0x6189, serial_number = "A1" }]
heartbeat_interval_ms = 1500

[teams]
token = "abc"

[relay]
bind_address = "0.0.0.0"
bind_port = 8080

[[buttons]]
id = 1
short = [
    { action = "meeting_action", meeting_action = "toggle-mute" },
    { action = "meeting_action", meeting_action = "toggle-ui", type = "sharing-tray" },
]
long = [
    { action = "webhook", method = "POST", url = "https://n8n.local/hook", data = { on = true } },
    { action = "command", command = "notify-send hi", timeout_ms = 2000 },
]

[[buttons]]
id = 2
short = [
    { action = "teams_reaction", reaction = "like" },
    { action = "keyboard", keyboard = { tap = { key = "a", modifiers = ["ctrl"] } } },
    { action = "mouse", mouse = { click = { button = "left" } } },
    { action = "activate_teams" },
    { action = "delay", seconds = 0.5 },
]

[[leds]]
button = 1
source = "teams_state"
state = "is-muted"
color_on = "red"

[[leds]]
button = 2
source = "result_command"
command = "true"
interval = 2

[[leds]]
button = 3
source = "color_command"
command = "echo blue"
timeout = 1.5

[[leds]]
button = 4
source = "webhook"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.identifications[0].vendor_id, 0x1d50);
        assert_eq!(config.teams.token.as_deref(), Some("abc"));
        assert_eq!(config.relay.bind_port, 8080);

        let b1 = config.button(ButtonId::new(1).unwrap()).unwrap();
        assert_eq!(
            b1.short[0],
            ActionDetail::MeetingAction {
                meeting_action: MeetingAction::ToggleMute,
                parameter: None,
            }
        );
        assert_eq!(
            b1.short[1],
            ActionDetail::MeetingAction {
                meeting_action: MeetingAction::ToggleUi,
                parameter: Some(ActionParameter::Ui(UiTarget::SharingTray)),
            }
        );
        assert!(matches!(b1.long[0], ActionDetail::Webhook { ref method, .. } if method == "POST"));
        assert!(matches!(
            b1.long[1],
            ActionDetail::Command {
                timeout_ms: Some(2000),
                ..
            }
        ));

        let b2 = config.button(ButtonId::new(2).unwrap()).unwrap();
        assert_eq!(b2.short.len(), 5);
        assert_eq!(b2.short[3], ActionDetail::ActivateTeams);
        assert!(matches!(
            b2.short[1],
            ActionDetail::Keyboard {
                keyboard: KeyboardAction::Tap { .. }
            }
        ));
        assert!(matches!(
            b2.short[2],
            ActionDetail::Mouse {
                mouse: MouseAction::Click { count: 1, .. }
            }
        ));

        assert_eq!(
            config.leds[0].source,
            LedSource::TeamsState {
                state: TeamsPredicate::Muted,
                color_on: LedColor::Red,
                color_off: LedColor::Red,
            }
        );
        assert!(matches!(config.leds[1].source, LedSource::ResultCommand { .. }));
        let poll = config.leds[1].source.poll().unwrap();
        assert_eq!(poll.command, "true");
        assert_eq!(poll.interval, Duration::from_secs(2));
        assert_eq!(poll.timeout, Duration::from_millis(500));

        assert!(matches!(config.leds[2].source, LedSource::ColorCommand { .. }));
        assert_eq!(config.leds[2].source.poll().unwrap().timeout, Duration::from_millis(1500));
        assert_eq!(config.leds[3].source, LedSource::Webhook);
    }

    #[test]
    fn rejects_out_of_range_button() {
        let toml_str = r#"
[[buttons]]
id = 11
"#;
        assert!(toml::from_str::<AppConfig>(toml_str).is_err());
    }

    #[test]
    fn identification_matching() {
        let by_ids = DeviceIdentification {
            vendor_id: 1,
            product_id: 2,
            serial_number: None,
        };
        assert!(by_ids.matches(1, 2, Some("x")));
        assert!(!by_ids.matches(1, 3, None));

        let by_serial = DeviceIdentification {
            vendor_id: 0,
            product_id: 0,
            serial_number: Some("S".into()),
        };
        assert!(by_serial.matches(9, 9, Some("S")));
        assert!(!by_serial.matches(9, 9, Some("T")));
        assert!(!by_serial.matches(9, 9, None));
    }
}
