use crate::conference::facts::TeamsSnapshot;
use crate::conference::messages::{ActionParameter, MeetingAction};
use crate::config::schema::AppConfig;
use crate::state::{ConferenceConnectionState, DeviceInfo, DeviceSessionState, DeviceStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

/// Capacity of every broadcast topic on the hub.
const CHANNEL_CAPACITY: usize = 64;

/// Number of buttons on the largest keypad variant.
pub const BUTTON_COUNT: u8 = 10;

/// Last known color per button, indexed by `ButtonId::index`.
pub type LedSnapshot = [Option<LedColor>; BUTTON_COUNT as usize];

/// A keypad button, always in `1..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ButtonId(u8);

impl ButtonId {
    pub fn new(id: u8) -> Option<Self> {
        (1..=BUTTON_COUNT).contains(&id).then_some(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based position, for indexing per-button arrays.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    pub fn all() -> impl Iterator<Item = ButtonId> {
        (1..=BUTTON_COUNT).map(ButtonId)
    }
}

impl TryFrom<u8> for ButtonId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("button id {value} out of range (1-{BUTTON_COUNT})"))
    }
}

impl From<ButtonId> for u8 {
    fn from(id: ButtonId) -> Self {
        id.0
    }
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of colors a button LED can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedColor {
    Red,
    Green,
    Blue,
    White,
    Black,
    Yellow,
    Cyan,
    Magenta,
    Orange,
    Purple,
}

impl LedColor {
    pub const ALL: [LedColor; 10] = [
        LedColor::Red,
        LedColor::Green,
        LedColor::Blue,
        LedColor::White,
        LedColor::Black,
        LedColor::Yellow,
        LedColor::Cyan,
        LedColor::Magenta,
        LedColor::Orange,
        LedColor::Purple,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LedColor::Red => "red",
            LedColor::Green => "green",
            LedColor::Blue => "blue",
            LedColor::White => "white",
            LedColor::Black => "black",
            LedColor::Yellow => "yellow",
            LedColor::Cyan => "cyan",
            LedColor::Magenta => "magenta",
            LedColor::Orange => "orange",
            LedColor::Purple => "purple",
        }
    }
}

impl fmt::Display for LedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LedColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        LedColor::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown LED color: {wanted:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonPhase {
    Pressed,
    Released,
    /// Derived by the dispatcher once a press outlives the long-press threshold.
    LongPressed,
}

/// Where a button event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Hardware,
    Virtual,
}

#[derive(Debug, Clone, Copy)]
pub struct ButtonEvent {
    pub button: ButtonId,
    pub phase: ButtonPhase,
    pub source: EventSource,
    pub at: Instant,
}

impl ButtonEvent {
    pub fn now(button: ButtonId, phase: ButtonPhase, source: EventSource) -> Self {
        Self {
            button,
            phase,
            source,
            at: Instant::now(),
        }
    }
}

/// A resolved LED color for one button. Also used for webhook-set requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedColorChanged {
    pub button: ButtonId,
    pub color: LedColor,
}

/// A request for the meeting client, issued by a fired action chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingCommand {
    pub action: MeetingAction,
    pub parameter: Option<ActionParameter>,
}

/// Daemon-level control events.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Configuration was reloaded from disk.
    ConfigReloaded(Arc<AppConfig>),

    /// Shutdown the daemon.
    Shutdown,
}

/// The in-process publish/subscribe spine.
///
/// Ephemeral facts (button events, LED changes, meeting commands) travel on
/// broadcast topics. Long-lived state (device session, meeting connection,
/// meeting facts) lives in `watch` cells so late subscribers read the current
/// value. Each `watch` cell has exactly one writing component.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    buttons: broadcast::Sender<ButtonEvent>,
    leds: broadcast::Sender<LedColorChanged>,
    led_colors: watch::Sender<LedSnapshot>,
    webhook_leds: broadcast::Sender<LedColorChanged>,
    meeting: broadcast::Sender<MeetingCommand>,
    tokens: broadcast::Sender<String>,
    control: broadcast::Sender<ControlEvent>,
    teams: watch::Sender<TeamsSnapshot>,
    device: watch::Sender<DeviceStatus>,
    conference: watch::Sender<ConferenceConnectionState>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                buttons: broadcast::channel(CHANNEL_CAPACITY).0,
                leds: broadcast::channel(CHANNEL_CAPACITY).0,
                led_colors: watch::channel(LedSnapshot::default()).0,
                webhook_leds: broadcast::channel(CHANNEL_CAPACITY).0,
                meeting: broadcast::channel(CHANNEL_CAPACITY).0,
                tokens: broadcast::channel(CHANNEL_CAPACITY).0,
                control: broadcast::channel(CHANNEL_CAPACITY).0,
                teams: watch::channel(TeamsSnapshot::default()).0,
                device: watch::channel(DeviceStatus::default()).0,
                conference: watch::channel(ConferenceConnectionState::Disconnected).0,
            }),
        }
    }

    // --- Button events: device session / relay -> dispatcher ---

    pub fn publish_button(&self, event: ButtonEvent) {
        let _ = self.inner.buttons.send(event);
    }

    pub fn subscribe_buttons(&self) -> broadcast::Receiver<ButtonEvent> {
        self.inner.buttons.subscribe()
    }

    // --- LED changes: LED engine -> device session + relay ---

    /// Record `change` as the button's current color, then broadcast it.
    pub fn publish_led(&self, change: LedColorChanged) {
        self.inner.led_colors.send_if_modified(|colors| {
            let slot = &mut colors[change.button.index()];
            let changed = *slot != Some(change.color);
            *slot = Some(change.color);
            changed
        });
        let _ = self.inner.leds.send(change);
    }

    /// Current color of every button that has been set so far.
    pub fn led_snapshot(&self) -> LedSnapshot {
        *self.inner.led_colors.borrow()
    }

    pub fn subscribe_leds(&self) -> broadcast::Receiver<LedColorChanged> {
        self.inner.leds.subscribe()
    }

    // --- Webhook-set colors: relay HTTP surface -> LED engine ---

    pub fn publish_webhook_led(&self, request: LedColorChanged) {
        let _ = self.inner.webhook_leds.send(request);
    }

    pub fn subscribe_webhook_leds(&self) -> broadcast::Receiver<LedColorChanged> {
        self.inner.webhook_leds.subscribe()
    }

    // --- Meeting commands: dispatcher -> meeting client ---

    pub fn publish_meeting(&self, command: MeetingCommand) {
        let _ = self.inner.meeting.send(command);
    }

    pub fn subscribe_meeting(&self) -> broadcast::Receiver<MeetingCommand> {
        self.inner.meeting.subscribe()
    }

    // --- Fresh pairing tokens, for an external collaborator to persist ---

    pub fn publish_token(&self, token: String) {
        let _ = self.inner.tokens.send(token);
    }

    pub fn subscribe_tokens(&self) -> broadcast::Receiver<String> {
        self.inner.tokens.subscribe()
    }

    pub fn publish_control(&self, event: ControlEvent) {
        let _ = self.inner.control.send(event);
    }

    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlEvent> {
        self.inner.control.subscribe()
    }

    // --- Meeting facts, written only by the meeting client ---

    pub fn teams(&self) -> TeamsSnapshot {
        self.inner.teams.borrow().clone()
    }

    pub fn watch_teams(&self) -> watch::Receiver<TeamsSnapshot> {
        self.inner.teams.subscribe()
    }

    /// Mutate the meeting facts; subscribers are woken only when `modify`
    /// reports a change.
    pub fn update_teams(&self, modify: impl FnOnce(&mut TeamsSnapshot) -> bool) {
        self.inner.teams.send_if_modified(modify);
    }

    // --- Device session state, written only by the device session ---

    pub fn device_status(&self) -> DeviceStatus {
        self.inner.device.borrow().clone()
    }

    pub fn watch_device(&self) -> watch::Receiver<DeviceStatus> {
        self.inner.device.subscribe()
    }

    pub fn set_device_state(&self, state: DeviceSessionState) {
        self.inner.device.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            if state == DeviceSessionState::Disconnected {
                status.info = None;
            }
            true
        });
    }

    pub fn set_device_info(&self, info: DeviceInfo) {
        self.inner.device.send_modify(|status| status.info = Some(info));
    }

    // --- Meeting connection state, written only by the meeting client ---

    pub fn conference_state(&self) -> ConferenceConnectionState {
        self.inner.conference.borrow().clone()
    }

    pub fn watch_conference(&self) -> watch::Receiver<ConferenceConnectionState> {
        self.inner.conference.subscribe()
    }

    pub fn set_conference_state(&self, state: ConferenceConnectionState) {
        self.inner.conference.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
