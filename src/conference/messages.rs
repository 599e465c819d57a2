use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Commands understood by the meeting client's local API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeetingAction {
    None,
    QueryState,
    Mute,
    Unmute,
    ToggleMute,
    HideVideo,
    ShowVideo,
    ToggleVideo,
    UnblurBackground,
    BlurBackground,
    ToggleBackgroundBlur,
    LowerHand,
    RaiseHand,
    ToggleHand,
    LeaveCall,
    SendReaction,
    ToggleUi,
    StopSharing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reaction {
    Applause,
    Laugh,
    Like,
    Love,
    Wow,
}

/// Panel targeted by `toggle-ui`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UiTarget {
    Chat,
    SharingTray,
}

/// The single `type` parameter some actions carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionParameter {
    Reaction(Reaction),
    Ui(UiTarget),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(rename = "type")]
    pub kind: ActionParameter,
}

/// Outbound request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub action: MeetingAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    pub request_id: u64,
}

/// Hands out strictly increasing request ids, starting at 1.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl ClientMessage {
    pub fn new(action: MeetingAction, parameter: Option<ActionParameter>, ids: &RequestIds) -> Self {
        Self {
            action,
            parameters: parameter.map(|kind| Parameters { kind }),
            request_id: ids.next(),
        }
    }
}

/// Inbound frame. Every field is optional; the client inspects whichever are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub request_id: Option<u64>,
    pub response: Option<String>,
    pub error_msg: Option<String>,
    pub token_refresh: Option<String>,
    pub meeting_update: Option<MeetingUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeetingUpdate {
    pub meeting_state: Option<MeetingState>,
    pub meeting_permissions: Option<MeetingPermissions>,
}

/// Partial meeting state; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeetingState {
    pub is_muted: Option<bool>,
    pub is_hand_raised: Option<bool>,
    pub is_in_meeting: Option<bool>,
    pub is_recording_on: Option<bool>,
    pub is_background_blurred: Option<bool>,
    pub is_sharing: Option<bool>,
    pub has_unread_messages: Option<bool>,
    pub is_video_on: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeetingPermissions {
    pub can_toggle_mute: bool,
    pub can_toggle_video: bool,
    pub can_toggle_hand: bool,
    pub can_toggle_blur: bool,
    pub can_leave: bool,
    pub can_react: bool,
    pub can_toggle_share_tray: bool,
    pub can_toggle_chat: bool,
    pub can_stop_sharing: bool,
    pub can_pair: bool,
}
