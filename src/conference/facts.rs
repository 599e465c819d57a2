use super::messages::MeetingState;
use serde::{Deserialize, Serialize};

/// A boolean meeting fact an LED can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeamsPredicate {
    #[serde(rename = "is-muted")]
    Muted,
    #[serde(rename = "is-hand-raised")]
    HandRaised,
    #[serde(rename = "is-in-meeting")]
    InMeeting,
    #[serde(rename = "is-recording-on")]
    Recording,
    #[serde(rename = "is-background-blurred")]
    BackgroundBlurred,
    #[serde(rename = "is-sharing")]
    Sharing,
    #[serde(rename = "has-unread-messages")]
    UnreadMessages,
    #[serde(rename = "is-video-on")]
    VideoOn,
}

/// Current value of every meeting predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeamsStateFact {
    pub muted: bool,
    pub hand_raised: bool,
    pub in_meeting: bool,
    pub recording: bool,
    pub background_blurred: bool,
    pub sharing: bool,
    pub unread_messages: bool,
    pub video_on: bool,
}

impl TeamsStateFact {
    pub fn get(&self, predicate: TeamsPredicate) -> bool {
        match predicate {
            TeamsPredicate::Muted => self.muted,
            TeamsPredicate::HandRaised => self.hand_raised,
            TeamsPredicate::InMeeting => self.in_meeting,
            TeamsPredicate::Recording => self.recording,
            TeamsPredicate::BackgroundBlurred => self.background_blurred,
            TeamsPredicate::Sharing => self.sharing,
            TeamsPredicate::UnreadMessages => self.unread_messages,
            TeamsPredicate::VideoOn => self.video_on,
        }
    }

    /// Merge a partial update. Returns whether any value changed.
    pub fn apply(&mut self, update: &MeetingState) -> bool {
        let before = *self;
        let pairs = [
            (&mut self.muted, update.is_muted),
            (&mut self.hand_raised, update.is_hand_raised),
            (&mut self.in_meeting, update.is_in_meeting),
            (&mut self.recording, update.is_recording_on),
            (&mut self.background_blurred, update.is_background_blurred),
            (&mut self.sharing, update.is_sharing),
            (&mut self.unread_messages, update.has_unread_messages),
            (&mut self.video_on, update.is_video_on),
        ];
        for (slot, value) in pairs {
            if let Some(value) = value {
                *slot = value;
            }
        }
        *self != before
    }
}

/// Meeting facts as published on the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeamsSnapshot {
    pub facts: TeamsStateFact,
    /// Set while the connection is down; values are last-known-good.
    pub stale: bool,
    /// False until the first state frame has been received.
    pub known: bool,
}
