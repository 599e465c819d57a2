pub mod command;

use crate::conference::facts::{TeamsPredicate, TeamsStateFact};
use crate::config::schema::{LedSlot, LedSource};
use crate::event::{ButtonId, Hub, LedColor, LedColorChanged};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolves every configured LED slot independently and publishes colors
/// on the hub.
pub struct LedEngine {
    hub: Hub,
    cancel: CancellationToken,
    slots: HashMap<ButtonId, Registered>,
}

struct Registered {
    slot: LedSlot,
    cancel: CancellationToken,
}

impl LedEngine {
    pub fn new(hub: Hub, cancel: CancellationToken) -> Self {
        Self {
            hub,
            cancel,
            slots: HashMap::new(),
        }
    }

    /// Start resolving `slot`, replacing any slot already on that button.
    pub fn register(&mut self, slot: LedSlot) {
        self.unregister(slot.button);
        let cancel = self.cancel.child_token();
        debug!("LED slot {} registered: {:?}", slot.button, slot.source);
        tokio::spawn(run_slot(self.hub.clone(), slot.clone(), cancel.clone()));
        self.slots.insert(slot.button, Registered { slot, cancel });
    }

    /// Stop resolving the slot on `button`. Returns whether one existed.
    pub fn unregister(&mut self, button: ButtonId) -> bool {
        match self.slots.remove(&button) {
            Some(registered) => {
                registered.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Bring the running slots in line with `slots`; unchanged ones keep running.
    pub fn reconcile(&mut self, slots: &[LedSlot]) {
        let stale: Vec<ButtonId> = self
            .slots
            .keys()
            .filter(|b| !slots.iter().any(|s| s.button == **b))
            .copied()
            .collect();
        for button in stale {
            self.unregister(button);
        }
        for slot in slots {
            let unchanged = self
                .slots
                .get(&slot.button)
                .is_some_and(|r| r.slot == *slot);
            if !unchanged {
                self.register(slot.clone());
            }
        }
        info!("LED engine running {} slots", self.slots.len());
    }

    pub fn is_registered(&self, button: ButtonId) -> bool {
        self.slots.contains_key(&button)
    }
}

impl Drop for LedEngine {
    fn drop(&mut self) {
        for registered in self.slots.values() {
            registered.cancel.cancel();
        }
    }
}

/// Color a meeting predicate shows.
pub fn teams_color(
    predicate: TeamsPredicate,
    facts: &TeamsStateFact,
    color_on: LedColor,
    color_off: LedColor,
) -> LedColor {
    if predicate != TeamsPredicate::InMeeting && !facts.in_meeting {
        LedColor::Black
    } else if facts.get(predicate) {
        color_on
    } else {
        color_off
    }
}

/// Publishes a slot's color only when it differs from the last one.
struct Publisher {
    hub: Hub,
    button: ButtonId,
    last: Option<LedColor>,
}

impl Publisher {
    fn publish(&mut self, color: LedColor) {
        if self.last == Some(color) {
            return;
        }
        self.last = Some(color);
        debug!("LED {} -> {color}", self.button);
        self.hub.publish_led(LedColorChanged {
            button: self.button,
            color,
        });
    }
}

async fn run_slot(hub: Hub, slot: LedSlot, cancel: CancellationToken) {
    let mut out = Publisher {
        hub: hub.clone(),
        button: slot.button,
        last: None,
    };

    match &slot.source {
        LedSource::TeamsState {
            state,
            color_on,
            color_off,
        } => {
            let mut teams = hub.watch_teams();
            loop {
                let snapshot = *teams.borrow_and_update();
                // Nothing is shown until the first state frame arrives.
                if snapshot.known {
                    out.publish(teams_color(*state, &snapshot.facts, *color_on, *color_off));
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = teams.changed() => if changed.is_err() { break },
                }
            }
        }
        LedSource::ResultCommand { .. } | LedSource::ColorCommand { .. } => {
            let Some(poll) = slot.source.poll() else {
                return;
            };
            let mut ticker = tokio::time::interval(poll.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let resolve = async {
                    match &slot.source {
                        LedSource::ResultCommand {
                            color_on, color_off, ..
                        } => command::resolve_result(poll, *color_on, *color_off).await,
                        _ => command::resolve_color(poll).await,
                    }
                };
                tokio::select! {
                    () = cancel.cancelled() => break,
                    color = resolve => out.publish(color),
                }
            }
        }
        LedSource::Webhook => {
            let mut requests = hub.subscribe_webhook_leds();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    request = requests.recv() => match request {
                        Ok(request) if request.button == slot.button => out.publish(request.color),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("LED {} missed {n} webhook updates", slot.button);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
        LedSource::Off => {
            out.publish(LedColor::Black);
            cancel.cancelled().await;
        }
    }
    debug!("LED slot {} stopped", slot.button);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conference::messages::MeetingState;
    use std::time::Duration;
    use tokio::time::timeout;

    fn b(id: u8) -> ButtonId {
        ButtonId::new(id).unwrap()
    }

    fn slot(button: u8, source: LedSource) -> LedSlot {
        LedSlot {
            button: b(button),
            source,
        }
    }

    fn teams_slot(button: u8, state: TeamsPredicate) -> LedSlot {
        slot(
            button,
            LedSource::TeamsState {
                state,
                color_on: LedColor::Red,
                color_off: LedColor::Green,
            },
        )
    }

    fn result_slot(button: u8, command: &str, interval: f64) -> LedSlot {
        slot(
            button,
            LedSource::ResultCommand {
                command: command.to_string(),
                interval,
                timeout: 0.3,
                color_on: LedColor::Green,
                color_off: LedColor::Red,
            },
        )
    }

    async fn next(rx: &mut broadcast::Receiver<LedColorChanged>) -> LedColorChanged {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    fn set_meeting(hub: &Hub, state: MeetingState) {
        hub.update_teams(|s| {
            s.known = true;
            s.facts.apply(&state);
            true
        });
    }

    #[test]
    fn teams_colors() {
        let mut facts = TeamsStateFact::default();
        let (on, off) = (LedColor::Red, LedColor::Green);
        assert_eq!(teams_color(TeamsPredicate::Muted, &facts, on, off), LedColor::Black);
        assert_eq!(teams_color(TeamsPredicate::InMeeting, &facts, on, off), off);
        facts.in_meeting = true;
        assert_eq!(teams_color(TeamsPredicate::Muted, &facts, on, off), off);
        facts.muted = true;
        assert_eq!(teams_color(TeamsPredicate::Muted, &facts, on, off), on);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn result_command_colors() {
        let hub = Hub::new();
        let mut rx = hub.subscribe_leds();
        let mut engine = LedEngine::new(hub.clone(), CancellationToken::new());

        engine.register(result_slot(1, "exit 0", 60.0));
        assert_eq!(next(&mut rx).await.color, LedColor::Green);

        engine.register(result_slot(2, "exit 1", 60.0));
        let change = next(&mut rx).await;
        assert_eq!((change.button, change.color), (b(2), LedColor::Red));

        engine.register(result_slot(3, "sleep 5", 60.0));
        let change = next(&mut rx).await;
        assert_eq!((change.button, change.color), (b(3), LedColor::Black));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn repeated_resolutions_publish_once() {
        let hub = Hub::new();
        let mut rx = hub.subscribe_leds();
        let mut engine = LedEngine::new(hub.clone(), CancellationToken::new());

        engine.register(result_slot(4, "true", 0.05));
        assert_eq!(next(&mut rx).await.color, LedColor::Green);
        assert!(timeout(Duration::from_millis(500), rx.recv()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn color_command_output() {
        let hub = Hub::new();
        let mut rx = hub.subscribe_leds();
        let mut engine = LedEngine::new(hub.clone(), CancellationToken::new());
        engine.register(slot(
            5,
            LedSource::ColorCommand {
                command: "echo purple".to_string(),
                interval: 60.0,
                timeout: 1.0,
            },
        ));
        assert_eq!(next(&mut rx).await.color, LedColor::Purple);
    }

    #[tokio::test]
    async fn teams_state_follows_facts() {
        let hub = Hub::new();
        let mut rx = hub.subscribe_leds();
        let mut engine = LedEngine::new(hub.clone(), CancellationToken::new());
        engine.register(teams_slot(1, TeamsPredicate::Muted));
        tokio::task::yield_now().await;

        set_meeting(
            &hub,
            MeetingState {
                is_in_meeting: Some(true),
                is_muted: Some(true),
                ..MeetingState::default()
            },
        );
        assert_eq!(next(&mut rx).await.color, LedColor::Red);

        set_meeting(
            &hub,
            MeetingState {
                is_in_meeting: Some(false),
                ..MeetingState::default()
            },
        );
        assert_eq!(next(&mut rx).await.color, LedColor::Black);
    }

    #[tokio::test]
    async fn stale_facts_keep_color() {
        let hub = Hub::new();
        set_meeting(
            &hub,
            MeetingState {
                is_in_meeting: Some(true),
                is_video_on: Some(true),
                ..MeetingState::default()
            },
        );
        let mut rx = hub.subscribe_leds();
        let mut engine = LedEngine::new(hub.clone(), CancellationToken::new());
        engine.register(teams_slot(6, TeamsPredicate::VideoOn));
        assert_eq!(next(&mut rx).await.color, LedColor::Red);

        hub.update_teams(|s| {
            s.stale = true;
            true
        });
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn webhook_sets_only_its_button() {
        let hub = Hub::new();
        let mut rx = hub.subscribe_leds();
        let mut engine = LedEngine::new(hub.clone(), CancellationToken::new());
        engine.register(slot(7, LedSource::Webhook));
        tokio::task::yield_now().await;

        hub.publish_webhook_led(LedColorChanged {
            button: b(8),
            color: LedColor::Blue,
        });
        hub.publish_webhook_led(LedColorChanged {
            button: b(7),
            color: LedColor::Yellow,
        });
        let change = next(&mut rx).await;
        assert_eq!((change.button, change.color), (b(7), LedColor::Yellow));
    }

    #[tokio::test]
    async fn reconcile_replaces_and_removes() {
        let hub = Hub::new();
        let mut rx = hub.subscribe_leds();
        let mut engine = LedEngine::new(hub.clone(), CancellationToken::new());
        engine.reconcile(&[slot(1, LedSource::Off), slot(2, LedSource::Webhook)]);
        assert_eq!(next(&mut rx).await, LedColorChanged { button: b(1), color: LedColor::Black });
        assert!(engine.is_registered(b(2)));

        engine.reconcile(&[slot(1, LedSource::Off)]);
        assert!(engine.is_registered(b(1)));
        assert!(!engine.is_registered(b(2)));
        // Slot 1 is unchanged, so it is not restarted and does not republish.
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        assert!(engine.unregister(b(1)));
        assert!(!engine.unregister(b(1)));
    }
}
