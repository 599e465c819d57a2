//! Turns raw press/release events into fired action chains.
//!
//! Every button has its own worker task. Hardware and virtual events for a
//! button land in the same worker, so they are strictly serialized and a
//! press cycle fires at most one chain. Chains run inside the worker; events
//! arriving meanwhile wait their turn.

use crate::action::ActionExecutor;
use crate::config::schema::{ActionDetail, AppConfig};
use crate::event::{ButtonEvent, ButtonId, ButtonPhase, EventSource, Hub};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WORKER_QUEUE: usize = 32;

pub struct Dispatcher {
    hub: Hub,
    config: Arc<ArcSwap<AppConfig>>,
    executor: Arc<ActionExecutor>,
}

impl Dispatcher {
    pub fn new(hub: Hub, config: Arc<ArcSwap<AppConfig>>, executor: Arc<ActionExecutor>) -> Self {
        Self {
            hub,
            config,
            executor,
        }
    }

    /// Route hub button events to per-button workers until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut events = self.hub.subscribe_buttons();
        let mut workers: HashMap<ButtonId, mpsc::Sender<ButtonEvent>> = HashMap::new();

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dispatcher lagged, missed {n} button events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            // Our own derived events come back on the same topic.
            if event.phase == ButtonPhase::LongPressed {
                continue;
            }

            let worker = workers.entry(event.button).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE);
                let worker = ButtonWorker {
                    button: event.button,
                    hub: self.hub.clone(),
                    config: self.config.clone(),
                    executor: self.executor.clone(),
                };
                tokio::spawn(worker.run(rx, cancel.child_token()));
                tx
            });
            // A dropped release is recovered by the worker on the next press.
            if worker.try_send(event).is_err() {
                warn!("button {} busy, dropping {:?}", event.button, event.phase);
            }
        }
        info!("dispatcher stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Held, no long chain configured: release fires the short chain.
    Pressed,
    /// Held with a long chain waiting for `deadline`.
    Pending { deadline: Instant },
    /// Long chain already fired; waiting for release.
    Held,
}

struct ButtonWorker {
    button: ButtonId,
    hub: Hub,
    config: Arc<ArcSwap<AppConfig>>,
    executor: Arc<ActionExecutor>,
}

impl ButtonWorker {
    async fn run(self, mut events: mpsc::Receiver<ButtonEvent>, cancel: CancellationToken) {
        let mut phase = Phase::Idle;
        loop {
            let event = if let Phase::Pending { deadline } = phase {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    event = events.recv() => event,
                    () = sleep_until(deadline) => {
                        phase = Phase::Held;
                        self.fire_long(deadline).await;
                        continue;
                    }
                }
            } else {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = events.recv() => event,
                }
            };
            let Some(event) = event else { return };
            phase = self.step(phase, &event).await;
        }
    }

    async fn step(&self, phase: Phase, event: &ButtonEvent) -> Phase {
        match (phase, event.phase) {
            (Phase::Idle, ButtonPhase::Pressed) => self.press(event),
            (Phase::Pressed | Phase::Pending { .. } | Phase::Held, ButtonPhase::Pressed) => {
                // The release of the previous cycle never arrived.
                warn!("button {}: press without release, starting over", self.button);
                self.press(event)
            }
            (Phase::Pressed, ButtonPhase::Released) => {
                self.fire(Chain::Short).await;
                Phase::Idle
            }
            (Phase::Pending { deadline }, ButtonPhase::Released) => {
                // Decided by timestamps, so a late-processed release still
                // counts as long when it happened after the threshold.
                if event.at >= deadline {
                    self.fire_long(deadline).await;
                } else {
                    self.fire(Chain::Short).await;
                }
                Phase::Idle
            }
            (Phase::Held, ButtonPhase::Released) => Phase::Idle,
            (phase, other) => {
                debug!("button {}: ignoring {other:?} while {phase:?}", self.button);
                phase
            }
        }
    }

    fn press(&self, event: &ButtonEvent) -> Phase {
        let config = self.config.load();
        let has_long = config.button(self.button).is_some_and(|b| !b.long.is_empty());
        if has_long {
            let hold = Duration::from_millis(config.dispatch.long_press_ms);
            Phase::Pending {
                deadline: event.at + hold,
            }
        } else {
            Phase::Pressed
        }
    }

    async fn fire_long(&self, at: Instant) {
        self.hub.publish_button(ButtonEvent {
            button: self.button,
            phase: ButtonPhase::LongPressed,
            source: EventSource::Hardware,
            at,
        });
        self.fire(Chain::Long).await;
    }

    async fn fire(&self, which: Chain) {
        // Owned snapshot: the chain may run for a while.
        let config = self.config.load_full();
        let Some(button) = config.button(self.button) else {
            debug!("button {} has no actions", self.button);
            return;
        };
        let chain: &[ActionDetail] = match which {
            Chain::Short => &button.short,
            Chain::Long => &button.long,
        };
        if chain.is_empty() {
            return;
        }
        info!("button {}: firing {which:?} chain ({} actions)", self.button, chain.len());
        let timeout = Duration::from_millis(config.dispatch.command_timeout_ms);
        self.executor.run_chain(self.button, chain, timeout).await;
    }
}

#[derive(Debug, Clone, Copy)]
enum Chain {
    Short,
    Long,
}
