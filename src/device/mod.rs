pub mod link;
#[cfg(test)]
pub mod mock;
pub mod protocol;
pub mod session;

use crate::config::schema::AppConfig;
use crate::event::{Hub, LedColorChanged};
use crate::retry::{Backoff, FailureStreak};
use crate::update::release::ReleaseFeed;
use crate::update::{self, FirmwareVersion, UpdateSettings};
use arc_swap::ArcSwap;
use link::DeviceConnector;
use session::{DeviceSession, SessionHandle, SessionSettings};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Finds the keypad, keeps a session open, and reconnects when it goes away.
pub struct DeviceManager {
    hub: Hub,
    connector: Arc<dyn DeviceConnector>,
    config: Arc<ArcSwap<AppConfig>>,
}

impl DeviceManager {
    pub fn new(hub: Hub, connector: Arc<dyn DeviceConnector>, config: Arc<ArcSwap<AppConfig>>) -> Self {
        Self {
            hub,
            connector,
            config,
        }
    }

    /// Run the manager loop: enumerate -> open -> run -> backoff -> enumerate.
    pub async fn run(self, cancel: CancellationToken) {
        let mut leds = self.hub.subscribe_leds();
        let mut backoff = {
            let device = &self.config.load().device;
            Backoff::from_millis(device.reconnect_initial_ms, device.reconnect_max_ms)
        };
        let mut streak = FailureStreak::default();

        loop {
            let config = self.config.load_full();
            let opened = DeviceSession::open(
                self.connector.clone(),
                &config.device.identifications,
                self.hub.clone(),
                SessionSettings::from(&config.device),
                cancel.clone(),
            )
            .await;

            match opened {
                Ok(mut session) => {
                    backoff.reset();
                    let failures = streak.succeed();
                    if failures > 0 {
                        debug!("keypad found after {failures} failed attempts");
                    }
                    // Backlog is covered by the snapshot; later changes still arrive.
                    leds = leds.resubscribe();
                    let colors = self.hub.led_snapshot();
                    if colors.iter().any(Option::is_some) {
                        if let Err(e) = session.handle().send_leds(colors).await {
                            debug!("LED resync failed: {e}");
                        }
                    }
                    if config.device.auto_update {
                        tokio::spawn(auto_update(
                            session.handle().clone(),
                            session.info().version,
                            config.device.release_url.clone(),
                            UpdateSettings::from(&config.update),
                        ));
                    }

                    match attached(&self.hub, &mut session, &mut leds, &cancel).await {
                        Some(Ok(())) => info!("keypad session ended"),
                        Some(Err(e)) => warn!("keypad disconnected: {e}"),
                        None => {
                            session.close().await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    if streak.fail() {
                        warn!("keypad not available: {e}");
                    } else {
                        debug!("keypad not available: {e}");
                    }
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
        info!("device manager stopped");
    }
}

/// Forward LED changes to the open session until it ends. `None` means
/// the manager itself was cancelled.
async fn attached(
    hub: &Hub,
    session: &mut DeviceSession,
    leds: &mut broadcast::Receiver<LedColorChanged>,
    cancel: &CancellationToken,
) -> Option<crate::error::Result<()>> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            closed = session.closed() => return Some(closed),
            change = leds.recv() => match change {
                Ok(change) => {
                    if let Err(e) = session.handle().send_led(change.button, change.color).await {
                        debug!("LED {} not written: {e}", change.button);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("missed {n} LED changes, resyncing keypad");
                    let _ = session.handle().send_leds(hub.led_snapshot()).await;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            },
        }
    }
}

async fn auto_update(
    handle: SessionHandle,
    current: FirmwareVersion,
    release_url: String,
    settings: UpdateSettings,
) {
    let feed = match ReleaseFeed::new(release_url) {
        Ok(feed) => feed,
        Err(e) => {
            warn!("release feed unavailable: {e}");
            return;
        }
    };
    match feed.newer_than(current).await {
        Ok(Some(image)) => {
            info!("updating keypad firmware {current} -> {}", image.version);
            match update::update(&handle, &image, current, false, &settings).await {
                Ok(()) => info!("keypad firmware updated to {}", image.version),
                Err(e) => warn!("keypad firmware update failed: {e}"),
            }
        }
        Ok(None) => debug!("keypad firmware {current} is up to date"),
        Err(e) => warn!("release check failed: {e}"),
    }
}
