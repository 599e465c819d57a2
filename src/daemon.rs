use crate::action::actuator::{Actuators, EnigoActuators};
use crate::action::ActionExecutor;
use crate::conference::ConferenceClient;
use crate::config::schema::AppConfig;
use crate::config::watcher;
use crate::device::link::{DeviceConnector, HidApiConnector};
use crate::device::session::{DeviceSession, SessionSettings};
use crate::device::DeviceManager;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::event::{ControlEvent, Hub};
use crate::led::LedEngine;
use crate::relay;
use crate::update::{self, FirmwareImage, UpdateSettings};
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the macropadd daemon until SIGINT or a `Shutdown` control event.
///
/// # Errors
/// Returns `PadError` if a fatal error occurs in any subsystem.
pub async fn run(config: AppConfig, config_path: PathBuf) -> Result<()> {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, shutting down");
            signal_cancel.cancel();
        }
    });
    serve(
        config,
        config_path,
        Arc::new(HidApiConnector),
        Arc::new(EnigoActuators),
        Hub::new(),
        cancel,
    )
    .await
}

/// Wire every component onto `hub` and run until `cancel` fires.
///
/// Reloaded configs reach the dispatcher and LED engine immediately; device
/// settings apply from the next reconnect. Meeting client and relay
/// settings need a restart.
///
/// # Errors
/// Returns `PadError` if a fatal error occurs in any subsystem.
pub async fn serve(
    config: AppConfig,
    config_path: PathBuf,
    connector: Arc<dyn DeviceConnector>,
    actuators: Arc<dyn Actuators>,
    hub: Hub,
    cancel: CancellationToken,
) -> Result<()> {
    let shared_config = Arc::new(ArcSwap::from_pointee(config));
    let config = shared_config.load_full();
    let mut control = hub.subscribe_control();

    let mut leds = LedEngine::new(hub.clone(), cancel.child_token());
    leds.reconcile(&config.leds);

    let executor = Arc::new(ActionExecutor::new(hub.clone(), actuators));
    let tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(Dispatcher::new(hub.clone(), shared_config.clone(), executor).run(cancel.clone())),
        tokio::spawn(DeviceManager::new(hub.clone(), connector, shared_config.clone()).run(cancel.clone())),
        tokio::spawn(ConferenceClient::new(hub.clone(), config.teams.clone()).run(cancel.clone())),
        spawn_relay(&hub, &config, &cancel),
        spawn_config_watcher(&hub, &cancel, &config_path),
    ];

    info!(
        "macropadd running: {} buttons, {} LED slots",
        config.buttons.len(),
        config.leds.len()
    );

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = control.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("control loop lagged, missed {n} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match event {
            ControlEvent::ConfigReloaded(new_config) => {
                leds.reconcile(&new_config.leds);
                shared_config.store(new_config);
            }
            ControlEvent::Shutdown => {
                info!("shutdown event received");
                break;
            }
        }
    }

    info!("daemon shutting down...");
    cancel.cancel();
    drop(leds);

    let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;
    if joined.is_err() {
        warn!("some tasks did not stop within {SHUTDOWN_GRACE:?}");
    }

    info!("daemon stopped");
    Ok(())
}

fn spawn_relay(hub: &Hub, config: &AppConfig, cancel: &CancellationToken) -> JoinHandle<()> {
    let hub = hub.clone();
    let relay_config = config.relay.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = relay::serve(hub, &relay_config, cancel).await {
            error!("relay error: {e}");
        }
    })
}

fn spawn_config_watcher(hub: &Hub, cancel: &CancellationToken, config_path: &Path) -> JoinHandle<()> {
    let hub = hub.clone();
    let cancel = cancel.clone();
    let path = config_path.to_path_buf();
    tokio::spawn(async move {
        if let Err(e) = watcher::watch_config(path, hub, cancel).await {
            error!("config watcher error: {e}");
        }
    })
}

/// Open the keypad once, install `image`, and close again.
///
/// # Errors
/// `PadError::DeviceNotFound` when no keypad answers, `PadError::Update`
/// when the transfer or the post-update version check fails.
pub async fn update_firmware(
    connector: Arc<dyn DeviceConnector>,
    config: &AppConfig,
    image: &FirmwareImage,
    force: bool,
) -> Result<()> {
    let session = DeviceSession::open(
        connector,
        &config.device.identifications,
        Hub::new(),
        SessionSettings::from(&config.device),
        CancellationToken::new(),
    )
    .await?;
    let current = session.info().version;
    info!(
        "keypad runs {current}, installing {} ({} bytes)",
        image.version,
        image.data.len()
    );
    let result = update::update(
        session.handle(),
        image,
        current,
        force,
        &UpdateSettings::from(&config.update),
    )
    .await;
    session.close().await;
    result?;
    Ok(())
}
