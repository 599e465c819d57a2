use crate::error::PadError;
use crate::event::{ControlEvent, Hub};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watch a config file for changes and publish `ConfigReloaded` on the hub.
///
/// The parent directory is watched so editors that replace the file on save
/// are still noticed. A reload that fails to parse or validate is logged and
/// the running config stays in place.
///
/// # Errors
/// Returns `PadError::Watcher` if the file watcher cannot be initialized.
pub async fn watch_config(
    config_path: PathBuf,
    hub: Hub,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(16);
    let file_name = config_path.file_name().map(ToOwned::to_owned);
    let watch_dir = match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut debouncer = new_debouncer(
        DEBOUNCE,
        move |events: Result<Vec<DebouncedEvent>, notify::Error>| match events {
            Ok(events) => {
                let touched = events.iter().any(|evt| {
                    evt.kind == DebouncedEventKind::Any
                        && evt.path.file_name() == file_name.as_deref()
                });
                if touched {
                    let _ = notify_tx.blocking_send(());
                }
            }
            Err(e) => warn!("file watcher error: {e}"),
        },
    )
    .map_err(|e| PadError::Watcher(e.to_string()))?;
    debouncer
        .watcher()
        .watch(&watch_dir, notify::RecursiveMode::NonRecursive)
        .map_err(|e| PadError::Watcher(e.to_string()))?;
    info!("watching config file: {}", config_path.display());

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("config watcher shutting down");
                return Ok(());
            }
            changed = notify_rx.recv() => {
                if changed.is_none() {
                    return Ok(());
                }
                info!("config file changed, reloading...");
                match crate::config::load(&config_path) {
                    Ok(new_config) => {
                        hub.publish_control(ControlEvent::ConfigReloaded(Arc::new(new_config)));
                        info!("config reloaded successfully");
                    }
                    Err(e) => {
                        warn!("config reload failed, keeping old config: {e}");
                    }
                }
            }
        }
    }
}
