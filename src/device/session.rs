use super::link::{DeviceConnector, HidLink};
use super::protocol::{Frame, Report};
use crate::config::schema::{DeviceConfig, DeviceIdentification};
use crate::error::{PadError, Result, UpdateError};
use crate::event::{
    ButtonEvent, ButtonId, ButtonPhase, EventSource, Hub, LedColor, LedSnapshot, BUTTON_COUNT,
};
use crate::state::{DeviceInfo, DeviceSessionState};
use crate::update::FirmwareVersion;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;
const UPDATE_REPLY_BUFFER: usize = 16;

/// Timing of one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_misses: u32,
    pub version_timeout: Duration,
}

impl From<&DeviceConfig> for SessionSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            heartbeat_misses: config.heartbeat_misses.max(1),
            version_timeout: Duration::from_millis(config.version_timeout_ms),
        }
    }
}

enum Command {
    SetLed(ButtonId, LedColor),
    SetLeds(LedSnapshot),
    EnterUpdate(oneshot::Sender<std::result::Result<mpsc::Receiver<Frame>, UpdateError>>),
    UpdateFrame(Frame),
    LeaveUpdate(Option<oneshot::Sender<()>>),
    QueryVersion(oneshot::Sender<FirmwareVersion>),
}

/// Cheap handle for talking to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    hub: Hub,
    version_timeout: Duration,
}

impl SessionHandle {
    /// # Errors
    /// `PadError::DeviceLink` once the session has ended.
    pub async fn send_led(&self, button: ButtonId, color: LedColor) -> Result<()> {
        self.command(Command::SetLed(button, color)).await
    }

    /// Set several LEDs with one report; `None` entries are left alone.
    pub async fn send_leds(&self, colors: LedSnapshot) -> Result<()> {
        self.command(Command::SetLeds(colors)).await
    }

    /// Ask the keypad for its firmware version.
    pub async fn query_version(&self) -> Result<FirmwareVersion> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::QueryVersion(tx)).await?;
        match timeout(self.version_timeout, rx).await {
            Ok(Ok(version)) => Ok(version),
            Ok(Err(_)) => Err(PadError::DeviceLink("session closed".to_string())),
            Err(_) => Err(PadError::DeviceLink("version query timed out".to_string())),
        }
    }

    /// Switch the session to exclusive update traffic.
    ///
    /// Heartbeats stop and LED sets are held until the returned channel is
    /// left or dropped.
    pub async fn enter_update_mode(&self) -> std::result::Result<UpdateChannel, UpdateError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::EnterUpdate(tx))
            .await
            .map_err(|_| UpdateError::NotConnected)?;
        let replies = rx.await.map_err(|_| UpdateError::NotConnected)??;
        Ok(UpdateChannel {
            commands: self.commands.clone(),
            replies,
            left: false,
        })
    }

    /// Button events from every session, hardware and virtual alike.
    pub fn events(&self) -> broadcast::Receiver<ButtonEvent> {
        self.hub.subscribe_buttons()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PadError::DeviceLink("session closed".to_string()))
    }
}

/// Exclusive sub-channel used by the firmware update controller.
pub struct UpdateChannel {
    commands: mpsc::Sender<Command>,
    replies: mpsc::Receiver<Frame>,
    left: bool,
}

impl UpdateChannel {
    /// Write one update frame.
    pub async fn send(&self, frame: Frame) -> std::result::Result<(), UpdateError> {
        self.commands
            .send(Command::UpdateFrame(frame))
            .await
            .map_err(|_| UpdateError::SessionClosed)
    }

    /// Next `Ack`/`Nack` from the device. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.replies.recv().await
    }

    /// Return the session to `Connected` and flush held LED state.
    pub async fn leave(mut self) {
        self.left = true;
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::LeaveUpdate(Some(tx))).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl Drop for UpdateChannel {
    fn drop(&mut self) {
        if !self.left {
            let _ = self.commands.try_send(Command::LeaveUpdate(None));
        }
    }
}

/// An open, handshaken keypad connection.
pub struct DeviceSession {
    handle: SessionHandle,
    info: DeviceInfo,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl DeviceSession {
    /// Find the first keypad matching `identifications`, connect and run
    /// the version handshake.
    ///
    /// # Errors
    /// `PadError::DeviceNotFound` when nothing matches or the keypad does
    /// not answer the version query in time.
    pub async fn open(
        connector: Arc<dyn DeviceConnector>,
        identifications: &[DeviceIdentification],
        hub: Hub,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> Result<Self> {
        hub.set_device_state(DeviceSessionState::Connecting);
        // Enumeration and open are blocking HID calls.
        let wanted = identifications.to_vec();
        let connected = tokio::task::spawn_blocking(move || connector.connect(&wanted))
            .await
            .unwrap_or_else(|e| Err(PadError::DeviceLink(format!("enumeration task failed: {e}"))));
        let opened = match connected {
            Ok(mut link) => handshake(&mut link, settings.version_timeout)
                .await
                .map(|info| (link, info)),
            Err(e) => Err(e),
        };
        let (link, info) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                hub.set_device_state(DeviceSessionState::Disconnected);
                return Err(e);
            }
        };

        info!(
            "keypad connected: {} v{} (serial: {})",
            info.variant, info.version, info.serial_number
        );
        hub.set_device_info(info.clone());
        hub.set_device_state(DeviceSessionState::Connected);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = SessionActor {
            link,
            commands: cmd_rx,
            hub: hub.clone(),
            info: info.clone(),
            settings,
            update: None,
            held: [None; BUTTON_COUNT as usize],
            version_waiters: Vec::new(),
            awaiting_heartbeat: false,
            misses: 0,
        };
        let task_cancel = cancel.child_token();
        let task = tokio::spawn(actor.run(task_cancel.clone()));

        Ok(Self {
            handle: SessionHandle {
                commands: cmd_tx,
                hub,
                version_timeout: settings.version_timeout,
            },
            info,
            cancel: task_cancel,
            task: Some(task),
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Wait until the link is lost or the session is cancelled.
    ///
    /// # Errors
    /// `PadError::DeviceLink` describing why the link was lost.
    pub async fn closed(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        match joined {
            Ok(result) => result,
            Err(e) => Err(PadError::DeviceLink(format!("session task failed: {e}"))),
        }
    }

    /// Stop the session. Any running update fails with `SessionClosed`.
    pub async fn close(mut self) {
        self.cancel.cancel();
        let _ = self.closed().await;
    }
}

async fn handshake(link: &mut HidLink, version_timeout: Duration) -> Result<DeviceInfo> {
    let query = Frame::VersionQuery.encode()?;
    link.outbound
        .send(query)
        .await
        .map_err(|_| PadError::DeviceNotFound)?;

    let reply = timeout(version_timeout, async {
        while let Some(report) = link.inbound.recv().await {
            if let Ok(Frame::VersionReply { version, variant }) = Frame::decode(&report) {
                return Some((version, variant));
            }
        }
        None
    })
    .await;

    match reply {
        Ok(Some((version, variant))) => Ok(DeviceInfo {
            variant,
            version,
            manufacturer: link.manufacturer.clone(),
            product: link.product.clone(),
            serial_number: link.serial_number.clone(),
        }),
        Ok(None) => Err(PadError::DeviceNotFound),
        Err(_) => {
            warn!("keypad did not answer version query within {version_timeout:?}");
            Err(PadError::DeviceNotFound)
        }
    }
}

struct SessionActor {
    link: HidLink,
    commands: mpsc::Receiver<Command>,
    hub: Hub,
    info: DeviceInfo,
    settings: SessionSettings,
    update: Option<mpsc::Sender<Frame>>,
    held: LedSnapshot,
    version_waiters: Vec<oneshot::Sender<FirmwareVersion>>,
    awaiting_heartbeat: bool,
    misses: u32,
}

impl SessionActor {
    async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                report = self.link.inbound.recv() => {
                    let Some(report) = report else {
                        break Err(PadError::DeviceLink("device removed".to_string()));
                    };
                    self.handle_report(&report);
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break Ok(()) };
                    if let Err(e) = self.handle_command(command).await {
                        break Err(e);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        break Err(e);
                    }
                }
            }
        };

        match &result {
            Ok(()) => info!("keypad session closed"),
            Err(e) => warn!("keypad disconnected: {e}"),
        }
        self.hub.set_device_state(DeviceSessionState::Disconnected);
        result
    }

    async fn write(&self, frame: &Frame) -> Result<()> {
        let report = frame.encode()?;
        self.link
            .outbound
            .send(report)
            .await
            .map_err(|_| PadError::DeviceLink("write to closed link".to_string()))
    }

    async fn heartbeat(&mut self) -> Result<()> {
        if self.update.is_some() {
            return Ok(());
        }
        if self.awaiting_heartbeat {
            self.misses += 1;
            debug!("heartbeat missed ({}/{})", self.misses, self.settings.heartbeat_misses);
            if self.misses >= self.settings.heartbeat_misses {
                return Err(PadError::DeviceLink(format!(
                    "{} consecutive heartbeats unanswered",
                    self.misses
                )));
            }
        }
        self.awaiting_heartbeat = true;
        self.write(&Frame::Heartbeat).await
    }

    fn handle_report(&mut self, report: &Report) {
        let frame = match Frame::decode(report) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("ignoring report: {e}");
                return;
            }
        };

        match frame {
            Frame::ButtonPress(button) => {
                debug!("button {button} pressed");
                self.hub.publish_button(ButtonEvent::now(
                    button,
                    ButtonPhase::Pressed,
                    EventSource::Hardware,
                ));
            }
            Frame::ButtonRelease(button) => {
                debug!("button {button} released");
                self.hub.publish_button(ButtonEvent::now(
                    button,
                    ButtonPhase::Released,
                    EventSource::Hardware,
                ));
            }
            Frame::Heartbeat => {
                self.awaiting_heartbeat = false;
                self.misses = 0;
            }
            Frame::VersionReply { version, variant } => {
                if self.info.version != version || self.info.variant != variant {
                    self.info.version = version;
                    self.info.variant = variant;
                    self.hub.set_device_info(self.info.clone());
                }
                for waiter in self.version_waiters.drain(..) {
                    let _ = waiter.send(version);
                }
            }
            reply @ (Frame::Ack { .. } | Frame::Nack { .. }) => match &self.update {
                Some(tx) => {
                    if tx.try_send(reply).is_err() {
                        warn!("update reply dropped");
                    }
                }
                None => debug!("stray {reply:?} outside update"),
            },
            other => debug!("unexpected frame from keypad: {other:?}"),
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SetLed(button, color) => {
                if self.update.is_some() {
                    self.held[button.index()] = Some(color);
                    return Ok(());
                }
                self.write(&Frame::LedSet(button, color)).await
            }
            Command::SetLeds(colors) => {
                if self.update.is_some() {
                    for (held, color) in self.held.iter_mut().zip(colors) {
                        if color.is_some() {
                            *held = color;
                        }
                    }
                    return Ok(());
                }
                self.write(&Frame::LedSetBulk(colors)).await
            }
            Command::EnterUpdate(reply) => {
                if self.update.is_some() {
                    let _ = reply.send(Err(UpdateError::Busy));
                    return Ok(());
                }
                let (tx, rx) = mpsc::channel(UPDATE_REPLY_BUFFER);
                self.update = Some(tx);
                self.hub.set_device_state(DeviceSessionState::Updating);
                info!("keypad entered update mode");
                let _ = reply.send(Ok(rx));
                Ok(())
            }
            Command::UpdateFrame(frame) => {
                if self.update.is_none() {
                    warn!("dropping update frame outside update mode");
                    return Ok(());
                }
                self.write(&frame).await
            }
            Command::LeaveUpdate(ack) => {
                let result = self.leave_update().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                result
            }
            Command::QueryVersion(reply) => {
                self.version_waiters.push(reply);
                self.write(&Frame::VersionQuery).await
            }
        }
    }

    async fn leave_update(&mut self) -> Result<()> {
        if self.update.take().is_none() {
            return Ok(());
        }
        info!("keypad left update mode");
        self.hub.set_device_state(DeviceSessionState::Connected);
        self.awaiting_heartbeat = false;
        self.misses = 0;

        let held = std::mem::take(&mut self.held);
        if held.iter().any(Option::is_some) {
            self.write(&Frame::LedSetBulk(held)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockConnector, MockFirmware};

    fn settings() -> SessionSettings {
        SessionSettings {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_misses: 3,
            version_timeout: Duration::from_millis(200),
        }
    }

    fn b(id: u8) -> ButtonId {
        ButtonId::new(id).unwrap()
    }

    async fn open(connector: &Arc<MockConnector>, hub: &Hub) -> Result<DeviceSession> {
        DeviceSession::open(connector.clone(), &[], hub.clone(), settings(), CancellationToken::new()).await
    }

    #[tokio::test]
    async fn open_publishes_device_info() {
        let (connector, firmware) = MockConnector::with_device();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await.unwrap();

        assert_eq!(session.info().version, FirmwareVersion::new(1, 0, 0));
        let status = hub.device_status();
        assert_eq!(status.state, DeviceSessionState::Connected);
        assert_eq!(status.info.unwrap().serial_number, "MOCK-1");
    }

    #[tokio::test]
    async fn open_without_device_is_not_found() {
        let connector = MockConnector::empty();
        let hub = Hub::new();
        let err = open(&connector, &hub).await.err().unwrap();
        assert!(matches!(err, PadError::DeviceNotFound));
        assert_eq!(hub.device_status().state, DeviceSessionState::Disconnected);
    }

    /// Enumeration that takes a while, like a busy USB bus.
    struct SlowConnector;

    impl DeviceConnector for SlowConnector {
        fn connect(&self, _identifications: &[DeviceIdentification]) -> Result<HidLink> {
            std::thread::sleep(Duration::from_millis(300));
            Err(PadError::DeviceNotFound)
        }
    }

    #[tokio::test]
    async fn slow_enumeration_leaves_runtime_free() {
        let hub = Hub::new();
        let opening = tokio::spawn(DeviceSession::open(
            Arc::new(SlowConnector),
            &[],
            hub.clone(),
            settings(),
            CancellationToken::new(),
        ));
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!opening.is_finished());

        assert!(matches!(opening.await.unwrap(), Err(PadError::DeviceNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_fails_handshake() {
        let (connector, firmware) = MockConnector::with_device();
        firmware.set_answer_version(false);
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let err = open(&connector, &hub).await.err().unwrap();
        assert!(matches!(err, PadError::DeviceNotFound));
    }

    #[tokio::test]
    async fn button_reports_reach_the_hub() {
        let (connector, firmware) = MockConnector::with_device();
        let input = firmware.input();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let mut events = hub.subscribe_buttons();
        let _session = open(&connector, &hub).await.unwrap();

        input.send(Frame::ButtonPress(b(4)).encode().unwrap()).await.unwrap();
        input.send(Frame::ButtonRelease(b(4)).encode().unwrap()).await.unwrap();

        let pressed = events.recv().await.unwrap();
        let released = events.recv().await.unwrap();
        assert_eq!((pressed.button, pressed.phase), (b(4), ButtonPhase::Pressed));
        assert_eq!(released.phase, ButtonPhase::Released);
        assert_eq!(released.source, EventSource::Hardware);
        assert!(released.at >= pressed.at);
    }

    #[tokio::test]
    async fn led_sets_are_written() {
        let (connector, firmware) = MockConnector::with_device();
        let log = firmware.log();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await.unwrap();

        session.handle().send_led(b(2), LedColor::Cyan).await.unwrap();
        // Round trip through the actor so the write has happened.
        session.handle().query_version().await.unwrap();
        assert!(log.lock().contains(&Frame::LedSet(b(2), LedColor::Cyan)));
    }

    #[tokio::test(start_paused = true)]
    async fn answered_heartbeats_keep_link() {
        let (connector, firmware) = MockConnector::with_device();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let mut session = open(&connector, &hub).await.unwrap();

        let still_open = timeout(Duration::from_secs(2), session.closed()).await;
        assert!(still_open.is_err());
        assert_eq!(hub.device_status().state, DeviceSessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn three_missed_heartbeats_disconnect() {
        let (connector, firmware) = MockConnector::with_device();
        let heartbeats = firmware.heartbeat_switch();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let mut session = open(&connector, &hub).await.unwrap();

        heartbeats.store(false, std::sync::atomic::Ordering::SeqCst);
        let started = Instant::now();
        let result = session.closed().await;
        assert!(matches!(result, Err(PadError::DeviceLink(_))));
        // Sent at 100, missed at 200, 300, 400.
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(hub.device_status().state, DeviceSessionState::Disconnected);
        assert!(hub.device_status().info.is_none());
    }

    #[tokio::test]
    async fn unplug_ends_session() {
        let (connector, firmware) = MockConnector::with_device();
        let fw = firmware.spawn();
        let hub = Hub::new();
        let mut session = open(&connector, &hub).await.unwrap();

        fw.abort();
        assert!(matches!(session.closed().await, Err(PadError::DeviceLink(_))));
        assert!(session.handle().is_closed());
    }

    #[tokio::test]
    async fn leds_are_held_during_update() {
        let (connector, firmware) = MockConnector::with_device();
        let log = firmware.log();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await.unwrap();
        let handle = session.handle();

        let channel = handle.enter_update_mode().await.unwrap();
        assert_eq!(hub.device_status().state, DeviceSessionState::Updating);
        assert_eq!(handle.enter_update_mode().await.err(), Some(UpdateError::Busy));

        handle.send_led(b(1), LedColor::Red).await.unwrap();
        handle.send_led(b(1), LedColor::Blue).await.unwrap();
        channel.leave().await;
        assert_eq!(hub.device_status().state, DeviceSessionState::Connected);

        handle.query_version().await.unwrap();
        let log = log.lock();
        assert!(!log.iter().any(|f| matches!(f, Frame::LedSet(..))));
        let mut expected = [None; 10];
        expected[0] = Some(LedColor::Blue);
        assert!(log.contains(&Frame::LedSetBulk(expected)));
    }

    #[tokio::test]
    async fn close_fails_running_update() {
        let (connector, firmware) = MockConnector::with_device();
        let _fw = firmware.spawn();
        let hub = Hub::new();
        let session = open(&connector, &hub).await.unwrap();

        let mut channel = session.handle().enter_update_mode().await.unwrap();
        session.close().await;
        assert!(channel.recv().await.is_none());
        assert_eq!(
            channel.send(Frame::UpdateEnd).await,
            Err(UpdateError::SessionClosed)
        );
        assert_eq!(hub.device_status().state, DeviceSessionState::Disconnected);
    }
}
