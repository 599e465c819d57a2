//! Client for the meeting application's local websocket API.
//!
//! One long-lived task owns the socket. It pairs with the meeting client,
//! turns `meetingUpdate` frames into [`facts::TeamsSnapshot`] updates on the
//! hub, and forwards meeting commands from fired action chains while the
//! connection is authenticated. Connection loss keeps the last known facts,
//! marks them stale, and reconnects with backoff.

pub mod facts;
pub mod messages;

use crate::config::schema::TeamsConfig;
use crate::error::{PadError, Result};
use crate::event::Hub;
use crate::retry::{Backoff, FailureStreak};
use crate::state::ConferenceConnectionState;
use futures::{Sink, SinkExt, StreamExt};
use messages::{ClientMessage, MeetingAction, RequestIds, ServerMessage};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Version of the local API protocol we speak.
pub const PROTOCOL_VERSION: &str = "2.0.0";

const PAIRING_REQUIRED: &str = "pairing approval required";

pub struct ConferenceClient {
    hub: Hub,
    config: TeamsConfig,
    token: Option<String>,
    ids: RequestIds,
}

enum Ended {
    Cancelled,
    Lost(String),
}

enum Frame {
    Ignored,
    Accepted,
    Rejected(String),
}

impl ConferenceClient {
    pub fn new(hub: Hub, config: TeamsConfig) -> Self {
        let token = config.token.clone().filter(|t| !t.is_empty());
        Self {
            hub,
            config,
            token,
            ids: RequestIds::default(),
        }
    }

    /// Connection URL carrying the device manifest and, once paired, the token.
    ///
    /// # Errors
    /// `PadError::Config` if the configured base URL does not parse.
    pub fn endpoint(&self) -> Result<reqwest::Url> {
        let mut params = vec![
            ("protocol-version", PROTOCOL_VERSION),
            ("manufacturer", self.config.manufacturer.as_str()),
            ("device", self.config.device.as_str()),
            ("app", self.config.app.as_str()),
            ("app-version", self.config.app_version.as_str()),
        ];
        if let Some(token) = &self.token {
            params.push(("token", token.as_str()));
        }
        reqwest::Url::parse_with_params(&self.config.url, &params)
            .map_err(|e| PadError::Config(format!("invalid meeting client url {}: {e}", self.config.url)))
    }

    /// Keep a connection to the meeting client until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = Backoff::from_millis(
            self.config.reconnect_initial_ms,
            self.config.reconnect_max_ms,
        );
        let mut streak = FailureStreak::default();

        loop {
            let url = match self.endpoint() {
                Ok(url) => url,
                Err(e) => {
                    error!("{e}");
                    break;
                }
            };
            self.hub.set_conference_state(ConferenceConnectionState::Handshaking);
            let connected = tokio::select! {
                () = cancel.cancelled() => break,
                connected = tokio_tungstenite::connect_async(url.as_str()) => connected,
            };

            let next = match connected {
                Ok((socket, _)) => {
                    debug!("connected to meeting client at {}", self.config.url);
                    match self.session(socket, &cancel, &mut backoff, &mut streak).await {
                        Ended::Cancelled => break,
                        Ended::Lost(reason) => {
                            self.mark_stale();
                            if streak.fail() {
                                warn!("meeting client connection lost: {reason}");
                            } else {
                                debug!("meeting client connection lost: {reason}");
                            }
                            ConferenceConnectionState::Degraded(reason)
                        }
                    }
                }
                Err(e) => {
                    if streak.fail() {
                        warn!("cannot reach meeting client at {}: {e}", self.config.url);
                    } else {
                        debug!("cannot reach meeting client at {}: {e}", self.config.url);
                    }
                    ConferenceConnectionState::Disconnected
                }
            };
            self.hub.set_conference_state(next);

            let delay = backoff.next_delay();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.mark_stale();
        self.hub.set_conference_state(ConferenceConnectionState::Disconnected);
        info!("meeting client stopped");
    }

    async fn session<S>(
        &mut self,
        socket: S,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
        streak: &mut FailureStreak,
    ) -> Ended
    where
        S: futures::Stream<Item = tungstenite::Result<Message>>
            + Sink<Message, Error = tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = socket.split();
        // Commands issued while we were away are not replayed.
        let mut commands = self.hub.subscribe_meeting();

        let query = ClientMessage::new(MeetingAction::QueryState, None, &self.ids);
        if let Err(e) = send(&mut sink, &query).await {
            return Ended::Lost(e.to_string());
        }

        let paired = self.token.is_some();
        if !paired {
            info!("no pairing token, approve the keypad in the meeting client");
            self.hub
                .set_conference_state(ConferenceConnectionState::Degraded(PAIRING_REQUIRED.to_string()));
        }
        let handshake = tokio::time::sleep(Duration::from_millis(self.config.handshake_timeout_ms));
        tokio::pin!(handshake);
        let mut authenticated = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ended::Cancelled;
                }
                () = &mut handshake, if paired && !authenticated => {
                    return Ended::Lost("no answer to handshake".to_string());
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match self.handle_frame(&text, authenticated) {
                        Frame::Accepted if !authenticated => {
                            authenticated = true;
                            self.on_authenticated(backoff, streak);
                        }
                        Frame::Rejected(reason) => {
                            // Reconnect unpaired so the user can approve again.
                            self.token = None;
                            return Ended::Lost(format!("pairing token rejected: {reason}"));
                        }
                        Frame::Accepted | Frame::Ignored => {}
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by meeting client".to_string(),
                            |f| format!("closed by meeting client ({}): {}", f.code, f.reason),
                        );
                        return Ended::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ended::Lost(e.to_string()),
                    None => return Ended::Lost("connection closed".to_string()),
                },
                command = commands.recv() => match command {
                    Ok(command) if authenticated => {
                        let message = ClientMessage::new(command.action, command.parameter, &self.ids);
                        debug!("sending {:?} (request {})", message.action, message.request_id);
                        if let Err(e) = send(&mut sink, &message).await {
                            return Ended::Lost(e.to_string());
                        }
                    }
                    Ok(command) => {
                        debug!("dropping {:?}: meeting client not authenticated", command.action);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("meeting client lagged, dropped {n} commands");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ended::Cancelled;
                    }
                },
            }
        }
    }

    fn handle_frame(&mut self, text: &str, authenticated: bool) -> Frame {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("ignoring unparseable frame: {e}");
                return Frame::Ignored;
            }
        };

        let mut accepted = false;
        if let Some(token) = message.token_refresh {
            info!("meeting client issued a new pairing token");
            self.token = Some(token.clone());
            self.hub.publish_token(token);
            accepted = true;
        }
        if let Some(reason) = message.error_msg {
            if !authenticated && !accepted {
                return Frame::Rejected(reason);
            }
            warn!("meeting client error for request {:?}: {reason}", message.request_id);
        }
        let paired = self.token.is_some();
        if let Some(response) = &message.response {
            debug!("request {:?}: {response}", message.request_id);
            accepted |= paired;
        }
        if let Some(update) = message.meeting_update {
            accepted |= paired;
            if authenticated || accepted {
                if let Some(state) = &update.meeting_state {
                    self.hub.update_teams(|snapshot| {
                        let changed = snapshot.facts.apply(state) || !snapshot.known;
                        snapshot.known = true;
                        changed
                    });
                }
                if let Some(permissions) = &update.meeting_permissions {
                    debug!("meeting permissions: {permissions:?}");
                }
            }
        }

        if accepted {
            Frame::Accepted
        } else {
            Frame::Ignored
        }
    }

    fn on_authenticated(&self, backoff: &mut Backoff, streak: &mut FailureStreak) {
        backoff.reset();
        match streak.succeed() {
            0 => info!("meeting client authenticated"),
            n => info!("meeting client authenticated after {n} failed attempts"),
        }
        // Values carried over from before the outage are current again.
        self.hub.update_teams(|snapshot| std::mem::take(&mut snapshot.stale));
        self.hub.set_conference_state(ConferenceConnectionState::Authenticated);
    }

    fn mark_stale(&self) {
        self.hub.update_teams(|snapshot| {
            if snapshot.known && !snapshot.stale {
                snapshot.stale = true;
                true
            } else {
                false
            }
        });
    }
}

async fn send<S>(sink: &mut S, message: &ClientMessage) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(message)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}
