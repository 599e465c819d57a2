//! Virtual keypad relay: a browser-facing websocket plus a small HTTP API.
//!
//! Every websocket client gets its own task with its own hub subscriptions,
//! so a slow browser only ever lags itself.

use crate::config::schema::RelayConfig;
use crate::error::Result;
use crate::event::{ButtonEvent, ButtonId, ButtonPhase, EventSource, Hub, LedColor, LedColorChanged};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RelayState {
    hub: Hub,
    /// Last color set through `POST /api/led`.
    webhook: RwLock<HashMap<ButtonId, LedColor>>,
    cancel: CancellationToken,
}

impl RelayState {
    fn snapshot(&self) -> Vec<LedColorChanged> {
        let colors = self.hub.led_snapshot();
        ButtonId::all()
            .filter_map(|button| {
                colors[button.index()].map(|color| LedColorChanged { button, color })
            })
            .collect()
    }

    /// A virtual click: press immediately followed by release.
    fn click(&self, button: ButtonId) {
        debug!("virtual click on button {button}");
        for phase in [ButtonPhase::Pressed, ButtonPhase::Released] {
            self.hub
                .publish_button(ButtonEvent::now(button, phase, EventSource::Virtual));
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outbound {
    Led(LedColorChanged),
    Device { device: &'static str },
    Error { error: String },
}

impl Outbound {
    fn device(connected: bool) -> Self {
        Self::Device {
            device: if connected { "connected" } else { "disconnected" },
        }
    }

    fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Inbound {
    command: String,
    #[serde(default)]
    button: Option<ButtonId>,
}

/// Bind the configured address and serve until cancelled.
///
/// # Errors
/// Returns `PadError::Io` if the address cannot be bound.
pub async fn serve(hub: Hub, config: &RelayConfig, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind((config.bind_address.as_str(), config.bind_port)).await?;
    serve_on(listener, hub, cancel).await
}

/// Serve on an already bound listener until cancelled.
///
/// # Errors
/// Returns `PadError::Io` if the server fails.
pub async fn serve_on(listener: TcpListener, hub: Hub, cancel: CancellationToken) -> Result<()> {
    info!("relay listening on {}", listener.local_addr()?);
    let state = Arc::new(RelayState {
        hub,
        webhook: RwLock::new(HashMap::new()),
        cancel: cancel.clone(),
    });

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("relay stopped");
    Ok(())
}

fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/hardware_info", get(hardware_info))
        .route("/api/button", axum::routing::post(press_button))
        .route("/api/led", get(get_led).post(set_led))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| client(socket, state))
}

async fn client(mut socket: WebSocket, state: Arc<RelayState>) {
    info!("relay client connected");
    let mut leds = state.hub.subscribe_leds();
    let mut device = state.hub.watch_device();
    let mut connected = device.borrow_and_update().is_connected();

    let mut greeting = vec![Outbound::device(connected)];
    greeting.extend(state.snapshot().into_iter().map(Outbound::Led));
    for message in greeting {
        if send(&mut socket, &message).await.is_err() {
            return;
        }
    }

    loop {
        let outbound = tokio::select! {
            () = state.cancel.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => handle_inbound(&state, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    debug!("relay client read error: {e}");
                    break;
                }
            },
            change = leds.recv() => match change {
                Ok(change) => vec![Outbound::Led(change)],
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("relay client too slow, skipped {n} LED changes");
                    Vec::new()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = device.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = device.borrow_and_update().is_connected();
                if now == connected {
                    Vec::new()
                } else {
                    connected = now;
                    vec![Outbound::device(now)]
                }
            }
        };
        let mut gone = false;
        for message in outbound {
            if send(&mut socket, &message).await.is_err() {
                gone = true;
                break;
            }
        }
        if gone {
            break;
        }
    }
    info!("relay client disconnected");
}

fn handle_inbound(state: &RelayState, text: &str) -> Vec<Outbound> {
    let inbound: Inbound = match serde_json::from_str(text) {
        Ok(inbound) => inbound,
        Err(e) => return vec![Outbound::error(format!("malformed message: {e}"))],
    };
    match inbound.command.as_str() {
        "button" => match inbound.button {
            Some(button) => {
                state.click(button);
                Vec::new()
            }
            None => vec![Outbound::error("missing button")],
        },
        "state_request" => state.snapshot().into_iter().map(Outbound::Led).collect(),
        _ => vec![Outbound::error("unknown command")],
    }
}

async fn send(socket: &mut WebSocket, message: &Outbound) -> std::result::Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(json.into())).await
}

async fn hardware_info(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    let status = state.hub.device_status();
    let body = match &status.info {
        Some(info) => json!({
            "connected": status.is_connected(),
            "state": status.state,
            "hardware": info.variant,
            "version": info.version.to_string(),
            "manufacturer": info.manufacturer,
            "product": info.product,
            "serial_number": info.serial_number,
        }),
        None => json!({
            "connected": false,
            "state": status.state,
            "hardware": null,
            "version": null,
        }),
    };
    Json(body)
}

#[derive(Debug, Deserialize)]
struct ButtonRequest {
    button: u8,
}

fn not_found(button: u8) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("no such button: {button}") })),
    )
        .into_response()
}

async fn press_button(
    State(state): State<Arc<RelayState>>,
    Json(request): Json<ButtonRequest>,
) -> Response {
    match ButtonId::new(request.button) {
        Some(button) => {
            state.click(button);
            Json(json!({ "button": button })).into_response()
        }
        None => not_found(request.button),
    }
}

async fn get_led(
    State(state): State<Arc<RelayState>>,
    Query(request): Query<ButtonRequest>,
) -> Response {
    let Some(button) = ButtonId::new(request.button) else {
        return not_found(request.button);
    };
    let color = state
        .webhook
        .read()
        .get(&button)
        .copied()
        .unwrap_or(LedColor::Black);
    Json(LedColorChanged { button, color }).into_response()
}

#[derive(Debug, Deserialize)]
struct LedRequest {
    button: u8,
    color: String,
}

async fn set_led(State(state): State<Arc<RelayState>>, Json(request): Json<LedRequest>) -> Response {
    let color: LedColor = match request.color.parse() {
        Ok(color) => color,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response();
        }
    };
    let Some(button) = ButtonId::new(request.button) else {
        return not_found(request.button);
    };
    info!("webhook sets LED {button} to {color}");
    state.webhook.write().insert(button, color);
    let change = LedColorChanged { button, color };
    state.hub.publish_webhook_led(change);
    Json(change).into_response()
}
