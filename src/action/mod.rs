pub mod actuator;
pub mod http;
pub mod shell;

use crate::conference::messages::{ActionParameter, MeetingAction};
use crate::config::schema::ActionDetail;
use crate::error::Result;
use crate::event::{ButtonId, Hub, MeetingCommand};
use actuator::{activate_window_command, Actuators};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs action chains against the outside world.
pub struct ActionExecutor {
    hub: Hub,
    http: reqwest::Client,
    actuators: Arc<dyn Actuators>,
    /// Shell line run for `activate_teams`.
    activate_window: String,
}

impl ActionExecutor {
    pub fn new(hub: Hub, actuators: Arc<dyn Actuators>) -> Self {
        Self {
            hub,
            http: reqwest::Client::new(),
            actuators,
            activate_window: activate_window_command(),
        }
    }

    /// Replace the platform's window activation command.
    pub fn with_activate_command(mut self, line: impl Into<String>) -> Self {
        self.activate_window = line.into();
        self
    }

    /// Execute every entry in order. A failing entry is logged and the
    /// chain moves on. Returns the number of failed entries.
    pub async fn run_chain(
        &self,
        button: ButtonId,
        chain: &[ActionDetail],
        command_timeout: Duration,
    ) -> usize {
        let mut failures = 0;
        for (index, action) in chain.iter().enumerate() {
            if let Err(e) = self.execute(action, command_timeout).await {
                failures += 1;
                warn!("button {button}: action {} failed: {e}", index + 1);
            }
        }
        failures
    }

    /// Execute one chain entry.
    ///
    /// # Errors
    /// Returns `PadError` if the action fails (HTTP error, shell failure, etc.).
    pub async fn execute(&self, action: &ActionDetail, command_timeout: Duration) -> Result<()> {
        match action {
            ActionDetail::Webhook {
                method,
                url,
                headers,
                params,
                data,
                timeout_ms,
            } => {
                info!("executing HTTP {method} {url}");
                let hook = http::Webhook {
                    method,
                    url,
                    headers,
                    params,
                    data: data.as_ref(),
                    timeout: timeout_ms.map_or(command_timeout, Duration::from_millis),
                };
                http::execute(&self.http, &hook).await
            }
            ActionDetail::Command {
                command,
                timeout_ms,
            } => {
                info!("executing shell: {command}");
                let timeout = timeout_ms.map_or(command_timeout, Duration::from_millis);
                shell::execute(command, timeout).await
            }
            ActionDetail::MeetingAction {
                meeting_action,
                parameter,
            } => {
                self.meeting(*meeting_action, *parameter);
                Ok(())
            }
            ActionDetail::TeamsReaction { reaction } => {
                self.meeting(
                    MeetingAction::SendReaction,
                    Some(ActionParameter::Reaction(*reaction)),
                );
                Ok(())
            }
            ActionDetail::Keyboard { keyboard } => self.actuators.keyboard(keyboard),
            ActionDetail::Mouse { mouse } => self.actuators.mouse(mouse),
            ActionDetail::ActivateTeams => {
                info!("activating meeting client window");
                shell::execute(&self.activate_window, command_timeout).await
            }
            ActionDetail::Delay { seconds } => {
                tokio::time::sleep(Duration::try_from_secs_f64(*seconds).unwrap_or_default()).await;
                Ok(())
            }
        }
    }

    fn meeting(&self, action: MeetingAction, parameter: Option<ActionParameter>) {
        info!("meeting action: {action:?}");
        self.hub.publish_meeting(MeetingCommand { action, parameter });
    }
}
