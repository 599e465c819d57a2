use crate::action::shell;
use crate::config::schema::CommandPoll;
use crate::error::{PadError, Result};
use crate::event::LedColor;
use tracing::debug;

/// Exit status picks the color. A timeout or launch failure shows black.
pub async fn resolve_result(poll: CommandPoll<'_>, color_on: LedColor, color_off: LedColor) -> LedColor {
    match shell::output(poll.command, poll.timeout).await {
        Ok(output) if output.status.success() => color_on,
        Ok(_) => color_off,
        Err(e) => fallback(poll.command, &e),
    }
}

/// The command prints a color name. Anything unparseable shows black.
pub async fn resolve_color(poll: CommandPoll<'_>) -> LedColor {
    match read_color(poll).await {
        Ok(color) => color,
        Err(e) => fallback(poll.command, &e),
    }
}

async fn read_color(poll: CommandPoll<'_>) -> Result<LedColor> {
    let output = shell::output(poll.command, poll.timeout).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.parse().map_err(PadError::SourceResolution)
}

fn fallback(command: &str, error: &PadError) -> LedColor {
    debug!("LED command {command:?} failed: {error}");
    LedColor::Black
}
