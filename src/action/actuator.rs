use crate::config::schema::{KeyboardAction, MouseAction};
use crate::error::{PadError, Result};
use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use tracing::debug;

/// Title the meeting client's main window carries on every platform.
pub const CONFERENCE_WINDOW: &str = "Microsoft Teams";

/// Input emulation supplied by the host platform.
pub trait Actuators: Send + Sync {
    fn keyboard(&self, action: &KeyboardAction) -> Result<()>;

    fn mouse(&self, action: &MouseAction) -> Result<()>;
}

/// Keyboard and mouse emulation through `enigo`.
///
/// A fresh connection is opened per action, so the actuator itself holds no
/// platform handles and can be shared across tasks.
#[derive(Debug, Default)]
pub struct EnigoActuators;

impl EnigoActuators {
    fn connect() -> Result<Enigo> {
        Enigo::new(&Settings::default())
            .map_err(|e| PadError::Action(format!("input emulation unavailable: {e}")))
    }
}

fn input_error(e: enigo::InputError) -> PadError {
    PadError::Action(format!("input emulation failed: {e}"))
}

impl Actuators for EnigoActuators {
    fn keyboard(&self, action: &KeyboardAction) -> Result<()> {
        let mut enigo = Self::connect()?;
        match action {
            KeyboardAction::Press { key } => enigo
                .key(parse_key(key)?, Direction::Press)
                .map_err(input_error),
            KeyboardAction::Release { key } => enigo
                .key(parse_key(key)?, Direction::Release)
                .map_err(input_error),
            KeyboardAction::Tap { key, modifiers } => {
                let key = parse_key(key)?;
                let modifiers = modifiers
                    .iter()
                    .map(|m| parse_key(m))
                    .collect::<Result<Vec<_>>>()?;
                debug!("tap {key:?} with {modifiers:?}");

                let mut pressed = Vec::with_capacity(modifiers.len());
                let mut result = Ok(());
                for modifier in modifiers {
                    result = enigo.key(modifier, Direction::Press);
                    if result.is_err() {
                        break;
                    }
                    pressed.push(modifier);
                }
                if result.is_ok() {
                    result = enigo.key(key, Direction::Click);
                }
                // Modifiers are released even when the tap failed.
                for modifier in pressed.into_iter().rev() {
                    let _ = enigo.key(modifier, Direction::Release);
                }
                result.map_err(input_error)
            }
            KeyboardAction::Type { text } => enigo.text(text).map_err(input_error),
        }
    }

    fn mouse(&self, action: &MouseAction) -> Result<()> {
        let mut enigo = Self::connect()?;
        match action {
            MouseAction::Move { x, y } => enigo.move_mouse(*x, *y, Coordinate::Rel),
            MouseAction::Set { x, y } => enigo.move_mouse(*x, *y, Coordinate::Abs),
            MouseAction::Click { button, count } => {
                let button = parse_button(button)?;
                (0..*count).try_for_each(|_| enigo.button(button, Direction::Click))
            }
            MouseAction::Press { button } => enigo.button(parse_button(button)?, Direction::Press),
            MouseAction::Release { button } => {
                enigo.button(parse_button(button)?, Direction::Release)
            }
        }
        .map_err(input_error)
    }
}

/// Map a configured key name to an `enigo` key. Single characters are typed
/// as themselves.
pub fn parse_key(name: &str) -> Result<Key> {
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return Ok(Key::Unicode(c));
    }

    let key = match name.to_ascii_lowercase().as_str() {
        "ctrl" | "control" => Key::Control,
        "shift" => Key::Shift,
        "alt" | "option" => Key::Alt,
        "meta" | "cmd" | "command" | "super" | "win" => Key::Meta,
        "enter" | "return" => Key::Return,
        "esc" | "escape" => Key::Escape,
        "tab" => Key::Tab,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" => Key::Delete,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "capslock" => Key::CapsLock,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        other => return Err(PadError::Action(format!("unknown key: {other:?}"))),
    };
    Ok(key)
}

pub fn parse_button(name: &str) -> Result<Button> {
    match name.to_ascii_lowercase().as_str() {
        "left" => Ok(Button::Left),
        "right" => Ok(Button::Right),
        "middle" => Ok(Button::Middle),
        other => Err(PadError::Action(format!("unknown mouse button: {other:?}"))),
    }
}

/// Shell line that brings the meeting client's window to the front.
pub fn activate_window_command() -> String {
    if cfg!(windows) {
        format!(
            "powershell -NoProfile -Command \"(New-Object -ComObject WScript.Shell).AppActivate('{CONFERENCE_WINDOW}')\""
        )
    } else if cfg!(target_os = "macos") {
        format!("osascript -e 'tell application \"{CONFERENCE_WINDOW}\" to activate'")
    } else {
        format!("xdotool search --name '{CONFERENCE_WINDOW}' windowactivate")
    }
}

/// Fails every call; for tests that must not touch the real desktop.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct UnavailableActuators;

#[cfg(test)]
impl Actuators for UnavailableActuators {
    fn keyboard(&self, action: &KeyboardAction) -> Result<()> {
        Err(PadError::Action(format!(
            "no keyboard backend available for {action:?}"
        )))
    }

    fn mouse(&self, action: &MouseAction) -> Result<()> {
        Err(PadError::Action(format!("no mouse backend available for {action:?}")))
    }
}
