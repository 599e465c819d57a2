pub mod schema;
pub mod watcher;

use crate::error::{PadError, Result};
use schema::{ActionDetail, AppConfig, LedSource};
use std::collections::HashSet;
use std::path::Path;

/// Load and parse configuration from a TOML file.
///
/// # Errors
/// Returns `PadError::ConfigNotFound` if the file doesn't exist,
/// `PadError::Io` on read errors, `PadError::TomlParse` on syntax errors,
/// or `PadError::Config` on validation failures.
pub fn load(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Err(PadError::ConfigNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let content = expand_env_vars(&content);
    let config: AppConfig = toml::from_str(&content)?;

    validate(&config)?;
    Ok(config)
}

/// Expand `${VAR}` and `$VAR` patterns in the config string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Unknown variables stay verbatim.
                    use std::fmt::Write;
                    let _ = write!(result, "${{{var_name}}}");
                }
            }
        } else {
            let mut var_name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    var_name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if var_name.is_empty() {
                result.push('$');
            } else if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            } else {
                result.push('$');
                result.push_str(&var_name);
            }
        }
    }

    result
}

/// Validate config constraints serde cannot express.
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.device.identifications.is_empty() {
        return Err(PadError::Config(
            "device.identifications must not be empty".to_string(),
        ));
    }
    if config.device.heartbeat_interval_ms == 0 || config.device.heartbeat_misses == 0 {
        return Err(PadError::Config(
            "device heartbeat interval and misses must be positive".to_string(),
        ));
    }
    if config.dispatch.long_press_ms == 0 {
        return Err(PadError::Config("dispatch.long_press_ms must be positive".to_string()));
    }

    let mut seen = HashSet::new();
    for button in &config.buttons {
        if !seen.insert(button.id) {
            return Err(PadError::Config(format!(
                "button {} has more than one action entry",
                button.id
            )));
        }
        for action in button.short.iter().chain(&button.long) {
            if let ActionDetail::Delay { seconds } = action {
                if !seconds.is_finite() || *seconds < 0.0 {
                    return Err(PadError::Config(format!(
                        "button {}: delay must be a non-negative number of seconds",
                        button.id
                    )));
                }
            }
        }
    }

    let mut seen = HashSet::new();
    for slot in &config.leds {
        if !seen.insert(slot.button) {
            return Err(PadError::Config(format!(
                "LED of button {} is configured more than once",
                slot.button
            )));
        }
        if let LedSource::ResultCommand {
            interval, timeout, ..
        }
        | LedSource::ColorCommand {
            interval, timeout, ..
        } = &slot.source
        {
            let valid = |v: f64| v.is_finite() && v > 0.0;
            if !valid(*interval) || !valid(*timeout) {
                return Err(PadError::Config(format!(
                    "LED of button {}: interval and timeout must be positive",
                    slot.button
                )));
            }
        }
    }

    Ok(())
}
