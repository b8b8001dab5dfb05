use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::viewport::{GestureSettings, VIEWPORT_MAX_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigPathError {
    #[error("neither XDG_CONFIG_HOME nor HOME is set")]
    MissingHomeDirectory,
}

const APP_DIR: &str = "fogsync";
const APP_CONFIG_FILE: &str = "config.json";

/// Which side of the table this client renders for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Player,
    Dm,
}

/// Session settings from `config.json`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub authorization: Option<String>,
    pub role: Role,
    pub press_hold_ms: u64,
    pub token_persist_debounce_ms: u64,
    pub marker_display_ms: u64,
    pub min_scale: f64,
    pub pinch_wheel_divisor: f64,
    pub pinch_drag_cooldown_ms: u64,
    pub fit_ratio: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            authorization: None,
            role: Role::Player,
            press_hold_ms: 200,
            token_persist_debounce_ms: 100,
            marker_display_ms: 1250,
            min_scale: 0.1,
            pinch_wheel_divisor: 100.0,
            pinch_drag_cooldown_ms: 100,
            fit_ratio: 0.95,
        }
    }
}

impl SessionConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.token_persist_debounce_ms)
    }

    pub fn marker_lifetime(&self) -> Duration {
        Duration::from_millis(self.marker_display_ms)
    }

    pub fn gesture_settings(&self) -> GestureSettings {
        let defaults = GestureSettings::default();
        GestureSettings {
            press_hold: Duration::from_millis(self.press_hold_ms),
            min_scale: self.effective_min_scale(defaults.min_scale),
            wheel_divisor: positive_or(self.pinch_wheel_divisor, defaults.wheel_divisor),
            drag_cooldown: Duration::from_millis(self.pinch_drag_cooldown_ms),
            ..defaults
        }
    }

    /// Lower zoom bound, kept inside `(0, VIEWPORT_MAX_SCALE]`.
    fn effective_min_scale(&self, fallback: f64) -> f64 {
        if self.min_scale.is_finite() && self.min_scale > VIEWPORT_MAX_SCALE {
            tracing::warn!(
                min_scale = self.min_scale,
                max_scale = VIEWPORT_MAX_SCALE,
                "min_scale above the zoom limit; using default"
            );
            return fallback;
        }
        positive_or(self.min_scale, fallback)
    }

    /// Fraction of the viewport the image fills, kept inside `(0, 1]`.
    pub fn effective_fit_ratio(&self) -> f64 {
        if self.fit_ratio.is_finite() && self.fit_ratio > 0.0 {
            self.fit_ratio.min(1.0)
        } else {
            Self::default().fit_ratio
        }
    }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

pub fn load_session_config() -> SessionConfig {
    let (xdg_config_home, home) = config_env_dirs();
    load_session_config_with(xdg_config_home.as_deref(), home.as_deref())
}

fn load_session_config_with(xdg_config_home: Option<&Path>, home: Option<&Path>) -> SessionConfig {
    match app_config_path(APP_DIR, APP_CONFIG_FILE, xdg_config_home, home) {
        Ok(path) => load_session_config_from(&path),
        Err(err) => {
            tracing::warn!(%err, "no config directory; using defaults");
            SessionConfig::default()
        }
    }
}

/// Reads `path`, falling back to defaults when it is missing or invalid.
pub fn load_session_config_from(path: &Path) -> SessionConfig {
    if !path.exists() {
        return SessionConfig::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
            tracing::warn!(?err, ?path, "failed to parse config.json; using defaults");
            SessionConfig::default()
        }),
        Err(err) => {
            tracing::warn!(?err, ?path, "failed to read config.json; using defaults");
            SessionConfig::default()
        }
    }
}

pub(crate) fn config_env_dirs() -> (Option<PathBuf>, Option<PathBuf>) {
    (
        std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
        std::env::var_os("HOME").map(PathBuf::from),
    )
}

pub(crate) fn app_config_path(
    app_dir: &str,
    file_name: &str,
    xdg_config_home: Option<&Path>,
    home: Option<&Path>,
) -> Result<PathBuf, ConfigPathError> {
    let mut path = config_root(xdg_config_home, home)?;
    path.push(app_dir);
    path.push(file_name);
    Ok(path)
}

fn config_root(
    xdg_config_home: Option<&Path>,
    home: Option<&Path>,
) -> Result<PathBuf, ConfigPathError> {
    if let Some(xdg) = xdg_config_home.filter(|path| !path.as_os_str().is_empty()) {
        return Ok(xdg.to_path_buf());
    }

    let home = home.ok_or(ConfigPathError::MissingHomeDirectory)?;
    Ok(home.join(".config"))
}
