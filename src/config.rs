use crate::auth::RotationGate;
use crate::constants::Model;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const ENV_DATA_DIR: &str = "GEMINI_WEB_DIR";
pub const ENV_AUTO_CLOSE: &str = "GEMINI_WEB_AUTO_CLOSE";
pub const ENV_CLOSE_DELAY: &str = "GEMINI_WEB_CLOSE_DELAY";
pub const ENV_REFRESH_INTERVAL: &str = "GEMINI_WEB_REFRESH_INTERVAL";
pub const ENV_BROWSER: &str = "GEMINI_WEB_BROWSER";
pub const ENV_MODEL: &str = "GEMINI_WEB_MODEL";

const DATA_DIR_NAME: &str = ".gemini_web";
const DEFAULT_CLOSE_DELAY: Duration = Duration::from_secs(300);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(540);

#[derive(Clone)]
pub struct ClientConfig {
    /// Close the client after `close_delay` without network activity.
    pub auto_close: bool,
    pub close_delay: Duration,
    /// Keep the rotation token fresh in the background.
    pub auto_refresh: bool,
    pub refresh_interval: Duration,
    /// Re-run init transparently when an operation hits a closed client.
    pub auto_reinit: bool,
    /// Browser to re-extract cookies from; arms the one-shot 401 retry.
    pub browser: Option<String>,
    pub model: Model,
    pub rotation_gate: Arc<RotationGate>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_close: false,
            close_delay: DEFAULT_CLOSE_DELAY,
            auto_refresh: true,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            auto_reinit: true,
            browser: None,
            model: Model::Unspecified,
            rotation_gate: RotationGate::shared(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("auto_close", &self.auto_close)
            .field("close_delay", &self.close_delay)
            .field("auto_refresh", &self.auto_refresh)
            .field("refresh_interval", &self.refresh_interval)
            .field("auto_reinit", &self.auto_reinit)
            .field("browser", &self.browser)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Defaults with `GEMINI_WEB_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(|name| env::var(name).ok());
        config
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(value) = lookup(ENV_AUTO_CLOSE) {
            match parse_bool(&value) {
                Some(flag) => self.auto_close = flag,
                None => tracing::warn!("ignoring {ENV_AUTO_CLOSE}={value}: expected a boolean"),
            }
        }
        if let Some(value) = lookup(ENV_CLOSE_DELAY) {
            match value.parse::<u64>() {
                Ok(secs) => self.close_delay = Duration::from_secs(secs),
                Err(_) => tracing::warn!("ignoring {ENV_CLOSE_DELAY}={value}: expected seconds"),
            }
        }
        if let Some(value) = lookup(ENV_REFRESH_INTERVAL) {
            match value.parse::<u64>() {
                Ok(secs) => self.refresh_interval = Duration::from_secs(secs),
                Err(_) => {
                    tracing::warn!("ignoring {ENV_REFRESH_INTERVAL}={value}: expected seconds")
                }
            }
        }
        if let Some(value) = lookup(ENV_BROWSER) {
            self.browser = Some(value);
        }
        if let Some(value) = lookup(ENV_MODEL) {
            match Model::from_name(&value) {
                Some(model) => self.model = model,
                None => tracing::warn!("ignoring {ENV_MODEL}={value}: unknown model"),
            }
        }
    }

    pub fn with_auto_close(mut self, close_delay: Duration) -> Self {
        self.auto_close = true;
        self.close_delay = close_delay;
        self
    }

    pub fn with_auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_auto_reinit(mut self, enabled: bool) -> Self {
        self.auto_reinit = enabled;
        self
    }

    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self
    }

    pub fn with_model(mut self, model: Model) -> Self {
        self.model = model;
        self
    }

    pub fn with_rotation_gate(mut self, gate: Arc<RotationGate>) -> Self {
        self.rotation_gate = gate;
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn data_dir() -> PathBuf {
    if let Ok(dir) = env::var(ENV_DATA_DIR) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    home_dir().join(DATA_DIR_NAME)
}

/// Default location of the JSON cookie cache.
pub fn cookie_cache_path() -> PathBuf {
    data_dir().join("cookies.json")
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
