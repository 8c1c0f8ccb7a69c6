use std::{
    fmt, fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use shared::domain::DeviceId;
use url::Url;

use crate::{
    error::ConfigError,
    session::{SessionMode, SessionRequest},
    tracker::DEFAULT_SEEN_CAPACITY,
    transport::{DEFAULT_API_PATH, DEFAULT_REQUEST_TIMEOUT},
    SyncOptions,
};

pub const DEFAULT_CONFIG_FILE: &str = "bot.toml";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ClientConfig {
    pub homeserver: String,
    pub username: String,
    pub password: String,
    pub device_id: Option<String>,
    pub register: bool,
    pub poll_interval: Duration,
    /// Per-category seen-tracker bound; `0` disables eviction.
    pub seen_capacity: usize,
    pub handler_timeout: Option<Duration>,
    /// Per-request HTTP bound; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub api_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            homeserver: "http://localhost:8008".into(),
            username: String::new(),
            password: String::new(),
            device_id: None,
            register: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            handler_timeout: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            api_path: DEFAULT_API_PATH.into(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("homeserver", &self.homeserver)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("register", &self.register)
            .field("poll_interval", &self.poll_interval)
            .field("seen_capacity", &self.seen_capacity)
            .field("handler_timeout", &self.handler_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("api_path", &self.api_path)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    homeserver: Option<String>,
    username: Option<String>,
    password: Option<String>,
    device_id: Option<String>,
    register: Option<bool>,
    poll_interval_ms: Option<u64>,
    seen_capacity: Option<usize>,
    handler_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    api_path: Option<String>,
}

/// Defaults, then the TOML file, then environment overrides.
///
/// An explicit `path` must exist; without one, `bot.toml` in the working
/// directory is read when present.
pub fn load_settings(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let mut settings = ClientConfig::default();

    match path {
        Some(path) => settings.apply_file(path)?,
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if fallback.is_file() {
                settings.apply_file(fallback)?;
            }
        }
    }

    settings.apply_env()?;
    Ok(settings)
}

impl ClientConfig {
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.apply_toml(&raw, path)
    }

    pub fn apply_toml(&mut self, raw: &str, origin: &Path) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(raw).map_err(|source| ConfigError::Toml {
            path: PathBuf::from(origin),
            source,
        })?;

        if let Some(v) = file.homeserver {
            self.homeserver = v;
        }
        if let Some(v) = file.username {
            self.username = v;
        }
        if let Some(v) = file.password {
            self.password = v;
        }
        if let Some(v) = file.device_id {
            self.device_id = non_empty(v);
        }
        if let Some(v) = file.register {
            self.register = v;
        }
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.seen_capacity {
            self.seen_capacity = v;
        }
        if let Some(v) = file.handler_timeout_ms {
            self.handler_timeout = timeout_from_millis(v);
        }
        if let Some(v) = file.request_timeout_ms {
            self.request_timeout = timeout_from_millis(v);
        }
        if let Some(v) = file.api_path {
            self.api_path = v;
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MATRIX_HOMESERVER") {
            self.homeserver = v;
        }
        if let Some(v) = lookup("MATRIX_USERNAME") {
            self.username = v;
        }
        if let Some(v) = lookup("MATRIX_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = lookup("MATRIX_DEVICE_ID") {
            self.device_id = non_empty(v);
        }

        if let Some(v) = lookup("APP__POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(parse_number("APP__POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("APP__SEEN_CAPACITY") {
            self.seen_capacity = parse_number("APP__SEEN_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("APP__HANDLER_TIMEOUT_MS") {
            self.handler_timeout =
                timeout_from_millis(parse_number("APP__HANDLER_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("APP__REQUEST_TIMEOUT_MS") {
            self.request_timeout =
                timeout_from_millis(parse_number("APP__REQUEST_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("APP__API_PATH") {
            self.api_path = v;
        }
        Ok(())
    }

    /// Checks the settings and returns the parsed homeserver URL.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let homeserver = self.homeserver_url()?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::Missing("username"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("password"));
        }
        Ok(homeserver)
    }

    pub fn homeserver_url(&self) -> Result<Url, ConfigError> {
        let raw = self.homeserver.trim();
        let invalid = |reason: &str| ConfigError::Homeserver {
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(url)
    }

    pub fn session_request(&self) -> SessionRequest {
        let mode = if self.register {
            SessionMode::Register
        } else {
            SessionMode::Login
        };
        SessionRequest::login(self.username.clone(), self.password.clone())
            .with_device_id(self.device_id.clone().map(DeviceId::new))
            .with_mode(mode)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            poll_interval: self.poll_interval,
            seen_capacity: NonZeroUsize::new(self.seen_capacity),
            handler_timeout: self.handler_timeout,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidNumber {
            name,
            value: value.to_string(),
        })
}

fn timeout_from_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
