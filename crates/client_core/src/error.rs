use std::{path::PathBuf, time::Duration};

use shared::{
    domain::{EventId, RoomId},
    error::ErrorCode,
};
use thiserror::Error;

/// Failure of a single request/response exchange with the homeserver.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}: {errcode} {error}")]
    Status {
        endpoint: String,
        status: u16,
        errcode: String,
        error: String,
    },
    #[error("unexpected response body from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("homeserver url cannot carry a path: {0}")]
    InvalidBaseUrl(String),
    #[error("not authenticated: call authenticate before issuing room actions")]
    NotAuthenticated,
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn errcode(&self) -> Option<ErrorCode> {
        match self {
            Self::Status { errcode, .. } => Some(ErrorCode::parse(errcode)),
            _ => None,
        }
    }

    /// True when the server refused the credential rather than the request.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
            || self.errcode().is_some_and(|code| code.is_auth_failure())
    }
}

/// A fetched payload that could not be turned into a snapshot.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON from {endpoint}: {source}")]
    Json {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("timeline event in room {room_id} is missing `{field}`")]
    MissingField {
        room_id: RoomId,
        field: &'static str,
    },
    #[error("event {event_id} has out-of-range timestamp {millis}")]
    InvalidTimestamp { event_id: EventId, millis: i64 },
}

/// Why one poll produced no snapshot. Both variants are transient.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("homeserver rejected the credentials: {0}")]
    Rejected(#[source] TransportError),
    #[error("login request failed: {0}")]
    Transport(#[source] TransportError),
    #[error("malformed login response: {0}")]
    Malformed(#[source] TransportError),
}

impl From<TransportError> for AuthError {
    fn from(value: TransportError) -> Self {
        match value {
            decode @ TransportError::Decode { .. } => Self::Malformed(decode),
            other if other.is_auth_failure() => Self::Rejected(other),
            other => Self::Transport(other),
        }
    }
}

/// A user handler invocation that did not complete normally.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler returned an error: {0:#}")]
    Failed(anyhow::Error),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler did not finish within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("client was already started; a client runs at most once")]
    AlreadyStarted,
    #[error("dispatch worker terminated abnormally: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file '{}': {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid homeserver url '{value}': {reason}")]
    Homeserver { value: String, reason: String },
    #[error("{name} must be a non-negative integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
}
