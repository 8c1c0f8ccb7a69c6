use serde::{Deserialize, Serialize};

/// Standard `errcode` values returned by homeservers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Forbidden,
    UnknownToken,
    MissingToken,
    UserDeactivated,
    LimitExceeded,
    NotFound,
    BadJson,
    NotJson,
    Unknown,
    Other(String),
}

impl ErrorCode {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "M_FORBIDDEN" => Self::Forbidden,
            "M_UNKNOWN_TOKEN" => Self::UnknownToken,
            "M_MISSING_TOKEN" => Self::MissingToken,
            "M_USER_DEACTIVATED" => Self::UserDeactivated,
            "M_LIMIT_EXCEEDED" => Self::LimitExceeded,
            "M_NOT_FOUND" => Self::NotFound,
            "M_BAD_JSON" => Self::BadJson,
            "M_NOT_JSON" => Self::NotJson,
            "M_UNKNOWN" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }

    /// Codes that mean the credential itself is unusable.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Forbidden | Self::UnknownToken | Self::MissingToken | Self::UserDeactivated
        )
    }
}

/// Error body of a non-2xx homeserver response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}

impl ApiError {
    pub fn new(errcode: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            errcode: errcode.into(),
            error: error.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::parse(&self.errcode)
    }
}
