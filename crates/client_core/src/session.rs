use std::{fmt, sync::Arc};

use shared::domain::DeviceId;
use tracing::{error, info};
use zeroize::Zeroize;

use crate::{error::AuthError, transport::Authenticator, types::Credential};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    Login,
    /// Create the account first (`m.login.dummy` registration).
    Register,
}

/// Inputs of the one-time session exchange.
#[derive(Clone)]
pub struct SessionRequest {
    pub username: String,
    password: String,
    pub device_id: Option<DeviceId>,
    pub mode: SessionMode,
}

impl SessionRequest {
    pub fn login(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            device_id: None,
            mode: SessionMode::Login,
        }
    }

    pub fn with_device_id(mut self, device_id: Option<DeviceId>) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for SessionRequest {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Performs the single authentication of a client lifetime. There is no
/// retry: a rejected credential will not become valid by asking again.
pub async fn authenticate(
    authenticator: &dyn Authenticator,
    request: &SessionRequest,
) -> Result<Arc<Credential>, AuthError> {
    info!(username = %request.username, mode = ?request.mode, "authenticating");
    match authenticator.authenticate(request).await {
        Ok(credential) => {
            info!(
                user_id = %credential.user_id,
                device_id = %credential.device_id,
                "session established"
            );
            Ok(Arc::new(credential))
        }
        Err(err) => {
            error!(username = %request.username, "authentication failed: {err}");
            Err(err)
        }
    }
}
