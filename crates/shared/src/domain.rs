use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(DeviceId);
id_newtype!(RoomId);
id_newtype!(EventId);

/// Event types the client distinguishes. Anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Member,
    Encrypted,
    Encryption,
    Other(String),
}

impl EventKind {
    pub const MESSAGE: &'static str = "m.room.message";
    pub const MEMBER: &'static str = "m.room.member";
    pub const ENCRYPTED: &'static str = "m.room.encrypted";
    pub const ENCRYPTION: &'static str = "m.room.encryption";

    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            Self::MESSAGE => Self::Message,
            Self::MEMBER => Self::Member,
            Self::ENCRYPTED => Self::Encrypted,
            Self::ENCRYPTION => Self::Encryption,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_type(&self) -> &str {
        match self {
            Self::Message => Self::MESSAGE,
            Self::Member => Self::MEMBER,
            Self::Encrypted => Self::ENCRYPTED,
            Self::Encryption => Self::ENCRYPTION,
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_type())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPreset {
    PrivateChat,
    TrustedPrivateChat,
    PublicChat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomVisibility {
    Public,
    Private,
}
