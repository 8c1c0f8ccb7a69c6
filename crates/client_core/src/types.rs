use std::fmt;

use chrono::{DateTime, Utc};
use shared::{
    domain::{DeviceId, EventId, EventKind, RoomId, UserId},
    protocol::MessageContent,
};
use zeroize::Zeroize;

/// Bearer credential obtained from the one-time session exchange.
///
/// Read-only after authentication and shared across the poller and both
/// dispatch workers. The token is wiped when the last owner drops it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub homeserver: String,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        user_id: UserId,
        device_id: DeviceId,
        homeserver: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            user_id,
            device_id,
            homeserver: homeserver.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("homeserver", &self.homeserver)
            .finish()
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.access_token.zeroize();
    }
}

/// Full account state returned by one poll. Superseded wholesale by the next one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub next_batch: String,
    pub joined_rooms: Vec<JoinedRoom>,
    pub invites: Vec<PendingInvite>,
}

impl Snapshot {
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.joined_rooms.iter().flat_map(|room| room.timeline.iter())
    }

    pub fn message_count(&self) -> usize {
        self.events().filter(|event| event.is_message()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRoom {
    pub room_id: RoomId,
    /// Server order; the only ordering the dispatcher preserves.
    pub timeline: Vec<Event>,
    /// The server truncated the timeline for this poll.
    pub limited: bool,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: EventId,
    pub kind: EventKind,
    pub room_id: RoomId,
    pub sender: UserId,
    pub timestamp: DateTime<Utc>,
    /// Parsed body for `m.room.message` events with well-formed content.
    pub message: Option<MessageContent>,
}

impl Event {
    pub fn is_message(&self) -> bool {
        self.kind == EventKind::Message
    }
}

/// One page of room history from `/rooms/{room}/messages`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomHistory {
    /// In the order requested: newest first when paginating backwards.
    pub events: Vec<Event>,
    pub start: Option<String>,
    /// Token for the next page; `None` once there is nothing further.
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingInvite {
    pub room_id: RoomId,
    /// Sender of the `invite` membership event, when the stripped state carries one.
    pub inviter: Option<UserId>,
    pub created_at: Option<DateTime<Utc>>,
}

impl PendingInvite {
    pub fn key(&self) -> InviteKey {
        InviteKey {
            room_id: self.room_id.clone(),
            inviter: self.inviter.clone(),
        }
    }
}

/// Effective identity of an invite; the protocol has no dedicated invite id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InviteKey {
    pub room_id: RoomId,
    pub inviter: Option<UserId>,
}

impl fmt::Display for InviteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inviter {
            Some(inviter) => write!(f, "{} from {}", self.room_id, inviter),
            None => write!(f, "{} from <unknown>", self.room_id),
        }
    }
}
