//! Wire shapes of the client-server endpoints this workspace talks to.
//!
//! Every field the client does not strictly need is optional or defaulted so a
//! homeserver adding fields, or omitting optional ones, never fails a sync.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{DeviceId, EventId, RoomId, RoomPreset, RoomVisibility, UserId};

pub const LOGIN_TYPE_PASSWORD: &str = "m.login.password";
pub const LOGIN_TYPE_DUMMY: &str = "m.login.dummy";
pub const IDENTIFIER_TYPE_USER: &str = "m.id.user";
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";
pub const HTML_FORMAT: &str = "org.matrix.custom.html";
pub const MSGTYPE_TEXT: &str = "m.text";
pub const SPACE_CHILD_EVENT: &str = "m.space.child";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub identifier: UserIdentifier,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

impl LoginRequest {
    pub fn password(
        username: impl Into<String>,
        password: impl Into<String>,
        device_id: Option<DeviceId>,
    ) -> Self {
        Self {
            kind: LOGIN_TYPE_PASSWORD.to_string(),
            identifier: UserIdentifier {
                kind: IDENTIFIER_TYPE_USER.to_string(),
                user: username.into(),
            },
            password: password.into(),
            device_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthData {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub auth: AuthData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

/// Response of both `/login` and `/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub user_id: UserId,
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_server: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Rooms,
}

/// Rooms keyed by id. The ordered map fixes the enumeration order of a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<RoomId, JoinedRoomPayload>,
    #[serde(default)]
    pub invite: BTreeMap<RoomId, InvitedRoomPayload>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedRoomPayload {
    #[serde(default)]
    pub timeline: TimelinePayload,
    #[serde(default)]
    pub state: EventList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_notifications: Option<UnreadNotifications>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelinePayload {
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UnreadNotifications {
    #[serde(default)]
    pub notification_count: u64,
    #[serde(default)]
    pub highlight_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvitedRoomPayload {
    #[serde(default)]
    pub invite_state: EventList,
}

/// A timeline or stripped-state event as sent by the server.
///
/// Stripped state (invites) carries no `event_id` or timestamp, hence the options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(rename = "m.in_reply_to")]
    pub in_reply_to: InReplyTo,
}

/// `m.room.message` content, both inbound and outbound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(
        rename = "m.relates_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub relates_to: Option<RelatesTo>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: MSGTYPE_TEXT.to_string(),
            body: body.into(),
            format: None,
            formatted_body: None,
            relates_to: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMarkersRequest {
    #[serde(rename = "m.fully_read")]
    pub fully_read: EventId,
    #[serde(rename = "m.read", default, skip_serializing_if = "Option::is_none")]
    pub read: Option<EventId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_alias_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<RoomPreset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<RoomVisibility>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invite: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_content: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomIdResponse {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventIdResponse {
    pub event_id: EventId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub is_guest: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomMemberProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedMembersResponse {
    #[serde(default)]
    pub joined: BTreeMap<UserId, RoomMemberProfile>,
}

/// Pagination direction of `/rooms/{room}/messages`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    Forward,
    #[default]
    Backward,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "f",
            Self::Backward => "b",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub chunk: Vec<RawEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

/// `m.space.child` state content linking a room into a space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceChildContent {
    pub via: Vec<String>,
    #[serde(default)]
    pub suggested: bool,
    #[serde(default)]
    pub auto_join: bool,
}

impl SpaceChildContent {
    pub fn via<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            via: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}
