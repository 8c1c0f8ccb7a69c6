//! Conversion of `/sync` payloads into [`Snapshot`]s.
//!
//! A snapshot is built completely or not at all: any structural problem in one
//! room fails the whole conversion so a malformed poll is never half-applied.

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::{EventId, EventKind, RoomId},
    protocol::{
        InvitedRoomPayload, JoinedRoomPayload, MessageContent, MessagesResponse, RawEvent,
        SyncResponse, MEGOLM_ALGORITHM,
    },
};
use tracing::debug;

use crate::{
    error::ParseError,
    types::{Event, JoinedRoom, PendingInvite, RoomHistory, Snapshot},
};

pub fn parse_sync_body(endpoint: &str, body: &[u8]) -> Result<Snapshot, ParseError> {
    let response: SyncResponse =
        serde_json::from_slice(body).map_err(|source| ParseError::Json {
            endpoint: endpoint.to_string(),
            source,
        })?;
    snapshot_from_sync(response)
}

pub fn snapshot_from_sync(response: SyncResponse) -> Result<Snapshot, ParseError> {
    let joined_rooms = response
        .rooms
        .join
        .into_iter()
        .map(|(room_id, payload)| parse_joined_room(room_id, payload))
        .collect::<Result<Vec<_>, _>>()?;

    let invites = response
        .rooms
        .invite
        .into_iter()
        .map(|(room_id, payload)| parse_invite(room_id, payload))
        .collect();

    Ok(Snapshot {
        next_batch: response.next_batch,
        joined_rooms,
        invites,
    })
}

/// Converts a `/messages` page, keeping only events whose type is listed in
/// `only_types` (all of them when it is empty).
pub fn history_from_messages(
    room_id: &RoomId,
    response: MessagesResponse,
    only_types: &[String],
) -> Result<RoomHistory, ParseError> {
    let events = response
        .chunk
        .into_iter()
        .filter(|raw| only_types.is_empty() || only_types.contains(&raw.event_type))
        .map(|raw| parse_timeline_event(room_id, raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RoomHistory {
        events,
        start: response.start,
        end: response.end,
    })
}

fn parse_joined_room(
    room_id: RoomId,
    payload: JoinedRoomPayload,
) -> Result<JoinedRoom, ParseError> {
    let encrypted = payload
        .state
        .events
        .iter()
        .chain(payload.timeline.events.iter())
        .any(is_megolm_encryption_event);

    let timeline = payload
        .timeline
        .events
        .into_iter()
        .map(|raw| parse_timeline_event(&room_id, raw))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(JoinedRoom {
        room_id,
        timeline,
        limited: payload.timeline.limited,
        encrypted,
    })
}

fn parse_timeline_event(room_id: &RoomId, raw: RawEvent) -> Result<Event, ParseError> {
    let missing = |field| ParseError::MissingField {
        room_id: room_id.clone(),
        field,
    };
    let event_id = raw.event_id.ok_or_else(|| missing("event_id"))?;
    let sender = raw.sender.ok_or_else(|| missing("sender"))?;
    let millis = raw.origin_server_ts.ok_or_else(|| missing("origin_server_ts"))?;
    let timestamp = timestamp_from_millis(&event_id, millis)?;

    let kind = EventKind::from_type(&raw.event_type);
    let message = if kind == EventKind::Message {
        parse_message_content(&event_id, raw.content)
    } else {
        None
    };

    Ok(Event {
        event_id,
        kind,
        room_id: room_id.clone(),
        sender,
        timestamp,
        message,
    })
}

/// Redacted or odd message content is not a snapshot error; the event is kept
/// without a body.
fn parse_message_content(event_id: &EventId, content: Value) -> Option<MessageContent> {
    if !content.is_object() {
        return None;
    }
    match serde_json::from_value::<MessageContent>(content) {
        Ok(message) => Some(message),
        Err(err) => {
            debug!(event_id = %event_id, "ignoring unparseable message content: {err}");
            None
        }
    }
}

fn timestamp_from_millis(event_id: &EventId, millis: i64) -> Result<DateTime<Utc>, ParseError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| ParseError::InvalidTimestamp {
        event_id: event_id.clone(),
        millis,
    })
}

fn parse_invite(room_id: RoomId, payload: InvitedRoomPayload) -> PendingInvite {
    let invite_event = payload.invite_state.events.iter().find(|event| {
        event.event_type == EventKind::MEMBER
            && event.content.get("membership").and_then(Value::as_str) == Some("invite")
    });

    PendingInvite {
        room_id,
        inviter: invite_event.and_then(|event| event.sender.clone()),
        created_at: invite_event
            .and_then(|event| event.origin_server_ts)
            .and_then(DateTime::from_timestamp_millis),
    }
}

fn is_megolm_encryption_event(event: &RawEvent) -> bool {
    event.event_type == EventKind::ENCRYPTION
        && event.content.get("algorithm").and_then(Value::as_str) == Some(MEGOLM_ALGORITHM)
}

#[cfg(test)]
#[path = "tests/parse_tests.rs"]
mod tests;
