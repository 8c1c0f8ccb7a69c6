//! Fakes and builders shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::DateTime;
use shared::{
    domain::{DeviceId, EventId, EventKind, RoomId, UserId},
    protocol::{JoinedMembersResponse, MessageContent, RoomMemberProfile},
};
use tokio::sync::Notify;

use crate::{
    dispatch::{EventHandler, Invite, Message, ReadyContext},
    error::{AuthError, ParseError, SyncError, TransportError},
    session::SessionRequest,
    transport::{Authenticator, ReplyTarget, RoomActions, SnapshotSource},
    types::{Credential, Event, JoinedRoom, PendingInvite, Snapshot},
};

pub(crate) const BOT: &str = "@bot:hs.test";

pub(crate) fn credential() -> Credential {
    Credential::new(
        "secret-token",
        UserId::from(BOT),
        DeviceId::from("BOTDEVICE"),
        "http://hs.test",
    )
}

pub(crate) fn session_request() -> SessionRequest {
    SessionRequest::login("bot", "hunter2")
}

pub(crate) fn message(room_id: &str, event_id: &str, sender: &str, body: &str) -> Event {
    Event {
        event_id: EventId::from(event_id),
        kind: EventKind::Message,
        room_id: RoomId::from(room_id),
        sender: UserId::from(sender),
        timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default(),
        message: Some(MessageContent::text(body)),
    }
}

pub(crate) fn member_event(room_id: &str, event_id: &str, sender: &str) -> Event {
    Event {
        kind: EventKind::Member,
        message: None,
        ..message(room_id, event_id, sender, "")
    }
}

pub(crate) fn room(room_id: &str, timeline: Vec<Event>) -> JoinedRoom {
    JoinedRoom {
        room_id: RoomId::from(room_id),
        timeline,
        limited: false,
        encrypted: false,
    }
}

pub(crate) fn invite(room_id: &str, inviter: &str) -> PendingInvite {
    PendingInvite {
        room_id: RoomId::from(room_id),
        inviter: Some(UserId::from(inviter)),
        created_at: None,
    }
}

pub(crate) fn snapshot(joined_rooms: Vec<JoinedRoom>, invites: Vec<PendingInvite>) -> Snapshot {
    Snapshot {
        next_batch: "s0".to_string(),
        joined_rooms,
        invites,
    }
}

/// Five historical messages across two rooms plus two pending invites.
pub(crate) fn baseline() -> Snapshot {
    snapshot(
        vec![
            room(
                "!lobby:hs.test",
                vec![
                    message("!lobby:hs.test", "$m1", "@alice:hs.test", "one"),
                    message("!lobby:hs.test", "$m2", "@bob:hs.test", "two"),
                    member_event("!lobby:hs.test", "$join", "@carol:hs.test"),
                    message("!lobby:hs.test", "$m3", "@alice:hs.test", "three"),
                ],
            ),
            room(
                "!ops:hs.test",
                vec![
                    message("!ops:hs.test", "$m4", "@dave:hs.test", "four"),
                    message("!ops:hs.test", "$m5", BOT, "five"),
                ],
            ),
        ],
        vec![
            invite("!party:hs.test", "@erin:hs.test"),
            invite("!quiet:hs.test", "@frank:hs.test"),
        ],
    )
}

/// `base` with `extra` appended to the timeline of its first room.
pub(crate) fn with_messages(base: &Snapshot, extra: Vec<Event>) -> Snapshot {
    let mut next = base.clone();
    if let Some(first) = next.joined_rooms.first_mut() {
        first.timeline.extend(extra);
    }
    next
}

pub(crate) enum Step {
    Snapshot(Snapshot),
    TransportFailure,
    ParseFailure,
}

/// Replays scripted poll results, then keeps returning the last snapshot.
pub(crate) struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Snapshot>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(Snapshot::default()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch_snapshot(&self, _credential: &Credential) -> Result<Snapshot, SyncError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().expect("steps lock").pop_front();
        match step {
            Some(Step::Snapshot(snapshot)) => {
                *self.last.lock().expect("last lock") = snapshot.clone();
                Ok(snapshot)
            }
            Some(Step::TransportFailure) => Err(TransportError::Status {
                endpoint: "GET /_matrix/client/v3/sync".to_string(),
                status: 502,
                errcode: String::new(),
                error: "bad gateway".to_string(),
            }
            .into()),
            Some(Step::ParseFailure) => Err(ParseError::MissingField {
                room_id: RoomId::from("!broken:hs.test"),
                field: "event_id",
            }
            .into()),
            None => Ok(self.last.lock().expect("last lock").clone()),
        }
    }
}

pub(crate) struct StaticAuthenticator {
    reject: bool,
    calls: AtomicUsize,
}

impl StaticAuthenticator {
    pub(crate) fn accepting() -> Self {
        Self {
            reject: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn rejecting() -> Self {
        Self {
            reject: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, _request: &SessionRequest) -> Result<Credential, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(AuthError::Rejected(TransportError::Status {
                endpoint: "POST /_matrix/client/v3/login".to_string(),
                status: 403,
                errcode: "M_FORBIDDEN".to_string(),
                error: "Invalid username or password".to_string(),
            }));
        }
        Ok(credential())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    Accept(RoomId),
    Decline(RoomId),
    Send(RoomId, String),
    Reply(RoomId, EventId, String),
    Invite(RoomId, UserId),
}

#[derive(Default)]
pub(crate) struct RecordingActions {
    actions: Mutex<Vec<Action>>,
}

impl RecordingActions {
    pub(crate) fn actions(&self) -> Vec<Action> {
        self.actions.lock().expect("actions lock").clone()
    }

    fn record(&self, action: Action) {
        self.actions.lock().expect("actions lock").push(action);
    }
}

#[async_trait]
impl RoomActions for RecordingActions {
    async fn accept_invite(
        &self,
        room_id: &RoomId,
        _reason: Option<&str>,
    ) -> Result<RoomId, TransportError> {
        self.record(Action::Accept(room_id.clone()));
        Ok(room_id.clone())
    }

    async fn decline_invite(&self, room_id: &RoomId) -> Result<(), TransportError> {
        self.record(Action::Decline(room_id.clone()));
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &RoomId,
        content: MessageContent,
    ) -> Result<EventId, TransportError> {
        self.record(Action::Send(room_id.clone(), content.body));
        Ok(EventId::from("$sent"))
    }

    async fn reply(
        &self,
        room_id: &RoomId,
        in_reply_to: &ReplyTarget,
        body: &str,
    ) -> Result<EventId, TransportError> {
        self.record(Action::Reply(
            room_id.clone(),
            in_reply_to.event_id.clone(),
            body.to_string(),
        ));
        Ok(EventId::from("$reply"))
    }

    async fn invite_user(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<(), TransportError> {
        self.record(Action::Invite(room_id.clone(), user_id.clone()));
        Ok(())
    }

    /// The bot and one other member, whatever the room.
    async fn joined_members(
        &self,
        _room_id: &RoomId,
    ) -> Result<JoinedMembersResponse, TransportError> {
        let mut members = JoinedMembersResponse::default();
        for user in [BOT, "@alice:hs.test"] {
            members
                .joined
                .insert(UserId::from(user), RoomMemberProfile::default());
        }
        Ok(members)
    }
}

/// Records every callback. Can be told to fail, panic or block on given items.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    ready: AtomicUsize,
    messages: Mutex<Vec<Message>>,
    invites: Mutex<Vec<Invite>>,
    failing: Vec<EventId>,
    panicking: Vec<EventId>,
    gate: Option<Arc<Notify>>,
    ready_gate: Option<Arc<Notify>>,
    stall: Option<Duration>,
}

impl RecordingHandler {
    pub(crate) fn failing_on(mut self, event_ids: &[&str]) -> Self {
        self.failing = event_ids.iter().map(|id| EventId::from(*id)).collect();
        self
    }

    pub(crate) fn panicking_on(mut self, event_ids: &[&str]) -> Self {
        self.panicking = event_ids.iter().map(|id| EventId::from(*id)).collect();
        self
    }

    /// Every `on_message` waits for one permit on `gate` before recording.
    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// `on_ready` waits for one permit on `gate` before counting itself.
    pub(crate) fn ready_gated(mut self, gate: Arc<Notify>) -> Self {
        self.ready_gate = Some(gate);
        self
    }

    /// Every `on_message` sleeps this long before recording.
    pub(crate) fn stalling(mut self, delay: Duration) -> Self {
        self.stall = Some(delay);
        self
    }

    pub(crate) fn ready_calls(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn message_ids(&self) -> Vec<String> {
        self.messages
            .lock()
            .expect("messages lock")
            .iter()
            .map(|message| message.event_id.to_string())
            .collect()
    }

    pub(crate) fn messages(&self) -> Vec<Message> {
        self.messages.lock().expect("messages lock").clone()
    }

    pub(crate) fn invite_rooms(&self) -> Vec<String> {
        self.invites
            .lock()
            .expect("invites lock")
            .iter()
            .map(|invite| invite.room_id.to_string())
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_ready(&self, _ctx: ReadyContext) -> anyhow::Result<()> {
        if let Some(gate) = &self.ready_gate {
            gate.notified().await;
        }
        self.ready.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_message(&self, message: Message) -> anyhow::Result<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.stall {
            tokio::time::sleep(delay).await;
        }
        let event_id = message.event_id.clone();
        self.messages.lock().expect("messages lock").push(message);
        if self.panicking.contains(&event_id) {
            panic!("handler blew up on {event_id}");
        }
        if self.failing.contains(&event_id) {
            return Err(anyhow!("handler rejected {event_id}"));
        }
        Ok(())
    }

    async fn on_invite(&self, invite: Invite) -> anyhow::Result<()> {
        self.invites.lock().expect("invites lock").push(invite);
        Ok(())
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
