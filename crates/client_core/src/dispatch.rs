//! Delivery of reconciled items to user handlers.
//!
//! Messages and invites flow through two independent workers, each strictly
//! sequential, so a slow message handler never holds back invites or the
//! poller. Every handler call is isolated: errors, panics and (optionally)
//! timeouts are reported and the batch carries on.

use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use shared::{
    domain::{DeviceId, EventId, RoomId, UserId},
    protocol::{JoinedMembersResponse, MessageContent},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    error::{HandlerError, TransportError},
    tracker::Category,
    transport::{ReplyTarget, RoomActions},
    types::{Event, PendingInvite},
    ClientEvent,
};

/// Application callbacks. Every method defaults to a no-op, so implementors
/// override only what they need.
///
/// `on_message` and `on_invite` run on different tasks and may overlap with
/// each other, but neither is ever invoked concurrently with itself.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn on_ready(&self, _ctx: ReadyContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_message(&self, _message: Message) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_invite(&self, _invite: Invite) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopHandler;

impl EventHandler for NoopHandler {}

/// Passed to `on_ready` once priming has completed.
#[derive(Clone)]
pub struct ReadyContext {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub joined_rooms: usize,
    pub pending_invites: usize,
    actions: Arc<dyn RoomActions>,
}

impl ReadyContext {
    pub fn actions(&self) -> &dyn RoomActions {
        self.actions.as_ref()
    }
}

impl fmt::Debug for ReadyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyContext")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("joined_rooms", &self.joined_rooms)
            .field("pending_invites", &self.pending_invites)
            .finish_non_exhaustive()
    }
}

/// A newly arrived room message, with enough context to answer it.
#[derive(Clone)]
pub struct Message {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub author: UserId,
    pub body: String,
    pub msgtype: String,
    pub format: Option<String>,
    pub formatted_body: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Sent by the account this client is logged in as.
    pub is_own: bool,
    actions: Arc<dyn RoomActions>,
}

impl Message {
    fn from_event(event: Event, own_user: &UserId, actions: Arc<dyn RoomActions>) -> Self {
        let content = event.message.unwrap_or_default();
        Self {
            is_own: &event.sender == own_user,
            event_id: event.event_id,
            room_id: event.room_id,
            author: event.sender,
            body: content.body,
            msgtype: content.msgtype,
            format: content.format,
            formatted_body: content.formatted_body,
            created_at: event.timestamp,
            actions,
        }
    }

    /// Replies in the same room, quoting this message.
    pub async fn reply(&self, body: &str) -> Result<EventId, TransportError> {
        let target = ReplyTarget {
            event_id: self.event_id.clone(),
            sender: self.author.clone(),
            body: self.body.clone(),
        };
        self.actions.reply(&self.room_id, &target, body).await
    }

    /// Sends a plain text message to the room this message arrived in.
    pub async fn send(&self, body: &str) -> Result<EventId, TransportError> {
        self.actions
            .send_message(&self.room_id, MessageContent::text(body))
            .await
    }

    /// Invites `user_id` into the room this message arrived in.
    pub async fn invite(&self, user_id: &UserId) -> Result<(), TransportError> {
        self.actions.invite_user(&self.room_id, user_id).await
    }

    /// Currently joined members of this message's room.
    pub async fn members(&self) -> Result<JoinedMembersResponse, TransportError> {
        self.actions.joined_members(&self.room_id).await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("event_id", &self.event_id)
            .field("room_id", &self.room_id)
            .field("author", &self.author)
            .field("body", &self.body)
            .field("msgtype", &self.msgtype)
            .field("created_at", &self.created_at)
            .field("is_own", &self.is_own)
            .finish_non_exhaustive()
    }
}

/// A newly arrived room invite.
#[derive(Clone)]
pub struct Invite {
    pub room_id: RoomId,
    pub inviter: Option<UserId>,
    pub created_at: Option<DateTime<Utc>>,
    actions: Arc<dyn RoomActions>,
}

impl Invite {
    fn from_pending(invite: PendingInvite, actions: Arc<dyn RoomActions>) -> Self {
        Self {
            room_id: invite.room_id,
            inviter: invite.inviter,
            created_at: invite.created_at,
            actions,
        }
    }

    pub async fn accept(&self, reason: Option<&str>) -> Result<RoomId, TransportError> {
        self.actions.accept_invite(&self.room_id, reason).await
    }

    pub async fn decline(&self) -> Result<(), TransportError> {
        self.actions.decline_invite(&self.room_id).await
    }

    /// Sends a message into the invited room; only meaningful once accepted.
    pub async fn send(&self, body: &str) -> Result<EventId, TransportError> {
        self.actions
            .send_message(&self.room_id, MessageContent::text(body))
            .await
    }
}

impl fmt::Debug for Invite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invite")
            .field("room_id", &self.room_id)
            .field("inviter", &self.inviter)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Items dropped because a stop was requested mid-batch.
    pub skipped: usize,
}

pub struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    actions: Arc<dyn RoomActions>,
    own_user: UserId,
    handler_timeout: Option<Duration>,
    stop: watch::Receiver<bool>,
    events: broadcast::Sender<ClientEvent>,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        actions: Arc<dyn RoomActions>,
        own_user: UserId,
        stop: watch::Receiver<bool>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            handler,
            actions,
            own_user,
            handler_timeout: None,
            stop,
            events,
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    pub async fn dispatch_ready(&self, ctx: ReadyContext) -> Result<(), HandlerError> {
        let outcome = self.invoke(self.handler.on_ready(ctx)).await;
        if let Err(err) = &outcome {
            warn!("ready handler failed: {err}");
            let _ = self.events.send(ClientEvent::HandlerFailed {
                category: None,
                item: "ready".to_string(),
                error: err.to_string(),
            });
        }
        outcome
    }

    pub async fn dispatch_messages(&self, messages: Vec<Event>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let total = messages.len();
        for (index, event) in messages.into_iter().enumerate() {
            if self.stop_requested() {
                report.skipped = total - index;
                debug!(skipped = report.skipped, "stop requested; dropping queued messages");
                break;
            }
            let event_id = event.event_id.clone();
            let room_id = event.room_id.clone();
            let message = Message::from_event(event, &self.own_user, Arc::clone(&self.actions));
            match self.invoke(self.handler.on_message(message)).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(room_id = %room_id, event_id = %event_id, "message handler failed: {err}");
                    let _ = self.events.send(ClientEvent::HandlerFailed {
                        category: Some(Category::Message),
                        item: event_id.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    pub async fn dispatch_invites(&self, invites: Vec<PendingInvite>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let total = invites.len();
        for (index, pending) in invites.into_iter().enumerate() {
            if self.stop_requested() {
                report.skipped = total - index;
                debug!(skipped = report.skipped, "stop requested; dropping queued invites");
                break;
            }
            let key = pending.key();
            let invite = Invite::from_pending(pending, Arc::clone(&self.actions));
            match self.invoke(self.handler.on_invite(invite)).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(invite = %key, "invite handler failed: {err}");
                    let _ = self.events.send(ClientEvent::HandlerFailed {
                        category: Some(Category::Invite),
                        item: key.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn invoke<F>(&self, call: F) -> Result<(), HandlerError>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let guarded = AssertUnwindSafe(call).catch_unwind();
        let outcome = match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| HandlerError::TimedOut(limit))?,
            None => guarded.await,
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(HandlerError::Failed(err)),
            Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Feeds message batches to the dispatcher one at a time until the sending
/// side closes.
pub fn spawn_message_worker(
    dispatcher: Arc<Dispatcher>,
    mut batches: mpsc::UnboundedReceiver<Vec<Event>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            let report = dispatcher.dispatch_messages(batch).await;
            debug!(
                delivered = report.delivered,
                failed = report.failed,
                skipped = report.skipped,
                "message batch dispatched"
            );
        }
    })
}

pub fn spawn_invite_worker(
    dispatcher: Arc<Dispatcher>,
    mut batches: mpsc::UnboundedReceiver<Vec<PendingInvite>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            let report = dispatcher.dispatch_invites(batch).await;
            debug!(
                delivered = report.delivered,
                failed = report.failed,
                skipped = report.skipped,
                "invite batch dispatched"
            );
        }
    })
}

pub(crate) fn ready_context(
    user_id: UserId,
    device_id: DeviceId,
    joined_rooms: usize,
    pending_invites: usize,
    actions: Arc<dyn RoomActions>,
) -> ReadyContext {
    ReadyContext {
        user_id,
        device_id,
        joined_rooms,
        pending_invites,
        actions,
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
