//! Long-polling homeserver client.
//!
//! [`SyncClient`] authenticates once, records the first snapshot as a
//! baseline without delivering it, then polls on a fixed delay and hands
//! every message and invite it has not seen before to an [`EventHandler`].

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use shared::domain::UserId;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

pub mod config;
pub mod dispatch;
pub mod error;
pub mod parse;
pub mod poll;
pub mod reconcile;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{load_settings, ClientConfig};
pub use dispatch::{
    DispatchReport, Dispatcher, EventHandler, Invite, Message, NoopHandler, ReadyContext,
};
pub use error::{
    AuthError, ClientError, ConfigError, HandlerError, ParseError, SyncError, TransportError,
};
pub use poll::LifecycleState;
pub use reconcile::{Delta, PrimeSummary, Reconciler};
pub use session::{SessionMode, SessionRequest};
pub use tracker::{Category, SeenKey, SeenTracker, DEFAULT_SEEN_CAPACITY};
pub use transport::{
    Authenticator, HomeserverClient, ReplyTarget, RoomActions, RoomEventsQuery, SnapshotSource,
};
pub use types::{
    Credential, Event, InviteKey, JoinedRoom, PendingInvite, RoomHistory, Snapshot,
};

use dispatch::{spawn_invite_worker, spawn_message_worker};
use poll::{Lifecycle, PollLoop};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Observability feed. Lagging subscribers lose events; the client never waits.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(LifecycleState),
    Ready {
        user_id: UserId,
        joined_rooms: usize,
        pending_invites: usize,
    },
    PollFailed {
        phase: LifecycleState,
        error: String,
    },
    HandlerFailed {
        /// `None` for the ready callback.
        category: Option<Category>,
        item: String,
        error: String,
    },
    TrackerEvicted {
        evicted: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    /// Per-category bound of the seen-event tracker; `None` never evicts.
    pub seen_capacity: Option<NonZeroUsize>,
    pub handler_timeout: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: config::DEFAULT_POLL_INTERVAL,
            seen_capacity: NonZeroUsize::new(DEFAULT_SEEN_CAPACITY),
            handler_timeout: None,
        }
    }
}

/// Cloneable handle that stops a running (or not yet started) client.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Idempotent. Returns true only for the call that actually requested the stop.
    pub fn stop(&self) -> bool {
        let already = self.stop.send_replace(true);
        if !already {
            info!("stop requested");
        }
        !already
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

pub struct SyncClient {
    authenticator: Arc<dyn Authenticator>,
    source: Arc<dyn SnapshotSource>,
    actions: Arc<dyn RoomActions>,
    handler: Arc<dyn EventHandler>,
    request: SessionRequest,
    options: SyncOptions,
    lifecycle: Arc<Lifecycle>,
    stop: StopHandle,
}

impl SyncClient {
    pub fn new(
        homeserver: Arc<HomeserverClient>,
        request: SessionRequest,
        handler: Arc<dyn EventHandler>,
        options: SyncOptions,
    ) -> Self {
        Self::with_parts(
            homeserver.clone(),
            homeserver.clone(),
            homeserver,
            handler,
            request,
            options,
        )
    }

    /// Builds a client talking to the configured homeserver.
    pub fn from_config(
        config: &ClientConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, ConfigError> {
        let homeserver = config.validate()?;
        let http = HomeserverClient::new(homeserver)
            .with_api_path(&config.api_path)
            .with_request_timeout(config.request_timeout);
        Ok(Self::new(
            Arc::new(http),
            config.session_request(),
            handler,
            config.sync_options(),
        ))
    }

    /// Assembles a client from individual boundary implementations.
    pub fn with_parts(
        authenticator: Arc<dyn Authenticator>,
        source: Arc<dyn SnapshotSource>,
        actions: Arc<dyn RoomActions>,
        handler: Arc<dyn EventHandler>,
        request: SessionRequest,
        options: SyncOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);
        Self {
            authenticator,
            source,
            actions,
            handler,
            request,
            options,
            lifecycle: Arc::new(Lifecycle::new(events)),
            stop: StopHandle {
                stop: Arc::new(stop),
            },
        }
    }

    /// Authenticates, primes and polls until [`SyncClient::stop`] is called.
    ///
    /// Returns once the poll loop has exited, both dispatch workers have
    /// drained and `on_ready` has returned. A client runs at most once.
    pub async fn run(&self) -> Result<(), ClientError> {
        if !self.lifecycle.begin() {
            return Err(ClientError::AlreadyStarted);
        }
        if self.stop.is_stopped() {
            debug!("stopped before start; skipping authentication");
            self.lifecycle.transition(LifecycleState::Stopped);
            return Ok(());
        }

        let credential =
            match session::authenticate(self.authenticator.as_ref(), &self.request).await {
                Ok(credential) => credential,
                Err(err) => {
                    self.lifecycle.transition(LifecycleState::Stopped);
                    return Err(err.into());
                }
            };

        let result = self.poll(credential).await;
        self.lifecycle.transition(LifecycleState::Stopped);
        result
    }

    async fn poll(&self, credential: Arc<Credential>) -> Result<(), ClientError> {
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&self.handler),
                Arc::clone(&self.actions),
                credential.user_id.clone(),
                self.stop.stop.subscribe(),
                self.lifecycle.events().clone(),
            )
            .with_handler_timeout(self.options.handler_timeout),
        );

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (invite_tx, invite_rx) = mpsc::unbounded_channel();
        let message_worker = spawn_message_worker(Arc::clone(&dispatcher), message_rx);
        let invite_worker = spawn_invite_worker(Arc::clone(&dispatcher), invite_rx);

        let ready = PollLoop {
            source: Arc::clone(&self.source),
            actions: Arc::clone(&self.actions),
            credential,
            reconciler: Reconciler::new(SeenTracker::new(self.options.seen_capacity)),
            dispatcher,
            interval: self.options.poll_interval,
            stop: self.stop.stop.subscribe(),
            lifecycle: Arc::clone(&self.lifecycle),
            messages: message_tx,
            invites: invite_tx,
        }
        .run()
        .await;

        let (messages, invites) = tokio::join!(message_worker, invite_worker);
        messages?;
        invites?;
        if let Some(ready) = ready {
            ready.await?;
        }
        debug!("dispatch workers drained");
        Ok(())
    }

    /// Idempotent; safe to call from any task, before or during [`SyncClient::run`].
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.lifecycle.events().subscribe()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
