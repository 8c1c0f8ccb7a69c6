use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    dispatch::{ready_context, Dispatcher},
    error::SyncError,
    reconcile::Reconciler,
    transport::{RoomActions, SnapshotSource},
    types::{Credential, Event, PendingInvite, Snapshot},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    Authenticating,
    Priming,
    Polling,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Authenticating => "authenticating",
            Self::Priming => "priming",
            Self::Polling => "polling",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Published lifecycle state plus the observability channel.
pub(crate) struct Lifecycle {
    state: watch::Sender<LifecycleState>,
    events: broadcast::Sender<ClientEvent>,
}

impl Lifecycle {
    pub(crate) fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self { state, events }
    }

    pub(crate) fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<ClientEvent> {
        &self.events
    }

    /// Moves `Idle → Authenticating`; false if the client already left `Idle`.
    pub(crate) fn begin(&self) -> bool {
        let began = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Idle {
                *state = LifecycleState::Authenticating;
                true
            } else {
                false
            }
        });
        if began {
            self.announce(LifecycleState::Authenticating);
        }
        began
    }

    pub(crate) fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            self.announce(next);
        }
    }

    fn announce(&self, state: LifecycleState) {
        info!(state = %state, "sync client state changed");
        let _ = self.events.send(ClientEvent::StateChanged(state));
    }
}

/// Resolves once a stop has been requested, or the stop sender is gone.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

enum Fetch {
    Snapshot(Snapshot),
    Failed(SyncError),
    Stopped,
}

/// Drives fetch → reconcile on a fixed delay and hands deltas to the workers.
///
/// The reconciler, and with it the seen-event tracker, lives only here.
pub(crate) struct PollLoop {
    pub(crate) source: Arc<dyn SnapshotSource>,
    pub(crate) actions: Arc<dyn RoomActions>,
    pub(crate) credential: Arc<Credential>,
    pub(crate) reconciler: Reconciler,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) interval: Duration,
    pub(crate) stop: watch::Receiver<bool>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) messages: mpsc::UnboundedSender<Vec<Event>>,
    pub(crate) invites: mpsc::UnboundedSender<Vec<PendingInvite>>,
}

impl PollLoop {
    /// Returns the `on_ready` task, if priming completed, so the caller can
    /// join it alongside the dispatch workers.
    pub(crate) async fn run(mut self) -> Option<JoinHandle<()>> {
        self.lifecycle.transition(LifecycleState::Priming);
        let Some(ready) = self.prime().await else {
            debug!("stop requested during priming");
            return None;
        };

        self.lifecycle.transition(LifecycleState::Polling);
        while self.wait_for_next_tick().await {
            self.tick().await;
        }
        debug!("poll loop finished");
        Some(ready)
    }

    /// Seeds the tracker from the first good snapshot, then starts `on_ready`
    /// on its own task. Returns `None` if a stop arrived first.
    async fn prime(&mut self) -> Option<JoinHandle<()>> {
        let baseline = loop {
            match self.fetch().await {
                Fetch::Snapshot(snapshot) => break snapshot,
                Fetch::Stopped => return None,
                Fetch::Failed(err) => {
                    self.report_failure(LifecycleState::Priming, &err);
                    if !self.wait_for_next_tick().await {
                        return None;
                    }
                }
            }
        };

        let summary = self.reconciler.prime(&baseline);
        drop(baseline);
        info!(
            rooms = summary.rooms,
            messages = summary.messages,
            invites = summary.invites,
            "baseline snapshot recorded; history will not be delivered"
        );

        if self.is_stopped() {
            return None;
        }
        let _ = self.lifecycle.events().send(ClientEvent::Ready {
            user_id: self.credential.user_id.clone(),
            joined_rooms: summary.rooms,
            pending_invites: summary.invites,
        });
        let ctx = ready_context(
            self.credential.user_id.clone(),
            self.credential.device_id.clone(),
            summary.rooms,
            summary.invites,
            Arc::clone(&self.actions),
        );
        let dispatcher = Arc::clone(&self.dispatcher);
        Some(tokio::spawn(async move {
            let _ = dispatcher.dispatch_ready(ctx).await;
        }))
    }

    async fn tick(&mut self) {
        let snapshot = match self.fetch().await {
            Fetch::Snapshot(snapshot) => snapshot,
            Fetch::Failed(err) => {
                self.report_failure(LifecycleState::Polling, &err);
                return;
            }
            Fetch::Stopped => return,
        };

        let delta = self.reconciler.reconcile(snapshot);
        if delta.evicted > 0 {
            let _ = self
                .lifecycle
                .events()
                .send(ClientEvent::TrackerEvicted {
                    evicted: delta.evicted,
                });
        }
        if !delta.messages.is_empty() && self.messages.send(delta.messages).is_err() {
            warn!("message worker is gone; dropping new messages");
        }
        if !delta.invites.is_empty() && self.invites.send(delta.invites).is_err() {
            warn!("invite worker is gone; dropping new invites");
        }
    }

    async fn fetch(&mut self) -> Fetch {
        if self.is_stopped() {
            return Fetch::Stopped;
        }
        tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop) => Fetch::Stopped,
            result = self.source.fetch_snapshot(&self.credential) => match result {
                Ok(snapshot) => Fetch::Snapshot(snapshot),
                Err(err) => Fetch::Failed(err),
            },
        }
    }

    /// Sleeps one poll interval. Returns false if a stop arrived meanwhile.
    async fn wait_for_next_tick(&mut self) -> bool {
        let slept = tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop) => false,
            _ = tokio::time::sleep(self.interval) => true,
        };
        slept && !self.is_stopped()
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn report_failure(&self, phase: LifecycleState, err: &SyncError) {
        match err {
            SyncError::Transport(_) => {
                warn!(phase = %phase, "sync request failed; retrying next tick: {err}")
            }
            SyncError::Parse(_) => {
                warn!(phase = %phase, "discarding malformed snapshot; retrying next tick: {err}")
            }
        }
        let _ = self.lifecycle.events().send(ClientEvent::PollFailed {
            phase,
            error: err.to_string(),
        });
    }
}
