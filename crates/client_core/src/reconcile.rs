use tracing::debug;

use crate::{
    tracker::{Category, SeenKey, SeenTracker},
    types::{Event, PendingInvite, Snapshot},
};

/// Items of one snapshot that were never delivered before.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Delta {
    /// Each room's timeline order; rooms follow snapshot enumeration order.
    pub messages: Vec<Event>,
    pub invites: Vec<PendingInvite>,
    /// Ids dropped from the tracker while recording this delta.
    pub evicted: u64,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.invites.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrimeSummary {
    pub rooms: usize,
    pub messages: usize,
    pub invites: usize,
}

/// Sole owner and writer of the seen-event tracker.
pub struct Reconciler {
    tracker: SeenTracker,
}

impl Reconciler {
    pub fn new(tracker: SeenTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &SeenTracker {
        &self.tracker
    }

    /// Seeds the tracker with the startup baseline. Nothing in it is delivered.
    pub fn prime(&mut self, snapshot: &Snapshot) -> PrimeSummary {
        let mut summary = PrimeSummary {
            rooms: snapshot.joined_rooms.len(),
            ..PrimeSummary::default()
        };
        for event in snapshot.events().filter(|event| event.is_message()) {
            if self.tracker.mark_seen(SeenKey::Message(event.event_id.clone())) {
                summary.messages += 1;
            }
        }
        for invite in &snapshot.invites {
            if self.tracker.mark_seen(SeenKey::Invite(invite.key())) {
                summary.invites += 1;
            }
        }
        debug!(
            rooms = summary.rooms,
            messages = summary.messages,
            invites = summary.invites,
            "primed seen-event tracker"
        );
        summary
    }

    /// Extracts unseen messages and invites, marking each seen before it is
    /// returned so a failing handler can never cause redelivery.
    pub fn reconcile(&mut self, snapshot: Snapshot) -> Delta {
        let evicted_before = self.tracker.total_evicted();
        let mut delta = Delta::default();

        for room in snapshot.joined_rooms {
            for event in room.timeline {
                if !event.is_message() {
                    continue;
                }
                if self.tracker.mark_seen(SeenKey::Message(event.event_id.clone())) {
                    delta.messages.push(event);
                }
            }
        }

        for invite in snapshot.invites {
            if self.tracker.mark_seen(SeenKey::Invite(invite.key())) {
                delta.invites.push(invite);
            }
        }

        delta.evicted = self.tracker.total_evicted() - evicted_before;
        if !delta.is_empty() {
            debug!(
                messages = delta.messages.len(),
                invites = delta.invites.len(),
                tracked_messages = self.tracker.len(Category::Message),
                "reconciled snapshot"
            );
        }
        delta
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
