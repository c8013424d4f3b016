// Ephemeral per-session presence: identity plus cursor/selection.
//
// The wire protocol is the yrs awareness protocol; on top of it the
// registrar keeps an explicit peer table (session id -> presence +
// last-seen stamp) that consumers render from. Presence lives in its own
// awareness document, so it can never leak into a content snapshot, and
// it is never persisted.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use yrs::sync::{Awareness, AwarenessUpdate};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::Doc;

use coauthor_common::error::DecodeError;
use coauthor_common::types::SessionId;

use crate::replica::SubscriptionId;

/// Who a session belongs to, as rendered in peer decorations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUser {
    pub id: String,
    pub name: String,
}

/// A selection as flat anchor/head offsets into the shared text root.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selection {
    pub anchor: u32,
    pub head: u32,
}

/// One session's ephemeral presence state.
///
/// `selection: None` is a valid state — a peer that has joined but not
/// yet moved a cursor. Consumers render a placeholder, never fail.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceState {
    pub user: PresenceUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

/// A known session in the peer table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerPresence {
    pub session_id: SessionId,
    pub state: PresenceState,
    pub last_seen: DateTime<Utc>,
}

/// Sessions touched by one presence change, local or remote.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PresenceDiff {
    pub added: Vec<SessionId>,
    pub updated: Vec<SessionId>,
    pub removed: Vec<SessionId>,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

type PresenceCallback = Rc<RefCell<dyn FnMut(&PresenceDiff)>>;

/// Owns one session's presence and its view of every peer's presence.
pub struct AwarenessRegistrar {
    awareness: Awareness,
    session_id: SessionId,
    local: RefCell<PresenceState>,
    peers: RefCell<BTreeMap<SessionId, PeerPresence>>,
    subscribers: RefCell<BTreeMap<SubscriptionId, PresenceCallback>>,
    next_subscription: Cell<u64>,
    destroyed: Cell<bool>,
}

impl AwarenessRegistrar {
    pub fn new(session_id: SessionId) -> Self {
        let options = yrs::Options { client_id: session_id, ..Default::default() };
        Self {
            awareness: Awareness::new(Doc::with_options(options)),
            session_id,
            local: RefCell::new(PresenceState::default()),
            peers: RefCell::new(BTreeMap::new()),
            subscribers: RefCell::new(BTreeMap::new()),
            next_subscription: Cell::new(1),
            destroyed: Cell::new(false),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Merge the user identity into the local state and announce it.
    pub fn set_local_identity(&self, user: PresenceUser) -> Result<()> {
        if !self.guard_live("set_local_identity") {
            return Ok(());
        }
        self.local.borrow_mut().user = user;
        self.push_local()
    }

    /// Merge the selection field into the local state and announce it.
    pub fn set_local_selection(&self, selection: Option<Selection>) -> Result<()> {
        if !self.guard_live("set_local_selection") {
            return Ok(());
        }
        self.local.borrow_mut().selection = selection;
        self.push_local()
    }

    /// Every known session, the local one included, ordered by id.
    /// Consumers that want "remote peers" filter out their own session.
    pub fn all_states(&self) -> Vec<PeerPresence> {
        self.peers.borrow().values().cloned().collect()
    }

    /// Merge a remote presence payload and report which sessions changed.
    ///
    /// An entry for the local session id arriving in a remote payload is
    /// accepted here; consumers exclude it from remote-peer views.
    pub fn apply_remote_update(&self, payload: &[u8]) -> Result<PresenceDiff, DecodeError> {
        if !self.guard_live("apply_remote_update") {
            return Ok(PresenceDiff::default());
        }
        let update =
            AwarenessUpdate::decode_v1(payload).map_err(|e| DecodeError::Awareness(e.to_string()))?;
        let summary = self
            .awareness
            .apply_update_summary(update)
            .map_err(|e| DecodeError::Awareness(e.to_string()))?;
        let Some(summary) = summary else {
            return Ok(PresenceDiff::default());
        };

        let diff = PresenceDiff {
            added: summary.added,
            updated: summary.updated,
            removed: summary.removed,
        };
        if diff.is_empty() {
            return Ok(diff);
        }

        {
            let mut peers = self.peers.borrow_mut();
            let now = Utc::now();
            for session_id in diff.added.iter().chain(diff.updated.iter()) {
                if let Some(state) = self.lookup_state(*session_id) {
                    peers.insert(
                        *session_id,
                        PeerPresence { session_id: *session_id, state, last_seen: now },
                    );
                }
            }
            for session_id in &diff.removed {
                peers.remove(session_id);
            }
        }

        self.dispatch(&diff);
        Ok(diff)
    }

    /// Encode the presence entries for the given sessions.
    pub fn encode_diff(&self, sessions: &[SessionId]) -> Result<Vec<u8>> {
        let update = self
            .awareness
            .update_with_clients(sessions.to_vec())
            .context("failed to encode awareness diff")?;
        Ok(update.encode_v1())
    }

    /// Encode only the local session's presence entry.
    pub fn encode_local(&self) -> Result<Vec<u8>> {
        self.encode_diff(&[self.session_id])
    }

    /// Drop peers not heard from within `max_age`. The local session is
    /// never evicted. Cadence is the host's choice.
    pub fn evict_idle(&self, max_age: Duration) -> PresenceDiff {
        if !self.guard_live("evict_idle") {
            return PresenceDiff::default();
        }
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age.as_millis() as i64);
        let removed: Vec<SessionId> = {
            let mut peers = self.peers.borrow_mut();
            let idle: Vec<SessionId> = peers
                .values()
                .filter(|peer| peer.session_id != self.session_id && peer.last_seen <= cutoff)
                .map(|peer| peer.session_id)
                .collect();
            for session_id in &idle {
                peers.remove(session_id);
            }
            idle
        };

        let diff = PresenceDiff { removed, ..Default::default() };
        if !diff.is_empty() {
            self.dispatch(&diff);
        }
        diff
    }

    pub fn subscribe(&self, callback: impl FnMut(&PresenceDiff) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.get());
        self.next_subscription.set(id.0 + 1);
        self.subscribers.borrow_mut().insert(id, Rc::new(RefCell::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.borrow_mut().remove(&id);
    }

    /// Clear local presence and release the registrar. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            warn!(session = self.session_id, "awareness registrar destroyed twice");
            return;
        }
        self.awareness.clean_local_state();
        self.subscribers.borrow_mut().clear();
        self.peers.borrow_mut().clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn push_local(&self) -> Result<()> {
        let state = self.local.borrow().clone();
        self.awareness
            .set_local_state(&state)
            .context("failed to encode local presence state")?;

        let added = {
            let mut peers = self.peers.borrow_mut();
            let added = !peers.contains_key(&self.session_id);
            peers.insert(
                self.session_id,
                PeerPresence { session_id: self.session_id, state, last_seen: Utc::now() },
            );
            added
        };

        let diff = if added {
            PresenceDiff { added: vec![self.session_id], ..Default::default() }
        } else {
            PresenceDiff { updated: vec![self.session_id], ..Default::default() }
        };
        self.dispatch(&diff);
        Ok(())
    }

    fn lookup_state(&self, session_id: SessionId) -> Option<PresenceState> {
        self.awareness.iter().find_map(|(client_id, state)| {
            if client_id != session_id {
                return None;
            }
            let raw = state.data?;
            serde_json::from_str(raw.as_ref()).ok()
        })
    }

    fn dispatch(&self, diff: &PresenceDiff) {
        let snapshot: Vec<(SubscriptionId, PresenceCallback)> =
            self.subscribers.borrow().iter().map(|(id, cb)| (*id, Rc::clone(cb))).collect();
        for (id, callback) in snapshot {
            let mut callback = callback.borrow_mut();
            if catch_unwind(AssertUnwindSafe(|| (callback)(diff))).is_err() {
                warn!(subscription = id.0, "presence subscriber panicked; delivery continues");
            }
        }
    }

    fn guard_live(&self, operation: &str) -> bool {
        if self.destroyed.get() {
            warn!(session = self.session_id, operation, "awareness registrar used after destroy");
            return false;
        }
        true
    }
}
