// Editing-surface binding: the seam between one replica/registrar pair
// and the external editing surface.
//
// The binding is the only writer of `BoundTo`-origin updates and the
// single owner of both the replica and the awareness registrar. Its
// subscriptions do not call back into the surface directly — they record
// dirty flags and queue outbound payloads into a shared signal cell, and
// the binding drains that cell after each operation. That keeps the
// render path free of re-entrant loops: a surface edit never renders
// back into the surface, a remote update never publishes back out.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use coauthor_common::error::DecodeError;
use coauthor_common::origin::UpdateOrigin;
use coauthor_common::types::{BindingId, SessionId};

use crate::awareness::{AwarenessRegistrar, PeerPresence, PresenceDiff, PresenceUser, Selection};
use crate::replica::{DocumentReplica, LocalEdit, SubscriptionId};

/// What the engine needs from a visual editing surface.
///
/// Content and presence are two independent render paths; neither ever
/// piggybacks on the other.
pub trait EditingSurface {
    /// The materialized document changed underneath the surface.
    fn content_changed(&mut self, content: &str);
    /// Peer decorations need a repaint. Never includes the local session.
    fn presence_changed(&mut self, peers: &[PeerPresence]);
    /// Current local selection, if the user has placed a cursor.
    fn selection(&self) -> Option<Selection>;
}

/// An opaque payload waiting for the transport pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Document(Vec<u8>),
    Awareness(Vec<u8>),
}

#[derive(Default)]
struct BindingSignals {
    content_dirty: bool,
    presence_dirty: bool,
    outbound: VecDeque<OutboundPayload>,
}

/// Wires a `DocumentReplica` and `AwarenessRegistrar` to a surface.
pub struct EditingSurfaceBinding<S: EditingSurface> {
    id: BindingId,
    session_id: SessionId,
    surface: S,
    replica: DocumentReplica,
    awareness: AwarenessRegistrar,
    signals: Rc<RefCell<BindingSignals>>,
    replica_sub: SubscriptionId,
    awareness_sub: SubscriptionId,
    destroyed: bool,
}

impl<S: EditingSurface> EditingSurfaceBinding<S> {
    /// Take ownership of the replica and registrar and register the
    /// subscriptions that drive rendering and publishing.
    pub fn attach(
        surface: S,
        replica: DocumentReplica,
        awareness: AwarenessRegistrar,
        session_id: SessionId,
    ) -> Self {
        let id = BindingId::new();
        let signals = Rc::new(RefCell::new(BindingSignals::default()));

        let sink = Rc::clone(&signals);
        let replica_sub = replica.subscribe(move |payload, origin| {
            let mut signals = sink.borrow_mut();
            if origin.is_outbound() {
                signals.outbound.push_back(OutboundPayload::Document(payload.to_vec()));
            }
            // Updates authored through this binding are already reflected
            // by the surface itself; everything else needs a render.
            if !origin.is_bound_to(&id) {
                signals.content_dirty = true;
            }
        });

        let sink = Rc::clone(&signals);
        let awareness_sub = awareness.subscribe(move |_diff: &PresenceDiff| {
            sink.borrow_mut().presence_dirty = true;
        });

        debug!(session = session_id, binding = %id, "editing surface bound");
        Self {
            id,
            session_id,
            surface,
            replica,
            awareness,
            signals,
            replica_sub,
            awareness_sub,
            destroyed: false,
        }
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn replica(&self) -> &DocumentReplica {
        &self.replica
    }

    pub fn awareness(&self) -> &AwarenessRegistrar {
        &self.awareness
    }

    /// Apply an edit entered through the surface. Out-of-bounds indexes
    /// are clamped — a concurrent remote delete may have shrunk the
    /// document since the surface computed them.
    pub fn handle_local_edit(&mut self, edit: LocalEdit) {
        if self.destroyed {
            warn!(binding = %self.id, "local edit after destroy");
            return;
        }
        let edit = self.clamp_edit(edit);
        self.replica.apply_edit(&UpdateOrigin::BoundTo(self.id), &edit);
        self.flush_render();
    }

    /// Ingest a remote document update and re-render.
    pub fn handle_remote_update(&mut self, payload: &[u8]) -> Result<(), DecodeError> {
        if self.destroyed {
            warn!(binding = %self.id, "remote update after destroy");
            return Ok(());
        }
        let applied = self.replica.apply_remote_update(payload);
        if let Err(err) = &applied {
            warn!(binding = %self.id, error = %err, "dropping malformed remote update");
        }
        self.flush_render();
        applied
    }

    /// Ingest a remote presence payload and re-decorate.
    pub fn handle_remote_awareness(&mut self, payload: &[u8]) -> Result<PresenceDiff, DecodeError> {
        if self.destroyed {
            warn!(binding = %self.id, "remote awareness after destroy");
            return Ok(PresenceDiff::default());
        }
        let applied = self.awareness.apply_remote_update(payload);
        if let Err(err) = &applied {
            warn!(binding = %self.id, error = %err, "dropping malformed awareness payload");
        }
        self.flush_render();
        applied
    }

    /// Publish the local identity to peers.
    pub fn announce_local_identity(&mut self, user: PresenceUser) -> Result<()> {
        if self.destroyed {
            warn!(binding = %self.id, "identity change after destroy");
            return Ok(());
        }
        self.awareness.set_local_identity(user)?;
        self.queue_local_awareness()?;
        self.flush_render();
        Ok(())
    }

    /// Pick up the surface's current selection and announce it.
    pub fn local_selection_changed(&mut self) -> Result<()> {
        if self.destroyed {
            warn!(binding = %self.id, "selection change after destroy");
            return Ok(());
        }
        let selection = self.surface.selection().map(|s| self.clamp_selection(s));
        self.awareness.set_local_selection(selection)?;
        self.queue_local_awareness()?;
        self.flush_render();
        Ok(())
    }

    /// Drop peers that have gone quiet and repaint decorations.
    pub fn evict_idle_peers(&mut self, max_age: Duration) -> PresenceDiff {
        let diff = self.awareness.evict_idle(max_age);
        self.flush_render();
        diff
    }

    /// Drain payloads queued for the transport. Only outbound-classified
    /// origins ever land here; remote updates cannot echo.
    pub fn take_outbound(&mut self) -> Vec<OutboundPayload> {
        self.signals.borrow_mut().outbound.drain(..).collect()
    }

    /// Re-run pending render work. Called by owners after mutating the
    /// replica outside the binding's own operations (undo, reconcile).
    pub fn refresh(&mut self) {
        self.flush_render();
    }

    /// Unregister subscriptions and tear down awareness, then replica.
    /// Idempotent; a second call logs a warning.
    pub fn destroy(&mut self) {
        if self.destroyed {
            warn!(binding = %self.id, "binding destroyed twice");
            return;
        }
        self.destroyed = true;
        self.replica.unsubscribe(self.replica_sub);
        self.awareness.unsubscribe(self.awareness_sub);
        self.awareness.destroy();
        self.replica.destroy();
        self.signals.borrow_mut().outbound.clear();
        debug!(binding = %self.id, "editing surface unbound");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn flush_render(&mut self) {
        let (content_dirty, presence_dirty) = {
            let mut signals = self.signals.borrow_mut();
            let flags = (signals.content_dirty, signals.presence_dirty);
            signals.content_dirty = false;
            signals.presence_dirty = false;
            flags
        };

        if content_dirty {
            self.surface.content_changed(&self.replica.text_content());
        }
        if presence_dirty {
            let peers: Vec<PeerPresence> = self
                .awareness
                .all_states()
                .into_iter()
                .filter(|peer| peer.session_id != self.session_id)
                .collect();
            self.surface.presence_changed(&peers);
        }
    }

    fn queue_local_awareness(&mut self) -> Result<()> {
        let payload =
            self.awareness.encode_local().context("failed to encode local presence for publish")?;
        self.signals.borrow_mut().outbound.push_back(OutboundPayload::Awareness(payload));
        Ok(())
    }

    fn clamp_edit(&self, edit: LocalEdit) -> LocalEdit {
        let content = self.replica.text_content();
        match edit {
            LocalEdit::Insert { index, text } => {
                LocalEdit::Insert { index: snap_to_char_boundary(&content, index), text }
            }
            LocalEdit::Delete { index, len } => {
                let index = snap_to_char_boundary(&content, index);
                let end = snap_to_char_boundary(&content, index.saturating_add(len));
                LocalEdit::Delete { index, len: end - index }
            }
            LocalEdit::Replace { index, len, text } => {
                let index = snap_to_char_boundary(&content, index);
                let end = snap_to_char_boundary(&content, index.saturating_add(len));
                LocalEdit::Replace { index, len: end - index, text }
            }
        }
    }

    fn clamp_selection(&self, selection: Selection) -> Selection {
        let content = self.replica.text_content();
        Selection {
            anchor: snap_to_char_boundary(&content, selection.anchor),
            head: snap_to_char_boundary(&content, selection.head),
        }
    }
}

/// Floor a surface-reported byte offset to the nearest valid position in
/// `content`. `yrs::Text` indexes by UTF-8 bytes under the default offset
/// kind, and an offset inside a multi-byte codepoint would panic in yrs.
fn snap_to_char_boundary(content: &str, index: u32) -> u32 {
    let mut index = (index as usize).min(content.len());
    while !content.is_char_boundary(index) {
        index -= 1;
    }
    index as u32
}
