// Document replica: one session's yrs-backed copy of the shared content.
//
// All mutation, codec work, and subscriber dispatch run synchronously on
// the owning session's thread; cross-session concurrency is resolved by
// CRDT merge, not locks. Every state change is emitted to subscribers as
// an incremental binary delta tagged with its origin.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tracing::warn;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use coauthor_common::error::DecodeError;
use coauthor_common::origin::UpdateOrigin;
use coauthor_common::types::SessionId;

/// Name of the shared text root all sessions edit.
pub const CONTENT_ROOT: &str = "content";

/// Handle for one registered update subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// A locally authored mutation of the shared text root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
    Replace { index: u32, len: u32, text: String },
}

type UpdateCallback = Rc<RefCell<dyn FnMut(&[u8], &UpdateOrigin)>>;

/// One session's replica of the shared document.
pub struct DocumentReplica {
    doc: Doc,
    session_id: SessionId,
    subscribers: RefCell<BTreeMap<SubscriptionId, UpdateCallback>>,
    next_subscription: Cell<u64>,
    destroyed: Cell<bool>,
}

impl DocumentReplica {
    /// Create an empty replica owned by the given session.
    pub fn new(session_id: SessionId) -> Self {
        let options = yrs::Options { client_id: session_id, ..Default::default() };
        let doc = Doc::with_options(options);
        doc.get_or_insert_text(CONTENT_ROOT);
        Self {
            doc,
            session_id,
            subscribers: RefCell::new(BTreeMap::new()),
            next_subscription: Cell::new(1),
            destroyed: Cell::new(false),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Merge a full snapshot into this replica.
    ///
    /// The snapshot is decoded before the document is touched, so a
    /// malformed payload returns `DecodeError` and leaves the replica at
    /// its prior (possibly empty) valid state.
    pub fn seed(&self, snapshot: &[u8]) -> Result<(), DecodeError> {
        if !self.guard_live("seed") {
            return Ok(());
        }
        let update =
            Update::decode_v1(snapshot).map_err(|e| DecodeError::Snapshot(e.to_string()))?;
        let before = self.raw_state_vector();
        let origin = UpdateOrigin::Local;
        {
            let mut txn = self.doc.transact_mut_with(origin.to_txn_origin());
            txn.apply_update(update).map_err(|e| DecodeError::Snapshot(e.to_string()))?;
        }
        self.emit_changes_since(&before, &origin);
        Ok(())
    }

    /// Merge an update received from a peer or the authoritative store.
    ///
    /// The applied delta is emitted to subscribers tagged `Remote`; it is
    /// therefore never classified outbound and never echoes back out.
    pub fn apply_remote_update(&self, payload: &[u8]) -> Result<(), DecodeError> {
        if !self.guard_live("apply_remote_update") {
            return Ok(());
        }
        let update = Update::decode_v1(payload).map_err(|e| DecodeError::Update(e.to_string()))?;
        let before = self.raw_state_vector();
        let origin = UpdateOrigin::Remote;
        {
            let mut txn = self.doc.transact_mut_with(origin.to_txn_origin());
            txn.apply_update(update).map_err(|e| DecodeError::Update(e.to_string()))?;
        }
        self.emit_changes_since(&before, &origin);
        Ok(())
    }

    /// Apply a locally authored edit under the given origin tag.
    ///
    /// Indexes must already be clamped to document bounds; the binding is
    /// the sole caller on the surface path and does so.
    pub fn apply_edit(&self, origin: &UpdateOrigin, edit: &LocalEdit) {
        if !self.guard_live("apply_edit") {
            return;
        }
        let before = self.raw_state_vector();
        let text = self.doc.get_or_insert_text(CONTENT_ROOT);
        {
            let mut txn = self.doc.transact_mut_with(origin.to_txn_origin());
            match edit {
                LocalEdit::Insert { index, text: chunk } => {
                    text.insert(&mut txn, *index, chunk);
                }
                LocalEdit::Delete { index, len } => {
                    text.remove_range(&mut txn, *index, *len);
                }
                LocalEdit::Replace { index, len, text: chunk } => {
                    text.remove_range(&mut txn, *index, *len);
                    text.insert(&mut txn, *index, chunk);
                }
            }
        }
        self.emit_changes_since(&before, origin);
    }

    /// Encode the full causal state as a binary snapshot.
    pub fn snapshot(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (logical frontier) for sync protocols.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute an update containing all changes the remote frontier is
    /// missing.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let sv =
            StateVector::decode_v1(remote_sv).map_err(|e| DecodeError::Update(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Materialize the shared text root.
    pub fn text_content(&self) -> String {
        self.doc.get_or_insert_text(CONTENT_ROOT).get_string(&self.doc.transact())
    }

    pub fn text_len(&self) -> u32 {
        self.doc.get_or_insert_text(CONTENT_ROOT).len(&self.doc.transact())
    }

    /// Register an update subscriber. Subscribers are keyed by id and
    /// unregistered deterministically; they are never relied on to drop.
    pub fn subscribe(
        &self,
        callback: impl FnMut(&[u8], &UpdateOrigin) + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.get());
        self.next_subscription.set(id.0 + 1);
        self.subscribers.borrow_mut().insert(id, Rc::new(RefCell::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.borrow_mut().remove(&id);
    }

    /// Release the replica. Idempotent; a second call logs a warning and
    /// does nothing. Mutations after destroy are logged no-ops.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            warn!(session = self.session_id, "document replica destroyed twice");
            return;
        }
        self.subscribers.borrow_mut().clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }

    pub(crate) fn content_ref(&self) -> TextRef {
        self.doc.get_or_insert_text(CONTENT_ROOT)
    }

    pub(crate) fn raw_state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Emit the delta between `before` and the current state. Used on
    /// every mutation path, including replays performed by the undo
    /// scope, so subscribers observe a single coherent update stream.
    pub(crate) fn emit_changes_since(&self, before: &StateVector, origin: &UpdateOrigin) {
        // Deletions advance the delete set but not the state vector, so
        // the encoded delta decides whether anything happened. An empty
        // v1 update is exactly two zero bytes (no blocks, no deletes).
        let delta = self.doc.transact().encode_diff_v1(before);
        if delta == [0, 0] {
            return;
        }
        self.dispatch(&delta, origin);
    }

    fn dispatch(&self, payload: &[u8], origin: &UpdateOrigin) {
        // Snapshot the registry so callbacks may subscribe/unsubscribe
        // without deadlocking the dispatch pass.
        let snapshot: Vec<(SubscriptionId, UpdateCallback)> =
            self.subscribers.borrow().iter().map(|(id, cb)| (*id, Rc::clone(cb))).collect();
        for (id, callback) in snapshot {
            let mut callback = callback.borrow_mut();
            if catch_unwind(AssertUnwindSafe(|| (callback)(payload, origin))).is_err() {
                // One failing listener must not suppress delivery to others.
                warn!(subscription = id.0, "update subscriber panicked; delivery continues");
            }
        }
    }

    fn guard_live(&self, operation: &str) -> bool {
        if self.destroyed.get() {
            warn!(session = self.session_id, operation, "document replica used after destroy");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn insert(replica: &DocumentReplica, origin: &UpdateOrigin, index: u32, text: &str) {
        replica.apply_edit(origin, &LocalEdit::Insert { index, text: text.to_string() });
    }

    #[test]
    fn snapshot_reconstructs_identical_state() {
        let source = DocumentReplica::new(1);
        insert(&source, &UpdateOrigin::Local, 0, "persistent data");

        let restored = DocumentReplica::new(2);
        restored.seed(&source.snapshot()).expect("snapshot should decode");
        assert_eq!(restored.text_content(), "persistent data");
    }

    #[test]
    fn malformed_seed_leaves_replica_empty_and_usable() {
        let replica = DocumentReplica::new(1);
        let err = replica.seed(b"not a snapshot").expect_err("garbage should not decode");
        assert!(matches!(err, DecodeError::Snapshot(_)));

        insert(&replica, &UpdateOrigin::Local, 0, "still works");
        assert_eq!(replica.text_content(), "still works");
    }

    #[test]
    fn malformed_remote_update_keeps_last_valid_state() {
        let replica = DocumentReplica::new(1);
        insert(&replica, &UpdateOrigin::Local, 0, "valid");

        let err =
            replica.apply_remote_update(b"garbage").expect_err("garbage should not decode");
        assert!(matches!(err, DecodeError::Update(_)));
        assert_eq!(replica.text_content(), "valid");
    }

    #[test]
    fn applying_the_same_update_twice_is_idempotent() {
        let source = DocumentReplica::new(1);
        insert(&source, &UpdateOrigin::Local, 0, "hello");
        let update = source.snapshot();

        let target = DocumentReplica::new(2);
        target.apply_remote_update(&update).expect("update should apply");
        let once = target.text_content();
        target.apply_remote_update(&update).expect("duplicate should apply");
        assert_eq!(target.text_content(), once);
    }

    #[test]
    fn concurrent_updates_commute() {
        let a = DocumentReplica::new(1);
        let b = DocumentReplica::new(2);
        insert(&a, &UpdateOrigin::Local, 0, "left");
        insert(&b, &UpdateOrigin::Local, 0, "right");
        let update_a = a.snapshot();
        let update_b = b.snapshot();

        let ab = DocumentReplica::new(3);
        ab.apply_remote_update(&update_a).expect("a should apply");
        ab.apply_remote_update(&update_b).expect("b should apply");

        let ba = DocumentReplica::new(4);
        ba.apply_remote_update(&update_b).expect("b should apply");
        ba.apply_remote_update(&update_a).expect("a should apply");

        assert_eq!(ab.text_content(), ba.text_content());
    }

    #[test]
    fn remote_updates_are_emitted_with_remote_origin() {
        let source = DocumentReplica::new(1);
        insert(&source, &UpdateOrigin::Local, 0, "payload");

        let target = DocumentReplica::new(2);
        let seen: Rc<RefCell<Vec<UpdateOrigin>>> = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        target.subscribe(move |_, origin| log.borrow_mut().push(*origin));

        target.apply_remote_update(&source.snapshot()).expect("update should apply");
        assert_eq!(seen.borrow().as_slice(), &[UpdateOrigin::Remote]);
    }

    #[test]
    fn bound_edits_are_emitted_with_their_binding_origin() {
        let replica = DocumentReplica::new(1);
        let origin = UpdateOrigin::BoundTo(coauthor_common::types::BindingId::new());

        let seen: Rc<RefCell<Vec<UpdateOrigin>>> = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        replica.subscribe(move |_, origin| log.borrow_mut().push(*origin));

        insert(&replica, &origin, 0, "typed");
        assert_eq!(seen.borrow().as_slice(), &[origin]);
    }

    #[test]
    fn emitted_deltas_reconstruct_the_document_on_a_peer() {
        let replica = DocumentReplica::new(1);
        let deltas: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&deltas);
        replica.subscribe(move |payload, _| log.borrow_mut().push(payload.to_vec()));

        insert(&replica, &UpdateOrigin::Local, 0, "hello");
        insert(&replica, &UpdateOrigin::Local, 5, " world");

        let peer = DocumentReplica::new(2);
        for delta in deltas.borrow().iter() {
            peer.apply_remote_update(delta).expect("delta should apply");
        }
        assert_eq!(peer.text_content(), "hello world");
    }

    #[test]
    fn unsubscribed_callbacks_stop_receiving_updates() {
        let replica = DocumentReplica::new(1);
        let count = Rc::new(RefCell::new(0usize));
        let log = Rc::clone(&count);
        let id = replica.subscribe(move |_, _| *log.borrow_mut() += 1);

        insert(&replica, &UpdateOrigin::Local, 0, "one");
        replica.unsubscribe(id);
        insert(&replica, &UpdateOrigin::Local, 3, "two");

        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn a_panicking_subscriber_does_not_suppress_later_ones() {
        let replica = DocumentReplica::new(1);
        replica.subscribe(|_, _| panic!("listener bug"));
        let delivered = Rc::new(RefCell::new(false));
        let log = Rc::clone(&delivered);
        replica.subscribe(move |_, _| *log.borrow_mut() = true);

        insert(&replica, &UpdateOrigin::Local, 0, "x");
        assert!(*delivered.borrow());
    }

    #[test]
    fn destroy_is_idempotent_and_silences_mutations() {
        let replica = DocumentReplica::new(1);
        insert(&replica, &UpdateOrigin::Local, 0, "before");

        replica.destroy();
        replica.destroy();
        assert!(replica.is_destroyed());

        insert(&replica, &UpdateOrigin::Local, 0, "after");
        assert_eq!(replica.text_content(), "before");
    }

    #[test]
    fn state_vector_diff_sync_converges() {
        let a = DocumentReplica::new(1);
        let b = DocumentReplica::new(2);
        insert(&a, &UpdateOrigin::Local, 0, "hello");

        let diff = a.encode_diff(&b.state_vector()).expect("state vector should decode");
        b.apply_remote_update(&diff).expect("diff should apply");
        assert_eq!(b.text_content(), "hello");
    }
}
