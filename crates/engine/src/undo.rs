// Per-session undo scoping.
//
// The undo manager tracks only transactions whose origin is the owning
// binding's `BoundTo` tag, so remote merges and reconciler output are
// never recorded and an undo can never revert another session's edits.
// Replayed deltas are re-emitted through the replica with origin `Local`:
// rendered and published like any locally authored change, but not
// re-captured here.

use std::collections::HashSet;

use tracing::warn;
use yrs::undo::{Options as UndoOptions, UndoManager};

use coauthor_common::origin::UpdateOrigin;
use coauthor_common::types::BindingId;

use crate::replica::DocumentReplica;

/// Undo/redo history for one binding's locally authored operations.
///
/// Consecutive edits landing within the capture timeout coalesce into a
/// single step; a longer gap, or `interrupt()`, seals the current group.
pub struct UndoScope {
    manager: Option<UndoManager<()>>,
    binding: BindingId,
}

impl UndoScope {
    pub fn new(replica: &DocumentReplica, binding: BindingId, capture_timeout_ms: u64) -> Self {
        let mut options = UndoOptions::default();
        options.capture_timeout_millis = capture_timeout_ms;
        options.tracked_origins =
            HashSet::from([UpdateOrigin::BoundTo(binding).to_txn_origin()]);

        let scope = replica.content_ref();
        let manager = UndoManager::with_scope_and_options(replica.doc(), &scope, options);
        Self { manager: Some(manager), binding }
    }

    /// Seal the current capture group. Called on every remote merge so a
    /// following local edit starts a fresh undo step.
    pub fn interrupt(&mut self) {
        if let Some(manager) = self.manager.as_mut() {
            manager.reset();
        }
    }

    /// Revert the most recent locally authored group. Returns whether
    /// anything was undone.
    pub fn undo(&mut self, replica: &DocumentReplica) -> bool {
        let Some(manager) = self.manager.as_mut() else {
            warn!(binding = %self.binding, "undo after destroy");
            return false;
        };
        if !manager.can_undo() {
            return false;
        }
        let before = replica.raw_state_vector();
        let undone = manager.undo_blocking();
        if undone {
            replica.emit_changes_since(&before, &UpdateOrigin::Local);
        }
        undone
    }

    /// Replay the most recently undone group.
    pub fn redo(&mut self, replica: &DocumentReplica) -> bool {
        let Some(manager) = self.manager.as_mut() else {
            warn!(binding = %self.binding, "redo after destroy");
            return false;
        };
        if !manager.can_redo() {
            return false;
        }
        let before = replica.raw_state_vector();
        let redone = manager.redo_blocking();
        if redone {
            replica.emit_changes_since(&before, &UpdateOrigin::Local);
        }
        redone
    }

    pub fn can_undo(&self) -> bool {
        self.manager.as_ref().is_some_and(|manager| manager.can_undo())
    }

    pub fn can_redo(&self) -> bool {
        self.manager.as_ref().is_some_and(|manager| manager.can_redo())
    }

    /// Drop both stacks. Idempotent; a second call logs a warning.
    pub fn destroy(&mut self) {
        if self.manager.take().is_none() {
            warn!(binding = %self.binding, "undo scope destroyed twice");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.manager.is_none()
    }
}
