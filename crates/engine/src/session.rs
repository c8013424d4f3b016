// Collaborative session: composition root for one editing session.
//
// Owns the undo scope, the binding (which owns the replica and the
// awareness registrar), the staleness reconciler, and the transport, and
// routes every event between them. Teardown runs undo scope, binding,
// awareness, replica — in that order, idempotent at every layer.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use coauthor_common::types::SessionId;

use crate::awareness::{PresenceDiff, PresenceUser};
use crate::binding::{EditingSurface, EditingSurfaceBinding, OutboundPayload};
use crate::reconcile::{ReconcilerStats, StalenessReconciler};
use crate::replica::{DocumentReplica, LocalEdit};
use crate::transport::CollabTransport;
use crate::undo::UndoScope;

/// Engine tunables. `Default` carries the production values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Local edits closer together than this coalesce into one undo step.
    pub undo_capture_timeout_ms: u64,
    /// Deadline for the authoritative-snapshot RPC; past it the staleness
    /// probe resolves non-stale.
    pub staleness_rpc_timeout_ms: u64,
    /// Peers silent for longer than this are evicted from presence.
    pub presence_idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            undo_capture_timeout_ms: 500,
            staleness_rpc_timeout_ms: 4_000,
            presence_idle_timeout_secs: 60,
        }
    }
}

pub struct CollabSession<S: EditingSurface, T: CollabTransport> {
    config: SessionConfig,
    binding: EditingSurfaceBinding<S>,
    undo: UndoScope,
    reconciler: StalenessReconciler,
    transport: T,
    destroyed: bool,
}

impl<S: EditingSurface, T: CollabTransport> CollabSession<S, T> {
    /// Mount a session: build the replica (optionally seeded), the
    /// registrar, the binding, and the undo scope, then announce the
    /// local identity to peers.
    ///
    /// A malformed seed is logged and ignored — the session starts from
    /// an empty document rather than refusing to mount; the store copy
    /// is recoverable later through `sync_with_store`.
    pub fn start(
        config: SessionConfig,
        surface: S,
        transport: T,
        session_id: SessionId,
        user: PresenceUser,
        initial_snapshot: Option<&[u8]>,
    ) -> Result<Self> {
        let replica = DocumentReplica::new(session_id);
        if let Some(snapshot) = initial_snapshot {
            if let Err(err) = replica.seed(snapshot) {
                warn!(session = session_id, error = %err, "ignoring malformed initial snapshot");
            }
        }
        let awareness = crate::awareness::AwarenessRegistrar::new(session_id);
        let mut binding = EditingSurfaceBinding::attach(surface, replica, awareness, session_id);
        binding.announce_local_identity(user).context("announcing local identity")?;

        let undo = UndoScope::new(binding.replica(), binding.id(), config.undo_capture_timeout_ms);
        let reconciler =
            StalenessReconciler::new(Duration::from_millis(config.staleness_rpc_timeout_ms));

        let mut session =
            Self { config, binding, undo, reconciler, transport, destroyed: false };
        session.flush()?;
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn binding(&self) -> &EditingSurfaceBinding<S> {
        &self.binding
    }

    pub fn content(&self) -> String {
        self.binding.replica().text_content()
    }

    pub fn reconciler_stats(&self) -> ReconcilerStats {
        self.reconciler.stats()
    }

    /// An edit entered through the editing surface.
    pub fn local_edit(&mut self, edit: LocalEdit) -> Result<()> {
        self.binding.handle_local_edit(edit);
        self.flush()
    }

    /// A document update delivered by the transport. Seals the current
    /// undo group so the next local edit starts fresh.
    pub fn remote_update(&mut self, payload: &[u8]) -> Result<()> {
        let applied = self.binding.handle_remote_update(payload);
        self.undo.interrupt();
        self.flush()?;
        applied.context("applying remote update")
    }

    /// A presence payload delivered by the transport.
    pub fn remote_awareness(&mut self, payload: &[u8]) -> Result<PresenceDiff> {
        let applied = self.binding.handle_remote_awareness(payload);
        self.flush()?;
        applied.context("applying remote awareness")
    }

    /// The surface reported a selection change.
    pub fn selection_changed(&mut self) -> Result<()> {
        self.binding.local_selection_changed()?;
        self.flush()
    }

    /// Periodic presence GC at the configured idle timeout.
    pub fn evict_idle_peers(&mut self) -> PresenceDiff {
        let max_age = Duration::from_secs(self.config.presence_idle_timeout_secs);
        self.binding.evict_idle_peers(max_age)
    }

    pub fn undo(&mut self) -> Result<bool> {
        let undone = self.undo.undo(self.binding.replica());
        if undone {
            self.binding.refresh();
            self.flush()?;
        }
        Ok(undone)
    }

    pub fn redo(&mut self) -> Result<bool> {
        let redone = self.undo.redo(self.binding.replica());
        if redone {
            self.binding.refresh();
            self.flush()?;
        }
        Ok(redone)
    }

    /// Reconcile with the authoritative store (on reconnect or focus).
    ///
    /// On a stale verdict the fresh snapshot is merged into the live
    /// replica, and the merged result is published and queued for
    /// persistence so peers and the store converge on a state containing
    /// both sides. Local pending edits are never discarded.
    pub async fn sync_with_store(&mut self) -> Result<bool> {
        if self.destroyed {
            warn!("sync_with_store after destroy");
            return Ok(false);
        }

        let report = {
            let Self { binding, reconciler, transport, .. } = self;
            reconciler
                .check_for_staleness(binding.replica(), || transport.fetch_current_snapshot())
                .await
        };
        let Some(fresh_snapshot) = report.fresh_snapshot else {
            return Ok(false);
        };

        self.reconciler
            .apply_fresh_state(self.binding.replica(), &fresh_snapshot)
            .context("merging authoritative snapshot")?;
        self.undo.interrupt();
        self.binding.refresh();

        let session_id = self.binding.session_id();
        let snapshot = self.binding.replica().snapshot();
        let content = self.binding.replica().text_content();
        self.transport
            .publish_update(session_id, &snapshot)
            .context("publishing merged snapshot")?;
        if let Err(err) = self.transport.request_persist(&snapshot, &content) {
            warn!(session = session_id, error = %err, "best-effort persist failed");
        }
        self.flush()?;
        Ok(true)
    }

    /// Publish everything the binding has queued. A failing publish is
    /// logged and does not abandon the payloads behind it; the first
    /// failure is returned once the queue is drained.
    pub fn flush(&mut self) -> Result<()> {
        let session_id = self.binding.session_id();
        let mut first_failure: Option<anyhow::Error> = None;
        for payload in self.binding.take_outbound() {
            let result = match &payload {
                OutboundPayload::Document(bytes) => {
                    self.transport.publish_update(session_id, bytes)
                }
                OutboundPayload::Awareness(bytes) => {
                    self.transport.publish_awareness(session_id, bytes)
                }
            };
            if let Err(err) = result {
                warn!(session = session_id, error = %err, "publish failed; continuing drain");
                if first_failure.is_none() {
                    first_failure = Some(err.into());
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tear down: undo scope, then binding (awareness, then replica).
    /// Idempotent; a second call logs a warning.
    pub fn destroy(&mut self) {
        if self.destroyed {
            warn!("session destroyed twice");
            return;
        }
        self.destroyed = true;
        self.undo.destroy();
        self.binding.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}
