// Staleness detection and reconciliation against the authoritative store.
//
// After a disconnect or multi-writer drift, a replica may be missing
// durable content. The reconciler detects that with a non-mutating trial
// merge on a throwaway replica, and merges the authoritative snapshot
// into the live replica tagged `Remote` — so it is neither re-published
// nor undo-recorded, and concurrent local work survives the merge.
//
// Every failure path fails open: a staleness probe must never block
// editing. Swallowed errors are logged and forwarded to the error sink.

use std::cell::Cell;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use coauthor_common::error::{DecodeError, StalenessCheckError, TransportError};

use crate::replica::DocumentReplica;

/// Client id for throwaway trial-merge replicas. Trial replicas never
/// author updates, so the id never reaches a peer.
const TRIAL_SESSION_ID: u64 = 0;

/// Outcome of one staleness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessReport {
    pub stale: bool,
    /// The authoritative snapshot, present only when `stale`.
    pub fresh_snapshot: Option<Vec<u8>>,
}

impl StalenessReport {
    fn not_stale() -> Self {
        Self { stale: false, fresh_snapshot: None }
    }
}

/// Probe counters, exposed for instrumentation and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub checks: u64,
    pub trial_merges: u64,
    pub stale_hits: u64,
}

type ErrorSink = Box<dyn Fn(&StalenessCheckError)>;

pub struct StalenessReconciler {
    rpc_timeout: Duration,
    stats: Cell<ReconcilerStats>,
    error_sink: Option<ErrorSink>,
}

impl StalenessReconciler {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout, stats: Cell::new(ReconcilerStats::default()), error_sink: None }
    }

    /// Route swallowed probe failures somewhere observable.
    pub fn with_error_sink(mut self, sink: impl Fn(&StalenessCheckError) + 'static) -> Self {
        self.error_sink = Some(Box::new(sink));
        self
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats.get()
    }

    /// Decide whether the replica is missing durable content.
    ///
    /// Fast path first: a byte-identical authoritative snapshot needs no
    /// trial merge. Otherwise a throwaway replica materializes content
    /// before and after merging the store's snapshot; only new content
    /// marks the replica stale — a client that is equal or ahead is not.
    pub async fn check_for_staleness<F, Fut>(
        &self,
        replica: &DocumentReplica,
        fetch: F,
    ) -> StalenessReport
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, TransportError>>,
    {
        self.bump(|stats| stats.checks += 1);

        let fetched = match tokio::time::timeout(self.rpc_timeout, fetch()).await {
            Err(_) => {
                self.report(StalenessCheckError::Timeout(self.rpc_timeout));
                return StalenessReport::not_stale();
            }
            Ok(Err(err)) => {
                self.report(StalenessCheckError::Rpc(err));
                return StalenessReport::not_stale();
            }
            Ok(Ok(payload)) => payload,
        };

        let local = replica.snapshot();
        if fetched == local {
            debug!(session = replica.session_id(), "staleness fast path: snapshots identical");
            return StalenessReport::not_stale();
        }

        self.bump(|stats| stats.trial_merges += 1);
        match self.trial_merge(&local, &fetched) {
            Ok(true) => {
                self.bump(|stats| stats.stale_hits += 1);
                debug!(session = replica.session_id(), "replica is missing durable content");
                StalenessReport { stale: true, fresh_snapshot: Some(fetched) }
            }
            Ok(false) => StalenessReport::not_stale(),
            Err(err) => {
                self.report(StalenessCheckError::Decode(err));
                StalenessReport::not_stale()
            }
        }
    }

    /// Merge the authoritative snapshot into the live replica.
    ///
    /// Tagged `Remote`, so the delta is never re-published and never
    /// recorded by the undo scope; CRDT merge preserves concurrent local
    /// edits alongside the newly merged content.
    pub fn apply_fresh_state(
        &self,
        replica: &DocumentReplica,
        fresh_snapshot: &[u8],
    ) -> Result<(), DecodeError> {
        replica.apply_remote_update(fresh_snapshot)
    }

    /// Materialize content before and after merging the authoritative
    /// snapshot on a throwaway replica. The live replica is untouched.
    fn trial_merge(&self, local: &[u8], fetched: &[u8]) -> Result<bool, DecodeError> {
        let scratch = DocumentReplica::new(TRIAL_SESSION_ID);
        scratch.seed(local)?;
        let content_before = scratch.text_content();

        scratch
            .apply_remote_update(fetched)
            .map_err(|err| match err {
                DecodeError::Update(msg) => DecodeError::Snapshot(msg),
                other => other,
            })?;
        let content_after = scratch.text_content();

        Ok(content_after != content_before)
    }

    fn bump(&self, apply: impl FnOnce(&mut ReconcilerStats)) {
        let mut stats = self.stats.get();
        apply(&mut stats);
        self.stats.set(stats);
    }

    fn report(&self, err: StalenessCheckError) {
        warn!(error = %err, "staleness check failed open");
        if let Some(sink) = &self.error_sink {
            sink(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use coauthor_common::origin::UpdateOrigin;
    use crate::replica::LocalEdit;

    fn insert(replica: &DocumentReplica, index: u32, text: &str) {
        replica
            .apply_edit(&UpdateOrigin::Local, &LocalEdit::Insert { index, text: text.to_string() });
    }

    fn reconciler() -> StalenessReconciler {
        StalenessReconciler::new(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn identical_snapshot_takes_the_fast_path() {
        let replica = DocumentReplica::new(1);
        insert(&replica, 0, "settled");
        let stored = replica.snapshot();

        let reconciler = reconciler();
        let report = reconciler.check_for_staleness(&replica, || async move { Ok(stored) }).await;

        assert!(!report.stale);
        assert_eq!(report.fresh_snapshot, None);
        let stats = reconciler.stats();
        assert_eq!(stats.checks, 1);
        // Fast path means the trial-merge branch never ran.
        assert_eq!(stats.trial_merges, 0);
    }

    #[tokio::test]
    async fn unseen_store_content_marks_the_replica_stale() {
        // A peer wrote "Hello" and persisted; this replica is still empty.
        let peer = DocumentReplica::new(2);
        insert(&peer, 0, "Hello");
        let stored = peer.snapshot();

        let replica = DocumentReplica::new(1);
        let reconciler = reconciler();
        let fetched = stored.clone();
        let report = reconciler.check_for_staleness(&replica, || async move { Ok(fetched) }).await;

        assert!(report.stale);
        assert_eq!(report.fresh_snapshot, Some(stored));
        let stats = reconciler.stats();
        assert_eq!(stats.trial_merges, 1);
        assert_eq!(stats.stale_hits, 1);
    }

    #[tokio::test]
    async fn a_client_ahead_of_the_store_is_not_stale() {
        let replica = DocumentReplica::new(1);
        insert(&replica, 0, "persisted");
        let stored = replica.snapshot();
        // Local keeps typing after the last persist.
        insert(&replica, 9, " plus unsaved");

        let reconciler = reconciler();
        let report = reconciler.check_for_staleness(&replica, || async move { Ok(stored) }).await;

        assert!(!report.stale);
        assert_eq!(reconciler.stats().trial_merges, 1);
        assert_eq!(replica.text_content(), "persisted plus unsaved");
    }

    #[tokio::test]
    async fn rpc_failure_fails_open_and_reaches_the_sink() {
        let replica = DocumentReplica::new(1);
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let reconciler = StalenessReconciler::new(Duration::from_secs(1))
            .with_error_sink(move |err| sink.borrow_mut().push(err.to_string()));

        let report = reconciler
            .check_for_staleness(&replica, || async {
                Err(TransportError::Fetch("relay unreachable".to_string()))
            })
            .await;

        assert!(!report.stale);
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].contains("fetch failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn a_hung_rpc_times_out_and_fails_open() {
        let replica = DocumentReplica::new(1);
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let reconciler = StalenessReconciler::new(Duration::from_millis(100))
            .with_error_sink(move |err| sink.borrow_mut().push(err.to_string()));

        let report = reconciler
            .check_for_staleness(&replica, || async {
                std::future::pending::<Result<Vec<u8>, TransportError>>().await
            })
            .await;

        assert!(!report.stale);
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].contains("timed out"));
    }

    #[tokio::test]
    async fn garbage_store_snapshot_fails_open() {
        let replica = DocumentReplica::new(1);
        insert(&replica, 0, "local work");
        let seen = Rc::new(RefCell::new(0usize));
        let sink = Rc::clone(&seen);
        let reconciler = StalenessReconciler::new(Duration::from_secs(1))
            .with_error_sink(move |_| *sink.borrow_mut() += 1);

        let report = reconciler
            .check_for_staleness(&replica, || async { Ok(b"not a snapshot".to_vec()) })
            .await;

        assert!(!report.stale);
        assert_eq!(*seen.borrow(), 1);
        assert_eq!(replica.text_content(), "local work");
    }

    #[tokio::test]
    async fn apply_fresh_state_preserves_both_sides() {
        // Replica holds unseen local content; the store holds unseen
        // remote content. After the merge both survive.
        let replica = DocumentReplica::new(1);
        insert(&replica, 0, "local-only ");

        let peer = DocumentReplica::new(2);
        insert(&peer, 0, "store-only");
        let stored = peer.snapshot();

        let reconciler = reconciler();
        let fetched = stored.clone();
        let report = reconciler.check_for_staleness(&replica, || async move { Ok(fetched) }).await;
        assert!(report.stale);

        reconciler
            .apply_fresh_state(&replica, &report.fresh_snapshot.expect("stale implies snapshot"))
            .expect("fresh snapshot should apply");

        let merged = replica.text_content();
        assert!(merged.contains("local-only"));
        assert!(merged.contains("store-only"));
    }

    #[tokio::test]
    async fn fresh_state_is_tagged_remote_on_the_live_replica() {
        let replica = DocumentReplica::new(1);
        let peer = DocumentReplica::new(2);
        insert(&peer, 0, "durable");

        let seen: Rc<RefCell<Vec<UpdateOrigin>>> = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        replica.subscribe(move |_, origin| log.borrow_mut().push(*origin));

        reconciler().apply_fresh_state(&replica, &peer.snapshot()).expect("should apply");
        assert_eq!(seen.borrow().as_slice(), &[UpdateOrigin::Remote]);
    }
}
