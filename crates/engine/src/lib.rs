// coauthor-engine: the replicated-document engine.
//
// One session owns one `DocumentReplica` plus one `AwarenessRegistrar`,
// wired to its editing surface by an `EditingSurfaceBinding`. Cross-
// session coordination happens solely through opaque byte payloads over
// the transport; convergence comes from CRDT merge, not coordination.

pub mod awareness;
pub mod binding;
pub mod reconcile;
pub mod replica;
pub mod session;
pub mod transport;
pub mod undo;
