// Transport contract: the external collaborator that moves opaque bytes
// between sessions and the authoritative store.
//
// The engine never sees a wire format. Implementations publish payloads
// drained from a binding, deliver peer payloads back into it, and answer
// the reconciler's snapshot RPC. In production this sits on a relay
// connection; in tests it is an in-memory hub.

use std::future::Future;

use coauthor_common::error::TransportError;
use coauthor_common::types::SessionId;

pub trait CollabTransport {
    /// Publish an outbound document update. Called for every payload the
    /// binding classifies outbound; never for a remote-origin update.
    fn publish_update(&mut self, session_id: SessionId, payload: &[u8])
        -> Result<(), TransportError>;

    /// Publish an outbound presence payload.
    fn publish_awareness(
        &mut self,
        session_id: SessionId,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Fetch the authoritative persisted snapshot. The engine's only
    /// suspension point; the reconciler bounds it with a timeout.
    fn fetch_current_snapshot(
        &mut self,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + '_;

    /// Best-effort durable write of a snapshot plus its materialized
    /// content. Failures are logged by the caller, never fatal.
    fn request_persist(&mut self, snapshot: &[u8], content: &str) -> Result<(), TransportError>;
}
