// Error taxonomy for the replicated-document engine.
//
// Propagation policy:
// - `DecodeError` on remote input is returned to the caller and logged;
//   the replica keeps its last valid state.
// - `TransportError` is reported by the transport collaborator.
// - `StalenessCheckError` is swallowed (fail-open) but forwarded to an
//   error sink for observability.
// Teardown paths never return errors; misuse is a logged warning.

use std::time::Duration;

use thiserror::Error;

/// Malformed bytes on an apply/decode path.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed document update: {0}")]
    Update(String),
    #[error("malformed document snapshot: {0}")]
    Snapshot(String),
    #[error("malformed awareness payload: {0}")]
    Awareness(String),
    #[error("transport envelope is not valid base64: {0}")]
    Envelope(#[from] base64::DecodeError),
}

/// Failure reported by the transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("snapshot fetch failed: {0}")]
    Fetch(String),
    #[error("persist request failed: {0}")]
    Persist(String),
}

/// Failure during a staleness probe. Always fail-open: the probe
/// resolves non-stale and editing continues.
#[derive(Debug, Error)]
pub enum StalenessCheckError {
    #[error("authoritative snapshot fetch failed")]
    Rpc(#[source] TransportError),
    #[error("staleness probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("authoritative snapshot failed to decode")]
    Decode(#[source] DecodeError),
}
