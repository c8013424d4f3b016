// Text-safe envelope for opaque update/snapshot bytes.
//
// Updates and snapshots stay opaque byte sequences everywhere in the
// engine; this codec exists only for transports that require text
// frames (JSON-RPC, SSE, copy-paste debugging).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::DecodeError;

/// Encode an opaque payload for a text-only channel.
pub fn encode_for_transport(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Decode a payload received over a text-only channel.
pub fn decode_from_transport(text: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(text.trim())?)
}
