// Update origin tags.
//
// Every update carries an explicit origin so downstream consumers can
// make the two decisions that keep a session loop-free: whether an
// update may leave the session (publish), and whether it belongs to the
// local undo history (record). Comparing tags is a value comparison,
// never an object-identity check.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use yrs::Origin;

use crate::types::BindingId;

const LOCAL_TAG: &str = "local";
const REMOTE_TAG: &str = "remote";
const BOUND_PREFIX: &str = "bound:";

/// Provenance of a document update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", tag = "kind", content = "binding")]
pub enum UpdateOrigin {
    /// Locally authored outside the editing surface: undo/redo replays
    /// and programmatic seeds. Outbound-eligible, never undo-recorded.
    Local,
    /// Ingested from a peer or the authoritative store. Never re-published.
    Remote,
    /// Authored through the one editing-surface binding for this replica.
    BoundTo(BindingId),
}

impl UpdateOrigin {
    /// Compact string form used as the yrs transaction origin.
    pub fn encode(&self) -> String {
        match self {
            Self::Local => LOCAL_TAG.to_string(),
            Self::Remote => REMOTE_TAG.to_string(),
            Self::BoundTo(id) => format!("{BOUND_PREFIX}{id}"),
        }
    }

    pub fn parse(s: &str) -> Result<Self, OriginTagParseError> {
        match s {
            LOCAL_TAG => Ok(Self::Local),
            REMOTE_TAG => Ok(Self::Remote),
            other => {
                let raw = other
                    .strip_prefix(BOUND_PREFIX)
                    .ok_or_else(|| OriginTagParseError::UnknownTag(other.to_string()))?;
                let id = BindingId::parse(raw)
                    .ok_or_else(|| OriginTagParseError::InvalidBindingId(raw.to_string()))?;
                Ok(Self::BoundTo(id))
            }
        }
    }

    /// Transaction origin for the yrs document this update mutates.
    pub fn to_txn_origin(&self) -> Origin {
        Origin::from(self.encode().as_str())
    }

    /// Whether an update with this origin may be published to the
    /// transport. `Remote` updates never are — that is the echo guard.
    pub fn is_outbound(&self) -> bool {
        !matches!(self, Self::Remote)
    }

    /// Whether this update was authored through the given binding.
    pub fn is_bound_to(&self, binding: &BindingId) -> bool {
        matches!(self, Self::BoundTo(id) if id == binding)
    }
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginTagParseError {
    #[error("unknown origin tag: {0:?}")]
    UnknownTag(String),
    #[error("origin tag carries an invalid binding id: {0:?}")]
    InvalidBindingId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_tags_round_trip_through_string_form() {
        let tags =
            [UpdateOrigin::Local, UpdateOrigin::Remote, UpdateOrigin::BoundTo(BindingId::new())];
        for tag in tags {
            let encoded = tag.encode();
            let decoded = UpdateOrigin::parse(&encoded).expect("encoded tag should parse");
            assert_eq!(decoded, tag);
        }
    }

    #[test]
    fn parse_rejects_unknown_and_malformed_tags() {
        assert_eq!(
            UpdateOrigin::parse("upstream"),
            Err(OriginTagParseError::UnknownTag("upstream".to_string()))
        );
        assert_eq!(
            UpdateOrigin::parse("bound:garbage"),
            Err(OriginTagParseError::InvalidBindingId("garbage".to_string()))
        );
    }

    #[test]
    fn only_remote_updates_are_suppressed_from_publish() {
        assert!(UpdateOrigin::Local.is_outbound());
        assert!(UpdateOrigin::BoundTo(BindingId::new()).is_outbound());
        assert!(!UpdateOrigin::Remote.is_outbound());
    }

    #[test]
    fn bound_to_matches_only_its_own_binding() {
        let mine = BindingId::new();
        let other = BindingId::new();
        let tag = UpdateOrigin::BoundTo(mine);

        assert!(tag.is_bound_to(&mine));
        assert!(!tag.is_bound_to(&other));
        assert!(!UpdateOrigin::Local.is_bound_to(&mine));
        assert!(!UpdateOrigin::Remote.is_bound_to(&mine));
    }
}
