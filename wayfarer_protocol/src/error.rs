// Protocol-level error types.
//
// `ProtocolError` covers decoding failures: a frame with an unknown wire
// version fails fast as `VersionMismatch` before the body is touched, and a
// frame that parses as the right version but not as an `Envelope` is
// `Malformed`. Either way the connection it arrived on is torn down.
//
// `LeadershipRequestError` travels on the wire (inside
// `LeadershipRequestDenied`) so the requester sees why it was refused.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame carries a wire version this build does not speak.
    #[error("protocol mismatch: wire version {found} (expected {expected})")]
    VersionMismatch { found: u16, expected: u16 },

    /// Frame is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Reasons a leadership request or override is refused.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LeadershipRequestError {
    #[error("requester is already the leader")]
    AlreadyLeader,

    #[error("another leadership request is in progress")]
    RequestInProgress,

    #[error("leadership changed recently; retry in {remaining_ms} ms")]
    Cooldown { remaining_ms: u64 },

    #[error("peer is not a member of this session")]
    NotAMember,

    #[error("only the host may do that")]
    NotHost,
}
