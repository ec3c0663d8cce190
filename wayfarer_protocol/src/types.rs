// Core ID and version types for the session protocol.
//
// These are lightweight newtypes shared by `message.rs` (wire messages) and
// the session crate (`wayfarer_session`). `PeerId` is generated once per
// process at start-up and never changes; the other counters are assigned by
// whichever side originates the value (message ids per sender, ticket ids by
// the coordinator, sync versions by the current leader).
//
// `GameVersion` is a `major.minor.patch` triple serialized as a string. The
// compatibility rule shared by the handshake gate and the character snapshot
// store lives here: major components must match exactly, minor and patch may
// differ.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, process-unique peer identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Reserved sender id for envelopes originated by the session coordinator
    /// itself rather than by a game peer.
    pub const SESSION: PeerId = PeerId(Uuid::nil());

    /// Fresh random id. Call once at process start.
    pub fn generate() -> Self {
        PeerId(Uuid::new_v4())
    }

    pub fn is_session(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_session() {
            return f.write_str("session");
        }
        // The first block is plenty for log lines.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Per-sender monotonic envelope id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

/// Coordinator-assigned id of one leadership vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketId(pub u64);

/// Version counter of the replicated session state.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SyncVersion(pub u64);

impl SyncVersion {
    pub fn next(self) -> Self {
        SyncVersion(self.0 + 1)
    }
}

/// Semantic game version, e.g. `1.4.2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GameVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl GameVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Major components must match; minor and patch may differ.
    pub fn is_compatible_with(&self, other: &GameVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for GameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned when a version string is not `major[.minor[.patch]]`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid game version '{0}'")]
pub struct ParseVersionError(pub String);

impl FromStr for GameVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let mut next = |required: bool| -> Result<u32, ParseVersionError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| ParseVersionError(s.to_string())),
                None if required => Err(ParseVersionError(s.to_string())),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(ParseVersionError(s.to_string()));
        }
        Ok(GameVersion::new(major, minor, patch))
    }
}

impl TryFrom<String> for GameVersion {
    type Error = ParseVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GameVersion> for String {
    fn from(v: GameVersion) -> String {
        v.to_string()
    }
}
