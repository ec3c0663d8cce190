// Error types for the session layer.
//
// One enum per concern, each mapped to how the caller is expected to react:
// - `ConnectionError`: the byte stream is gone or unusable. The owning peer is
//   removed from the roster; nothing else is affected.
// - `AdmissionError`: a join attempt is refused. The joiner gets a reason
//   string and its connection is closed; the session is untouched.
// - `VoteError` / `ReplicationError`: rejected leadership votes and state
//   syncs. Usually logged and dropped at the call site.
// - `SnapshotError` / `PersistenceError`: local disk stores.
// - `JoinError` / `ClientError`: what a joining game sees.
//
// `LeadershipRequestError` lives in the protocol crate because it is sent back
// to the requester on the wire.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use wayfarer_protocol::{GameVersion, MessageKind, PeerId, ProtocolError, SyncVersion, TicketId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Peer closed or reset the stream, or we closed it ourselves.
    #[error("connection closed")]
    Closed,

    /// Length prefix over `MAX_FRAME_SIZE`; the stream can't be resynced.
    #[error("frame exceeds size limit")]
    FrameTooLarge,

    #[error("inbound connection limit of {max} reached")]
    AtCapacity { max: usize },

    #[error("connection i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Fold the error kinds that just mean "the other side went away" into
    /// `Closed`.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => ConnectionError::Closed,
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                ConnectionError::FrameTooLarge
            }
            _ => ConnectionError::Io(err),
        }
    }
}

/// Why a join attempt was refused.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("incompatible version: {reason}")]
    IncompatibleVersion { reason: String },

    #[error("session is full ({max} peers)")]
    SessionFull { max: u32 },

    #[error("peer {0} is already in the session")]
    DuplicatePeer(PeerId),

    #[error("expected Connect, got {0:?}")]
    UnexpectedMessage(MessageKind),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum VoteError {
    #[error("no leadership vote is open")]
    NoTicket,

    #[error("vote names ticket {cast:?} but ticket {open:?} is open")]
    StaleTicket { cast: TicketId, open: TicketId },

    #[error("a requester cannot vote on its own ticket")]
    OwnTicket,

    #[error("voter is not a member of this session")]
    NotAMember,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("only the current leader may replicate state")]
    NotLeader,

    /// Outdated or wrong-authority sync. Dropped without touching local state.
    #[error(
        "stale sync ignored: version {received:?} from {authority} (local {local:?}, leader {leader:?})"
    )]
    StaleSyncIgnored {
        received: SyncVersion,
        local: SyncVersion,
        authority: PeerId,
        leader: Option<PeerId>,
    },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("character {0} not found")]
    NotFound(String),

    #[error("character {character_id} was saved by {found}, incompatible with {expected}")]
    IncompatibleVersion {
        character_id: String,
        found: GameVersion,
        expected: GameVersion,
    },

    #[error("snapshot store i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot encoding error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("no save directory configured")]
    Disabled,

    #[error("save slot name {0:?} is not allowed")]
    InvalidSlot(String),

    #[error("save slot {0:?} not found")]
    SlotNotFound(String),

    #[error("save i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("save encoding error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why `PeerClient::join` failed.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("host rejected our version: {reason}")]
    IncompatibleVersion { reason: String },

    #[error("host rejected the join: {reason}")]
    Rejected { reason: String },

    #[error("unexpected {0:?} during handshake")]
    UnexpectedMessage(MessageKind),

    #[error("could not load character: {0}")]
    Character(#[from] SnapshotError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors from a joined `PeerClient`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error("session connection lost")]
    SessionLost,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
