// Session protocol messages.
//
// Every frame on the wire is one `Envelope`: a small header (wire version,
// sender, message id, timestamp) around a `Message` body. `Message` is the
// closed set of everything peers and the coordinator say to each other; the
// session crate dispatches on it with `match` and the message bus keys its
// handler table on `MessageKind`.
//
// Game state and character personas travel as `GameState` and
// `CharacterSnapshot`. The coordinator never interprets their contents beyond
// the version gate on snapshots; the game simulation owns their meaning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LeadershipRequestError;
use crate::types::{GameVersion, MessageId, PeerId, SyncVersion, TicketId};

/// One framed unit of the protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Codec format tag, checked before the body is decoded.
    pub wire_version: u16,
    pub message_id: MessageId,
    pub sender: PeerId,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub body: Message,
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Every message peers and the coordinator exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Join request, first frame on a new connection.
    Connect {
        name: String,
        game_version: GameVersion,
        protocol_version: u32,
        persona: Option<CharacterSnapshot>,
    },
    /// Handshake verdict on version compatibility.
    VersionCheck {
        compatible: bool,
        reason: Option<String>,
    },
    /// Admission complete; the joiner's view of the session.
    Welcome {
        peer_id: PeerId,
        session_name: String,
        roster: Vec<PeerInfo>,
        leader: Option<PeerId>,
        sync_version: SyncVersion,
    },
    /// Admission refused for a reason other than version.
    Rejected { reason: String },
    PeerJoined { peer: PeerInfo },
    PeerLeft {
        peer_id: PeerId,
        name: String,
        reason: LeaveReason,
    },
    /// Liveness beacon.
    Heartbeat { timestamp_ms: u64 },
    /// Coordinator notice rendered to players.
    SystemMessage { text: String },
    /// Player chat, relayed to every peer.
    Chat { text: String },
    /// Ask the session to make the sender leader.
    LeadershipRequest { reason: String },
    /// Sent only to the requester when a leadership request is refused.
    LeadershipRequestDenied { error: LeadershipRequestError },
    /// A vote is open on `ticket`.
    LeadershipVoteRequest {
        ticket: TicketId,
        requester: PeerId,
        reason: String,
        timeout_ms: u64,
    },
    VoteCast { ticket: TicketId, in_favor: bool },
    /// Outcome of a vote, a re-election or a forced change.
    LeadershipChangeResult {
        ticket: Option<TicketId>,
        requester: Option<PeerId>,
        leader: Option<PeerId>,
        previous_leader: Option<PeerId>,
        transferred: bool,
        votes_for: u32,
        votes_against: u32,
        cause: ChangeCause,
        /// Latest state version the coordinator has relayed. A new leader
        /// resumes numbering above this.
        sync_version: SyncVersion,
    },
    /// Host-only: move leadership without a vote.
    ForceLeadership { new_leader: PeerId, reason: String },
    /// Leader-authored replacement of the shared state.
    GameStateSync {
        sync_version: SyncVersion,
        authoritative_peer_id: PeerId,
        state: GameState,
    },
    /// A saved state handed to the current leader to adopt.
    StateLoad { state: GameState },
    /// Host-only: persist the session state under `slot`.
    SaveRequest { slot: String },
    /// Host-only: restore the session state from `slot`.
    LoadRequest { slot: String },
    /// Graceful leave.
    Goodbye,
}

/// Fieldless mirror of `Message`, used as the dispatch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Connect,
    VersionCheck,
    Welcome,
    Rejected,
    PeerJoined,
    PeerLeft,
    Heartbeat,
    SystemMessage,
    Chat,
    LeadershipRequest,
    LeadershipRequestDenied,
    LeadershipVoteRequest,
    VoteCast,
    LeadershipChangeResult,
    ForceLeadership,
    GameStateSync,
    StateLoad,
    SaveRequest,
    LoadRequest,
    Goodbye,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Connect { .. } => MessageKind::Connect,
            Message::VersionCheck { .. } => MessageKind::VersionCheck,
            Message::Welcome { .. } => MessageKind::Welcome,
            Message::Rejected { .. } => MessageKind::Rejected,
            Message::PeerJoined { .. } => MessageKind::PeerJoined,
            Message::PeerLeft { .. } => MessageKind::PeerLeft,
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::SystemMessage { .. } => MessageKind::SystemMessage,
            Message::Chat { .. } => MessageKind::Chat,
            Message::LeadershipRequest { .. } => MessageKind::LeadershipRequest,
            Message::LeadershipRequestDenied { .. } => MessageKind::LeadershipRequestDenied,
            Message::LeadershipVoteRequest { .. } => MessageKind::LeadershipVoteRequest,
            Message::VoteCast { .. } => MessageKind::VoteCast,
            Message::LeadershipChangeResult { .. } => MessageKind::LeadershipChangeResult,
            Message::ForceLeadership { .. } => MessageKind::ForceLeadership,
            Message::GameStateSync { .. } => MessageKind::GameStateSync,
            Message::StateLoad { .. } => MessageKind::StateLoad,
            Message::SaveRequest { .. } => MessageKind::SaveRequest,
            Message::LoadRequest { .. } => MessageKind::LoadRequest,
            Message::Goodbye => MessageKind::Goodbye,
        }
    }
}

/// Public identity of a session member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub game_version: GameVersion,
    pub is_host: bool,
    pub is_leader: bool,
    /// Admission order; lower joined earlier.
    pub join_order: u64,
    pub character_id: Option<String>,
}

/// Why a peer left the roster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    Goodbye,
    ConnectionClosed,
    HeartbeatTimeout,
    ProtocolMismatch,
}

/// What produced a leadership change result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeCause {
    /// Outcome of a `LeadershipVoteRequest`, either way.
    Vote,
    /// Leader disconnected; successor picked without a vote.
    Reelection,
    /// Host override; carries the audit reason.
    Forced { reason: String },
}

/// Grid position of a peer's avatar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// Shared session state owned by the leader. Replaced wholesale on every
/// accepted sync.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    /// Which world/area the party is in.
    pub world: String,
    pub positions: BTreeMap<PeerId, Position>,
    /// Game-defined objects, opaque to the session layer.
    pub shared_objects: BTreeMap<String, serde_json::Value>,
    pub in_combat: bool,
    pub combat_participants: Vec<PeerId>,
}

/// Exported character persona.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    pub character_id: String,
    pub owner_peer_id: PeerId,
    /// Milliseconds since the Unix epoch.
    pub creation_time: u64,
    pub game_version: GameVersion,
    pub payload: serde_json::Value,
}
