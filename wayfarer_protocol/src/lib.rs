// wayfarer_protocol — wire protocol for peer-to-peer game sessions.
//
// This crate defines the identifiers, message types, framing and envelope
// codec shared by every participant in a session: the coordinator running in
// the host process and each joining peer (`wayfarer_session`). It has no
// networking or threading of its own.
//
// Module overview:
// - `types.rs`:    `PeerId`, `MessageId`, `TicketId`, `SyncVersion`,
//                  `GameVersion` and its major-version compatibility rule.
// - `message.rs`:  `Envelope` and the closed `Message` union, plus payload
//                  structs (`PeerInfo`, `GameState`, `CharacterSnapshot`).
// - `framing.rs`:  4-byte big-endian length prefix over any `Read`/`Write`.
// - `codec.rs`:    JSON envelope encoding with a wire-version gate.
// - `error.rs`:    `ProtocolError`, `LeadershipRequestError`.
//
// Design decisions:
// - **JSON bodies.** Human-readable on the wire and cheap to debug; the
//   framing layer doesn't care, so a binary codec can replace `codec.rs`
//   without touching anything else.
// - **Game state is data, not behavior.** `GameState` and snapshot payloads
//   are carried, versioned and compared but never simulated here.

pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use codec::{WIRE_VERSION, decode, encode};
pub use error::{LeadershipRequestError, ProtocolError};
pub use framing::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{
    ChangeCause, CharacterSnapshot, Envelope, GameState, LeaveReason, Message, MessageKind,
    PeerInfo, Position,
};
pub use types::{GameVersion, MessageId, PeerId, SyncVersion, TicketId};

/// Protocol revision advertised in `Connect`.
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Encode, frame, unframe and decode one message.
    fn through_the_wire(body: Message) -> Message {
        let env = Envelope {
            wire_version: WIRE_VERSION,
            message_id: MessageId(1),
            sender: PeerId::generate(),
            timestamp_ms: 42,
            body,
        };
        let mut wire = Vec::new();
        write_frame(&mut wire, &encode(&env).unwrap()).unwrap();
        let bytes = read_frame(&mut Cursor::new(wire)).unwrap().unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.sender, env.sender);
        back.body
    }

    #[test]
    fn connect_with_persona_survives_the_wire() {
        let owner = PeerId::generate();
        let body = Message::Connect {
            name: "Wren".into(),
            game_version: GameVersion::new(1, 2, 0),
            protocol_version: PROTOCOL_VERSION,
            persona: Some(CharacterSnapshot {
                character_id: "c-1".into(),
                owner_peer_id: owner,
                creation_time: 1000,
                game_version: GameVersion::new(1, 0, 0),
                payload: serde_json::json!({"class": "ranger", "level": 4}),
            }),
        };
        assert_eq!(through_the_wire(body.clone()), body);
    }

    #[test]
    fn state_sync_keeps_peer_keyed_positions() {
        let a = PeerId::generate();
        let mut state = GameState {
            world: "forest".into(),
            in_combat: true,
            combat_participants: vec![a],
            ..GameState::default()
        };
        state.positions.insert(a, Position { x: 3, y: -2 });
        state
            .shared_objects
            .insert("chest-1".into(), serde_json::json!({"open": false}));
        let body = Message::GameStateSync {
            sync_version: SyncVersion(9),
            authoritative_peer_id: a,
            state,
        };
        assert_eq!(through_the_wire(body.clone()), body);
    }

    #[test]
    fn denial_carries_typed_error() {
        let body = Message::LeadershipRequestDenied {
            error: LeadershipRequestError::Cooldown { remaining_ms: 1500 },
        };
        assert_eq!(through_the_wire(body.clone()), body);
    }

    #[test]
    fn change_result_with_forced_cause() {
        let body = Message::LeadershipChangeResult {
            ticket: None,
            requester: None,
            leader: Some(PeerId::generate()),
            previous_leader: Some(PeerId::generate()),
            transferred: true,
            votes_for: 0,
            votes_against: 0,
            cause: ChangeCause::Forced {
                reason: "host override".into(),
            },
            sync_version: SyncVersion(12),
        };
        assert_eq!(through_the_wire(body.clone()), body);
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Message::Goodbye.kind(), MessageKind::Goodbye);
        assert_eq!(
            Message::VoteCast {
                ticket: TicketId(1),
                in_favor: true
            }
            .kind(),
            MessageKind::VoteCast
        );
    }
}
