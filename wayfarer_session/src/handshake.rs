// Handshake gate: version-compatibility admission for new connections.
//
// Protocol, acceptor side:
//   1. joiner sends `Connect{name, game_version, protocol_version, persona}`
//   2. acceptor replies `VersionCheck{compatible, reason}`
//   3. incompatible: connection closed right after the reply, nothing
//      registered. Compatible: the session registers the peer and follows
//      with `Welcome` (or `Rejected` if the roster can't take it).
//
// Compatibility is the major-version rule from `GameVersion`. A persona
// brought along in `Connect` goes through the same rule against the host's
// version, since the snapshot store would refuse it on import anyway.
//
// The joiner side (`perform_join`) drives the same exchange from the other
// end and turns the replies into `JoinError`s.

use std::time::Duration;

use wayfarer_protocol::{
    CharacterSnapshot, Envelope, GameVersion, Message, PROTOCOL_VERSION, PeerId, PeerInfo,
    SyncVersion, decode, encode,
};

use crate::bus::MessageBus;
use crate::connection::Connection;
use crate::error::{AdmissionError, JoinError};
use crate::snapshot::check_persona_version;

/// A decoded `Connect`.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinRequest {
    pub peer_id: PeerId,
    pub name: String,
    pub game_version: GameVersion,
    pub protocol_version: u32,
    pub persona: Option<CharacterSnapshot>,
}

pub struct HandshakeGate {
    game_version: GameVersion,
}

impl HandshakeGate {
    pub fn new(game_version: GameVersion) -> Self {
        Self { game_version }
    }

    pub fn game_version(&self) -> GameVersion {
        self.game_version
    }

    /// Read the first frame of a new connection and require it to be
    /// `Connect`.
    pub fn receive_connect(
        conn: &mut Connection,
        timeout: Duration,
    ) -> Result<JoinRequest, AdmissionError> {
        conn.set_read_timeout(Some(timeout))?;
        let envelope = decode(&conn.receive()?)?;
        conn.set_read_timeout(None)?;
        Self::parse_connect(envelope)
    }

    pub fn parse_connect(envelope: Envelope) -> Result<JoinRequest, AdmissionError> {
        let kind = envelope.kind();
        match envelope.body {
            Message::Connect {
                name,
                game_version,
                protocol_version,
                persona,
            } => Ok(JoinRequest {
                peer_id: envelope.sender,
                name,
                game_version,
                protocol_version,
                persona,
            }),
            _ => Err(AdmissionError::UnexpectedMessage(kind)),
        }
    }

    /// Apply the version rule to the joiner and to any persona it carries.
    pub fn check(&self, request: &JoinRequest) -> Result<(), AdmissionError> {
        if !self.game_version.is_compatible_with(&request.game_version) {
            return Err(AdmissionError::IncompatibleVersion {
                reason: format!(
                    "game version {} is incompatible with host version {}",
                    request.game_version, self.game_version
                ),
            });
        }
        if let Some(persona) = &request.persona {
            check_persona_version(self.game_version, persona).map_err(|e| {
                AdmissionError::IncompatibleVersion {
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }

    /// The `VersionCheck` reply for a `check` result.
    pub fn verdict(result: &Result<(), AdmissionError>) -> Message {
        match result {
            Ok(()) => Message::VersionCheck {
                compatible: true,
                reason: None,
            },
            Err(e) => Message::VersionCheck {
                compatible: false,
                reason: Some(match e {
                    AdmissionError::IncompatibleVersion { reason } => reason.clone(),
                    other => other.to_string(),
                }),
            },
        }
    }
}

/// What a joiner learns from a successful handshake.
#[derive(Clone, Debug)]
pub struct Admission {
    pub session_name: String,
    pub roster: Vec<PeerInfo>,
    pub leader: Option<PeerId>,
    pub sync_version: SyncVersion,
}

/// Joiner side: send `Connect` and wait for `VersionCheck` then `Welcome`.
pub fn perform_join(
    conn: &mut Connection,
    bus: &mut MessageBus,
    name: &str,
    game_version: GameVersion,
    persona: Option<CharacterSnapshot>,
    timeout: Duration,
) -> Result<Admission, JoinError> {
    conn.set_read_timeout(Some(timeout))?;
    let connect = bus.envelope(Message::Connect {
        name: name.to_string(),
        game_version,
        protocol_version: PROTOCOL_VERSION,
        persona,
    });
    conn.send(&encode(&connect)?)?;

    let admission = loop {
        let envelope = decode(&conn.receive()?)?;
        match envelope.body {
            Message::VersionCheck {
                compatible: true, ..
            } => continue,
            Message::VersionCheck {
                compatible: false,
                reason,
            } => {
                conn.close();
                return Err(JoinError::IncompatibleVersion {
                    reason: reason.unwrap_or_else(|| "incompatible version".into()),
                });
            }
            Message::Rejected { reason } => {
                conn.close();
                return Err(JoinError::Rejected { reason });
            }
            Message::Welcome {
                session_name,
                roster,
                leader,
                sync_version,
                ..
            } => {
                break Admission {
                    session_name,
                    roster,
                    leader,
                    sync_version,
                };
            }
            other => return Err(JoinError::UnexpectedMessage(other.kind())),
        }
    };
    conn.set_read_timeout(None)?;
    Ok(admission)
}
