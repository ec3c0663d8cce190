// Envelope codec: JSON bodies tagged with a wire version.
//
// Decoding is two-pass. The first pass reads only `wire_version` (serde
// ignores every other field), so a frame from an incompatible build fails as
// `ProtocolError::VersionMismatch` instead of as a confusing body error. The
// second pass decodes the full envelope.

use serde::Deserialize;

use crate::error::ProtocolError;
use crate::message::Envelope;

/// Wire format revision. Bump on any breaking change to `Envelope` or
/// `Message`.
pub const WIRE_VERSION: u16 = 1;

#[derive(Deserialize)]
struct WireHeader {
    wire_version: u16,
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(envelope).map_err(ProtocolError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let header: WireHeader = serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)?;
    if header.wire_version != WIRE_VERSION {
        return Err(ProtocolError::VersionMismatch {
            found: header.wire_version,
            expected: WIRE_VERSION,
        });
    }
    serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::types::{MessageId, PeerId};

    fn heartbeat() -> Envelope {
        Envelope {
            wire_version: WIRE_VERSION,
            message_id: MessageId(7),
            sender: PeerId::generate(),
            timestamp_ms: 1_700_000_000_000,
            body: Message::Heartbeat {
                timestamp_ms: 1_700_000_000_000,
            },
        }
    }

    #[test]
    fn decode_returns_what_encode_wrote() {
        let env = heartbeat();
        let bytes = encode(&env).unwrap();
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn future_wire_version_fails_fast() {
        // A future body shape this build can't parse, under a newer tag.
        let bytes = br#"{"wire_version":2,"body":{"Teleport":{"to":"moon"}}}"#;
        match decode(bytes) {
            Err(ProtocolError::VersionMismatch { found, expected }) => {
                assert_eq!(found, 2);
                assert_eq!(expected, WIRE_VERSION);
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn unknown_body_under_current_version_is_malformed() {
        let mut value = serde_json::to_value(heartbeat()).unwrap();
        value["body"] = serde_json::json!({"Teleport": {"to": "moon"}});
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(decode(&bytes), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(matches!(
            decode(b"\x00\x01garbage"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
