// Integration smoke test for the session host.
//
// Starts a host on localhost, joins two `PeerClient`s, and walks the basic
// lifecycle: handshake, join notice, chat relay, a state sync from the leader,
// a version-refused joiner, and graceful disconnect.
//
// Everything runs over real loopback TCP through the public API; there is no
// game simulation involved, only `GameState` values built by hand.

use std::thread;
use std::time::{Duration, Instant};

use wayfarer_protocol::{GameState, GameVersion, Position};
use wayfarer_session::client::{ClientEvent, PeerClient};
use wayfarer_session::config::SessionConfig;
use wayfarer_session::error::JoinError;
use wayfarer_session::server::start_host;

fn config() -> SessionConfig {
    SessionConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        session_name: "smoke-test".into(),
        game_version: GameVersion::new(1, 4, 0),
        heartbeat_interval_ms: 1_000,
        ..SessionConfig::default()
    }
}

/// Poll until `pred` matches one of the client's events. Returns everything
/// seen up to and including that event.
fn wait_for(
    client: &mut PeerClient,
    what: &str,
    pred: impl Fn(&ClientEvent) -> bool,
) -> Vec<ClientEvent> {
    let start = Instant::now();
    let mut seen = Vec::new();
    loop {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for {what}; saw {seen:?}"
        );
        for event in client.poll() {
            let hit = pred(&event);
            seen.push(event);
            if hit {
                return seen;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn full_session_lifecycle() {
    // 1. Host on a random port.
    let cfg = config();
    let (handle, addr) = start_host(cfg.clone()).unwrap();

    // 2. The host's own game joins first and leads.
    let mut alice = PeerClient::join("127.0.0.1", addr.port(), "Alice", &cfg, None).unwrap();
    assert_eq!(alice.session_name(), "smoke-test");
    assert!(alice.is_host());
    assert!(alice.is_leader());

    // 3. A second game with a different minor version joins.
    let bob_cfg = SessionConfig {
        game_version: GameVersion::new(1, 1, 7),
        ..cfg.clone()
    };
    let mut bob = PeerClient::join("127.0.0.1", addr.port(), "Bob", &bob_cfg, None).unwrap();
    assert!(!bob.is_leader());
    assert_eq!(bob.leader(), Some(alice.id()));
    assert_eq!(bob.roster().len(), 2);

    let bob_id = bob.id();
    wait_for(&mut alice, "Bob's join", |e| {
        matches!(e, ClientEvent::PeerJoined(p) if p.id == bob_id)
    });

    // 4. Chat is relayed with the sender's name.
    bob.send_chat("hello there").unwrap();
    let events = wait_for(&mut alice, "chat", |e| matches!(e, ClientEvent::Chat { .. }));
    match events.last() {
        Some(ClientEvent::Chat { from, name, text }) => {
            assert_eq!(*from, bob_id);
            assert_eq!(name, "Bob");
            assert_eq!(text, "hello there");
        }
        other => panic!("expected Chat, got {other:?}"),
    }

    // 5. The leader publishes state; Bob adopts it.
    let mut state = GameState {
        world: "meadow".into(),
        ..GameState::default()
    };
    state.positions.insert(alice.id(), Position { x: 4, y: 1 });
    let version = alice.replicate(state.clone()).unwrap();
    wait_for(&mut bob, "state sync", |e| {
        matches!(e, ClientEvent::StateUpdated(v) if *v >= version)
    });
    assert_eq!(bob.state().world, "meadow");
    assert_eq!(bob.state().positions, state.positions);

    // 6. A follower can't publish.
    assert!(bob.replicate(GameState::default()).is_err());

    // 7. A joiner from another major version is refused with a reason.
    let old_cfg = SessionConfig {
        game_version: GameVersion::new(0, 9, 0),
        ..cfg.clone()
    };
    match PeerClient::join("127.0.0.1", addr.port(), "Old", &old_cfg, None) {
        Err(JoinError::IncompatibleVersion { reason }) => {
            assert!(reason.contains("0.9.0"), "{reason}")
        }
        Err(other) => panic!("expected IncompatibleVersion, got {other}"),
        Ok(_) => panic!("incompatible joiner was admitted"),
    }

    // 8. Bob says goodbye; Alice sees him leave.
    bob.disconnect();
    wait_for(&mut alice, "Bob's departure", |e| {
        matches!(e, ClientEvent::PeerLeft { peer_id, .. } if *peer_id == bob_id)
    });
    assert_eq!(alice.roster().len(), 1);

    // 9. Stopping the host ends Alice's session.
    handle.stop();
    wait_for(&mut alice, "session loss", |e| {
        matches!(e, ClientEvent::SessionLost)
    });
    assert!(!alice.is_connected());
}
