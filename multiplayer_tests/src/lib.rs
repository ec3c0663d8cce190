// Test-only game peer for end-to-end session tests.
//
// Wraps the real `PeerClient` (from `wayfarer_session::client`) in a
// synchronous, test-friendly API: blocking "poll until this event" loops with
// a deadline, and a `pump` that keeps polling (and therefore heartbeating)
// for a while. All networking, handshake, leadership and replication logic
// is the same code the game uses; only the waiting is test-specific.
//
// A `TestPeer` that is not polled sends no heartbeats, which is how the
// scenarios simulate a peer that has silently stopped responding.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use wayfarer_protocol::{GameState, GameVersion, PeerId, SyncVersion, TicketId};
use wayfarer_session::client::{ClientEvent, PeerClient};
use wayfarer_session::config::SessionConfig;
use wayfarer_session::error::JoinError;
use wayfarer_session::server::{HostHandle, start_host};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Heartbeat interval used by test sessions. The timeout is three of these.
pub const TEST_HEARTBEAT_MS: u64 = 200;

/// Install a test logger once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Loopback session config with short timers.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        session_name: "integration-test".into(),
        game_version: GameVersion::new(2, 3, 0),
        heartbeat_interval_ms: TEST_HEARTBEAT_MS,
        heartbeat_timeout_multiplier: 3,
        vote_timeout_ms: 1_500,
        leadership_cooldown_ms: 0,
        max_peers: 4,
        handshake_timeout_ms: 2_000,
        save_dir: None,
    }
}

/// Start a host on a random port.
pub fn start_session(config: &SessionConfig) -> (HostHandle, SocketAddr) {
    init_logging();
    start_host(config.clone()).expect("start_host failed")
}

/// A test game peer wrapping a real `PeerClient`.
pub struct TestPeer {
    pub client: PeerClient,
    /// Every event this peer has polled, in order.
    pub history: Vec<ClientEvent>,
}

impl TestPeer {
    /// Join the session at `addr`, panicking on failure.
    pub fn join(addr: SocketAddr, name: &str, config: &SessionConfig) -> Self {
        Self::try_join(addr, name, config).expect("TestPeer::join failed")
    }

    pub fn try_join(
        addr: SocketAddr,
        name: &str,
        config: &SessionConfig,
    ) -> Result<Self, JoinError> {
        let client = PeerClient::join("127.0.0.1", addr.port(), name, config, None)?;
        Ok(Self::from_client(client))
    }

    /// Wrap a client joined some other way (e.g. with a character).
    pub fn from_client(client: PeerClient) -> Self {
        Self {
            client,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.client.id()
    }

    /// Poll once, recording and returning the new events.
    pub fn poll(&mut self) -> Vec<ClientEvent> {
        let events = self.client.poll();
        self.history.extend(events.iter().cloned());
        events
    }

    /// Keep polling for `duration`, returning everything seen.
    pub fn pump(&mut self, duration: Duration) -> Vec<ClientEvent> {
        let start = Instant::now();
        let mut seen = Vec::new();
        while start.elapsed() < duration {
            seen.extend(self.poll());
            thread::sleep(POLL_INTERVAL);
        }
        seen
    }

    /// Blocking poll until an event matches `pred`; returns that event.
    /// Only this peer is polled, so keep waits short when others must stay
    /// alive; `wait_until` polls a whole party.
    pub fn poll_until(
        &mut self,
        what: &str,
        pred: impl Fn(&ClientEvent) -> bool,
    ) -> ClientEvent {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {what}; history: {:?}",
                self.history
            );
            for event in self.poll() {
                if pred(&event) {
                    return event;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Whether any polled event so far matches `pred`.
    pub fn saw(&self, pred: impl Fn(&ClientEvent) -> bool) -> bool {
        self.history.iter().any(pred)
    }

    /// Whether a system notice containing `needle` has arrived.
    pub fn saw_notice(&self, needle: &str) -> bool {
        self.saw(|e| matches!(e, ClientEvent::System(text) if text.contains(needle)))
    }

    /// Whether a peer called `name` was announced as joining.
    pub fn saw_join(&self, name: &str) -> bool {
        self.saw(|e| matches!(e, ClientEvent::PeerJoined(info) if info.name == name))
    }

    /// Whether a chat line with exactly `text` has arrived.
    pub fn saw_chat(&self, text: &str) -> bool {
        self.saw(|e| matches!(e, ClientEvent::Chat { text: t, .. } if t == text))
    }

    pub fn vote(&mut self, ticket: TicketId, in_favor: bool) {
        self.client
            .cast_vote(ticket, in_favor)
            .expect("cast_vote failed");
    }

    pub fn publish(&mut self, state: GameState) -> SyncVersion {
        self.client.replicate(state).expect("replicate failed")
    }

    /// Send Goodbye and close the connection.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }
}

/// Poll every peer once.
pub fn poll_all(peers: &mut [&mut TestPeer]) {
    for peer in peers.iter_mut() {
        peer.poll();
    }
}

/// Poll every peer until `done` holds, keeping all of them alive meanwhile.
/// Panics after `POLL_TIMEOUT`.
pub fn wait_until(
    peers: &mut [&mut TestPeer],
    what: &str,
    done: impl Fn(&[&mut TestPeer]) -> bool,
) {
    let start = Instant::now();
    loop {
        poll_all(peers);
        if done(peers) {
            return;
        }
        assert!(
            start.elapsed() < POLL_TIMEOUT,
            "timed out waiting for {what}"
        );
        thread::sleep(POLL_INTERVAL);
    }
}

/// Poll every peer repeatedly for `duration`, keeping all of them alive.
pub fn pump_all(peers: &mut [&mut TestPeer], duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        poll_all(peers);
        thread::sleep(POLL_INTERVAL);
    }
}
