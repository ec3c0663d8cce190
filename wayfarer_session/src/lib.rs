// wayfarer_session — peer-to-peer session coordination for Wayfarer.
//
// Lets several independent game processes act as one shared session without
// a dedicated server. The host process runs the coordinator (`Session`,
// driven by `start_host`); every game, the host's own included, joins it as a
// `PeerClient` over TCP. The coordinator owns the authoritative roster and
// leadership; the leader's game owns the shared state and the coordinator
// relays it.
//
// Module overview, leaves first:
// - `connection.rs`:    TCP dial/listen, framed send/receive, bounded inbound.
// - `bus.rs`:           envelope stamping, broadcast/send_to, handler dispatch
//                       with failure isolation.
// - `handshake.rs`:     version gate for new connections, both ends.
// - `registry.rs`:      `MembershipRegistry` of `PeerRecord`s.
// - `heartbeat.rs`:     beat schedule and silence detection.
// - `leadership.rs`:    `LeadershipAuthority`: init, votes, re-election,
//                       forced changes.
// - `replication.rs`:   `SessionStateReplicator`: leader-only publish,
//                       versioned follower apply.
// - `snapshot.rs`:      `CharacterSnapshotStore` with the same version gate.
// - `collaborators.rs`: traits the game implements (state provider,
//                       presenter, save slots).
// - `session.rs`:       `Session`, the coordinator that owns all of the above.
// - `server.rs`:        host threads and main event loop (`start_host`).
// - `client.rs`:        `PeerClient`, the joining side.
// - `config.rs`, `error.rs`: `SessionConfig` and the error enums.
//
// Dependencies: `wayfarer_protocol` for messages and framing; `log` for
// diagnostics (the `host` binary installs `env_logger`). No async runtime:
// plain `std::net` with a thread per reader and one owning thread per
// session.

pub mod bus;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod leadership;
pub mod registry;
pub mod replication;
pub mod server;
pub mod session;
pub mod snapshot;

pub use client::{ClientEvent, PeerClient};
pub use config::SessionConfig;
pub use server::{HostHandle, start_host};
pub use session::Session;
