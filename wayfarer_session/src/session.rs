// Session coordinator.
//
// `Session` is the one object that owns every coordination component for a
// running session: the handshake gate, the membership registry, the heartbeat
// monitor, the leadership authority, the coordinator's state replica, the
// outbound message bus and the save-slot collaborator. `server.rs` drives it
// from a single-threaded main loop, so every mutation of the roster,
// leadership and sync state is serialized through `&mut self` and a heartbeat
// expiry can never interleave with a leadership transition.
//
// Entry points (all take `now` so timing is injectable in tests):
// - `admit`: run the handshake verdict for a decoded `Connect`, register the
//   peer, send `Welcome`, announce the join.
// - `handle_envelope`: one frame from an admitted peer.
// - `remove_peer`: the peer's connection ended.
// - `on_tick`: heartbeat beat and sweep, vote deadline.
//
// Removal cascade: drop the record and its link, re-elect if it was leader
// (or re-check an open vote if it was a voter), then broadcast `PeerLeft`.
// Broadcasts that fail to reach a peer queue that peer for the same cascade,
// processed before the entry point returns.
//
// Relaying: chat and accepted state syncs are forwarded to every other peer
// as the original envelope, so sender id and message id survive. Everything
// the coordinator says itself is stamped with `PeerId::SESSION`.

use std::time::Instant;

use wayfarer_protocol::{
    ChangeCause, Envelope, GameState, LeaveReason, Message, MessageKind, PeerId, SyncVersion,
    TicketId, encode,
};

use crate::bus::{HandlerResult, MessageBus, unix_millis};
use crate::collaborators::SessionPersistence;
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionReader};
use crate::error::AdmissionError;
use crate::handshake::{HandshakeGate, JoinRequest};
use crate::heartbeat::HeartbeatMonitor;
use crate::leadership::{
    LeaderChange, LeadershipAuthority, LeadershipDecision, LeadershipState, VoteStatus,
};
use crate::registry::{MembershipRegistry, PeerRecord, RegistryError};
use crate::replication::SessionStateReplicator;

pub struct Session {
    name: String,
    gate: HandshakeGate,
    registry: MembershipRegistry,
    heartbeat: HeartbeatMonitor,
    leadership: LeadershipAuthority,
    replicator: SessionStateReplicator,
    bus: MessageBus,
    persistence: Box<dyn SessionPersistence>,
    /// Set once the first peer is admitted; the host role is never reassigned.
    host_assigned: bool,
    /// Peers whose link failed mid-call, removed before the call returns.
    dropped: Vec<PeerId>,
}

impl Session {
    pub fn new(
        config: &SessionConfig,
        persistence: Box<dyn SessionPersistence>,
        now: Instant,
    ) -> Self {
        Self {
            name: config.session_name.clone(),
            gate: HandshakeGate::new(config.game_version),
            registry: MembershipRegistry::new(config.max_peers),
            heartbeat: HeartbeatMonitor::new(
                config.heartbeat_interval(),
                config.heartbeat_timeout_multiplier,
                now,
            ),
            leadership: LeadershipAuthority::new(
                config.leadership_cooldown(),
                config.vote_timeout(),
            ),
            replicator: SessionStateReplicator::new(PeerId::SESSION),
            bus: MessageBus::new(PeerId::SESSION),
            persistence,
            host_assigned: false,
            dropped: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.registry.leader()
    }

    pub fn leadership_state(&self) -> LeadershipState {
        self.leadership.state(&self.registry)
    }

    pub fn open_ticket(&self) -> Option<TicketId> {
        self.leadership.ticket().map(|t| t.id)
    }

    /// Latest state version the coordinator has accepted and relayed.
    pub fn sync_version(&self) -> SyncVersion {
        self.replicator.version()
    }

    pub fn state(&self) -> &GameState {
        self.replicator.state()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Observe envelopes from peers on the coordinator side.
    pub fn subscribe<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&Envelope) -> HandlerResult + Send + 'static,
    {
        self.bus.subscribe(kind, handler);
    }

    /// When `on_tick` next has work.
    pub fn next_wakeup(&self) -> Instant {
        let beat = self.heartbeat.next_due();
        match self.leadership.next_deadline() {
            Some(deadline) => beat.min(deadline),
            None => beat,
        }
    }

    // -----------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------

    /// Finish the handshake for a connection whose `Connect` has been read.
    /// On success the write half is linked into the session and the read
    /// half handed back for a reader thread. On failure the joiner has been
    /// told why and the connection is closed.
    pub fn admit(
        &mut self,
        mut conn: Connection,
        request: JoinRequest,
        now: Instant,
    ) -> Result<ConnectionReader, AdmissionError> {
        let verdict = self.gate.check(&request);
        let reply = self.bus.envelope(HandshakeGate::verdict(&verdict));
        conn.send(&encode(&reply)?)?;
        if let Err(e) = verdict {
            log::info!("refused {} from {}: {e}", request.name, conn.peer_addr());
            conn.close();
            return Err(e);
        }

        let id = request.peer_id;
        if let Err(e) = self.register(&request, &conn, now) {
            log::info!("rejected {} from {}: {e}", request.name, conn.peer_addr());
            let rejected = self.bus.envelope(Message::Rejected {
                reason: e.to_string(),
            });
            if let Ok(bytes) = encode(&rejected) {
                let _ = conn.send(&bytes);
            }
            conn.close();
            return Err(e);
        }

        let welcome = self.bus.envelope(Message::Welcome {
            peer_id: id,
            session_name: self.name.clone(),
            roster: self.registry.infos(),
            leader: self.registry.leader(),
            sync_version: self.replicator.version(),
        });
        let sent = encode(&welcome)
            .map_err(AdmissionError::from)
            .and_then(|bytes| conn.send(&bytes).map_err(AdmissionError::from));
        if let Err(e) = sent {
            conn.close();
            self.drop_peer(id, LeaveReason::ConnectionClosed, now);
            self.reap(now);
            return Err(e);
        }

        let (reader, writer) = conn.split();
        self.bus.attach(id, writer);
        log::info!(
            "{} ({id}) joined from {}, {} of {} peers",
            request.name,
            reader.peer_addr(),
            self.registry.len(),
            self.registry.max_peers()
        );
        if let Some(info) = self.registry.get(id).map(PeerRecord::info) {
            self.broadcast_except(Some(id), Message::PeerJoined { peer: info });
        }
        self.broadcast(Message::SystemMessage {
            text: format!("{} joined the session", request.name),
        });
        self.reap(now);
        Ok(reader)
    }

    /// Put a version-checked joiner on the roster. The first one is host and
    /// leads straight away.
    fn register(
        &mut self,
        request: &JoinRequest,
        conn: &Connection,
        now: Instant,
    ) -> Result<(), AdmissionError> {
        if request.peer_id.is_session() {
            return Err(AdmissionError::DuplicatePeer(request.peer_id));
        }
        let is_host = !self.host_assigned;
        let record = PeerRecord {
            id: request.peer_id,
            name: request.name.clone(),
            game_version: request.game_version,
            protocol_version: request.protocol_version,
            address: Some(conn.peer_addr()),
            is_host,
            is_leader: false,
            connected: true,
            last_heartbeat: now,
            join_order: 0,
            character_id: request.persona.as_ref().map(|p| p.character_id.clone()),
        };
        self.registry.add(record).map_err(|e| match e {
            RegistryError::Full { max } => AdmissionError::SessionFull { max },
            RegistryError::Duplicate(id) | RegistryError::SecondHost(id) => {
                AdmissionError::DuplicatePeer(id)
            }
        })?;
        if is_host {
            self.host_assigned = true;
            self.leadership.init(request.peer_id, &mut self.registry);
            self.replicator
                .recognize_leader(Some(request.peer_id), self.replicator.version());
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    /// Process one envelope read from `from`'s connection.
    pub fn handle_envelope(&mut self, from: PeerId, envelope: Envelope, now: Instant) {
        if !self.registry.contains(from) {
            // Frames still in flight from a peer we already removed.
            return;
        }
        self.registry.touch(from, now);
        if envelope.sender != from {
            log::warn!(
                "{from} sent an envelope claiming to be {}; dropping it",
                envelope.sender
            );
            self.drop_peer(from, LeaveReason::ProtocolMismatch, now);
            self.reap(now);
            return;
        }
        self.bus.dispatch(&envelope);

        match &envelope.body {
            Message::Heartbeat { .. } => log::debug!("heartbeat from {from}"),
            Message::Chat { .. } => self.relay(from, &envelope),
            Message::LeadershipRequest { reason } => {
                self.on_leadership_request(from, reason.clone(), now)
            }
            Message::VoteCast { ticket, in_favor } => self.on_vote(from, *ticket, *in_favor, now),
            Message::ForceLeadership { new_leader, reason } => {
                self.on_force(from, *new_leader, reason.clone(), now)
            }
            Message::GameStateSync {
                sync_version,
                authoritative_peer_id,
                state,
            } => {
                if *authoritative_peer_id != from {
                    log::debug!(
                        "{from} relayed a sync authored by {authoritative_peer_id}; dropped"
                    );
                } else {
                    match self.replicator.apply(*sync_version, from, state.clone()) {
                        Ok(version) => {
                            log::debug!("relaying state version {} from {from}", version.0);
                            self.relay(from, &envelope);
                        }
                        Err(e) => log::debug!("{e}"),
                    }
                }
            }
            Message::SaveRequest { slot } => self.on_save(from, slot),
            Message::LoadRequest { slot } => self.on_load(from, slot),
            Message::Goodbye => self.drop_peer(from, LeaveReason::Goodbye, now),
            other => {
                log::warn!("unexpected {:?} from {from}; dropping peer", other.kind());
                self.drop_peer(from, LeaveReason::ProtocolMismatch, now);
            }
        }
        self.reap(now);
    }

    fn on_leadership_request(&mut self, from: PeerId, reason: String, now: Instant) {
        match self
            .leadership
            .request_leadership(from, reason, &self.registry, now)
        {
            Ok(request) => {
                let text = format!("{} asks to lead: {}", self.name_of(from), request.reason);
                self.broadcast(Message::LeadershipVoteRequest {
                    ticket: request.ticket,
                    requester: request.requester,
                    reason: request.reason,
                    timeout_ms: request.timeout.as_millis() as u64,
                });
                self.broadcast(Message::SystemMessage { text });
            }
            Err(error) => {
                log::info!("leadership request from {from} denied: {error}");
                self.send_to(from, Message::LeadershipRequestDenied { error });
            }
        }
    }

    fn on_vote(&mut self, from: PeerId, ticket: TicketId, in_favor: bool, now: Instant) {
        match self
            .leadership
            .cast_vote(from, ticket, in_favor, &mut self.registry, now)
        {
            Ok(VoteStatus::Decided(decision)) => self.announce_decision(decision),
            Ok(VoteStatus::Recorded) => {}
            Ok(VoteStatus::AlreadyVoted) => {
                log::debug!("{from} already voted on ticket {}", ticket.0)
            }
            Err(e) => log::debug!("vote from {from} ignored: {e}"),
        }
    }

    fn on_force(&mut self, from: PeerId, new_leader: PeerId, reason: String, now: Instant) {
        match self.leadership.force_leadership_change(
            from,
            new_leader,
            &reason,
            &mut self.registry,
            now,
        ) {
            Ok(change) => self.announce_change(change, ChangeCause::Forced { reason }),
            Err(error) => {
                log::info!("forced leadership change from {from} denied: {error}");
                self.send_to(from, Message::LeadershipRequestDenied { error });
            }
        }
    }

    fn is_host(&self, id: PeerId) -> bool {
        self.registry.get(id).is_some_and(|r| r.is_host)
    }

    fn on_save(&mut self, from: PeerId, slot: &str) {
        if !self.is_host(from) {
            self.send_to(
                from,
                Message::SystemMessage {
                    text: "only the host can save the session".into(),
                },
            );
            return;
        }
        match self.persistence.save(slot, self.replicator.state()) {
            Ok(()) => self.broadcast(Message::SystemMessage {
                text: format!(
                    "session saved to slot {slot} (state version {})",
                    self.replicator.version().0
                ),
            }),
            Err(e) => {
                log::warn!("save to slot {slot} failed: {e}");
                self.send_to(
                    from,
                    Message::SystemMessage {
                        text: format!("save failed: {e}"),
                    },
                );
            }
        }
    }

    fn on_load(&mut self, from: PeerId, slot: &str) {
        if !self.is_host(from) {
            self.send_to(
                from,
                Message::SystemMessage {
                    text: "only the host can load a save".into(),
                },
            );
            return;
        }
        let state = match self.persistence.load(slot) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("load from slot {slot} failed: {e}");
                self.send_to(
                    from,
                    Message::SystemMessage {
                        text: format!("load failed: {e}"),
                    },
                );
                return;
            }
        };
        let Some(leader) = self.registry.leader() else {
            return;
        };
        self.send_to(leader, Message::StateLoad { state });
        self.broadcast(Message::SystemMessage {
            text: format!("loading slot {slot}"),
        });
    }

    // -----------------------------------------------------------------
    // Removal and timers
    // -----------------------------------------------------------------

    /// A peer's connection ended or must be dropped.
    pub fn remove_peer(&mut self, id: PeerId, reason: LeaveReason, now: Instant) {
        self.drop_peer(id, reason, now);
        self.reap(now);
    }

    fn drop_peer(&mut self, id: PeerId, reason: LeaveReason, now: Instant) {
        let Some(record) = self.registry.remove(id) else {
            return;
        };
        self.bus.detach(id);
        log::info!("{} ({id}) left: {reason:?}", record.name);

        if record.is_leader {
            let change = self.leadership.re_elect(Some(id), &mut self.registry);
            self.announce_change(change, ChangeCause::Reelection);
        } else if let Some(decision) = self
            .leadership
            .finalize_if_complete(&mut self.registry, now)
        {
            self.announce_decision(decision);
        }

        self.broadcast(Message::PeerLeft {
            peer_id: id,
            name: record.name.clone(),
            reason,
        });
        self.broadcast(Message::SystemMessage {
            text: format!("{} left the session", record.name),
        });
    }

    /// Remove every peer whose link failed during this call.
    fn reap(&mut self, now: Instant) {
        while let Some(id) = self.dropped.pop() {
            self.drop_peer(id, LeaveReason::ConnectionClosed, now);
        }
    }

    /// Heartbeat and vote-deadline work due at `now`.
    pub fn on_tick(&mut self, now: Instant) {
        let tick = self.heartbeat.poll(&self.registry, now);
        if tick.send_beat {
            self.broadcast(Message::Heartbeat {
                timestamp_ms: unix_millis(),
            });
        }
        for id in tick.expired {
            log::warn!(
                "{id} silent for over {:?}; removing",
                self.heartbeat.timeout()
            );
            self.drop_peer(id, LeaveReason::HeartbeatTimeout, now);
        }
        if let Some(decision) = self.leadership.poll_timeout(&mut self.registry, now) {
            self.announce_decision(decision);
        }
        self.reap(now);
    }

    /// Tell everyone the session is over and close every link.
    pub fn shutdown(&mut self) {
        self.broadcast(Message::SystemMessage {
            text: "the host closed the session".into(),
        });
        self.dropped.clear();
        self.bus.close_all();
    }

    // -----------------------------------------------------------------
    // Announcements
    // -----------------------------------------------------------------

    fn announce_decision(&mut self, d: LeadershipDecision) {
        if d.transferred {
            self.replicator
                .recognize_leader(d.leader, self.replicator.version());
        }
        let text = if d.transferred {
            format!(
                "{} is now the leader ({} for, {} against)",
                self.name_of(d.requester),
                d.votes_for,
                d.votes_against
            )
        } else {
            format!(
                "{}'s leadership request was rejected ({} for, {} against)",
                self.name_of(d.requester),
                d.votes_for,
                d.votes_against
            )
        };
        self.broadcast(Message::LeadershipChangeResult {
            ticket: Some(d.ticket),
            requester: Some(d.requester),
            leader: d.leader,
            previous_leader: d.previous_leader,
            transferred: d.transferred,
            votes_for: d.votes_for,
            votes_against: d.votes_against,
            cause: ChangeCause::Vote,
            sync_version: self.replicator.version(),
        });
        self.broadcast(Message::SystemMessage { text });
    }

    fn announce_change(&mut self, change: LeaderChange, cause: ChangeCause) {
        self.replicator
            .recognize_leader(change.leader, self.replicator.version());
        let text = match change.leader {
            Some(leader) => format!("{} is now the leader", self.name_of(leader)),
            None => "the session has no leader".into(),
        };
        self.broadcast(Message::LeadershipChangeResult {
            ticket: change.cancelled_ticket,
            requester: None,
            leader: change.leader,
            previous_leader: change.previous_leader,
            transferred: change.leader != change.previous_leader,
            votes_for: 0,
            votes_against: 0,
            cause,
            sync_version: self.replicator.version(),
        });
        self.broadcast(Message::SystemMessage { text });
    }

    fn name_of(&self, id: PeerId) -> String {
        self.registry
            .get(id)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    fn broadcast(&mut self, body: Message) {
        self.broadcast_except(None, body);
    }

    fn broadcast_except(&mut self, except: Option<PeerId>, body: Message) {
        let envelope = self.bus.envelope(body);
        let failed = self.bus.broadcast_except(except, &envelope);
        self.dropped.extend(failed);
    }

    fn send_to(&mut self, peer: PeerId, body: Message) {
        let envelope = self.bus.envelope(body);
        if !self.bus.send_to(peer, &envelope) && self.registry.contains(peer) {
            self.dropped.push(peer);
        }
    }

    /// Forward a peer's own envelope to everyone else.
    fn relay(&mut self, from: PeerId, envelope: &Envelope) {
        let failed = self.bus.broadcast_except(Some(from), envelope);
        self.dropped.extend(failed);
    }
}
