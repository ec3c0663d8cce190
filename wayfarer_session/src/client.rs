// Joining-peer client: one game process's link to the session coordinator.
//
// Every game in a session, the host's own included, talks to the coordinator
// through a `PeerClient`. Architecture follows the host side in miniature:
// - `join()` dials the coordinator and runs the handshake on the calling
//   thread (`handshake::perform_join`), then spawns a reader thread.
// - The reader thread decodes envelopes and pushes them into an `mpsc`
//   channel; on EOF or a bad frame it pushes the error and exits.
// - `poll()` drains the channel without blocking, applies each envelope to
//   the local replicas (roster, leader, sync state), and returns what
//   happened as `ClientEvent`s. It also drives the client's own heartbeat:
//   beats to the coordinator, and `SessionLost` if the coordinator stays
//   silent past the timeout.
// - Outbound calls write synchronously through the message bus, which also
//   stamps envelopes with this peer's id.
//
// The client never decides leadership; it mirrors what the coordinator
// announces. As leader it publishes state with `replicate`; as follower it
// accepts syncs only from the leader it currently recognizes. A leader also
// republishes its state whenever a peer joins, so late joiners catch up on
// the next version instead of waiting for a game-driven change.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use wayfarer_protocol::{
    ChangeCause, CharacterSnapshot, Envelope, GameState, LeadershipRequestError, LeaveReason,
    Message, MessageKind, PeerId, PeerInfo, SyncVersion, TicketId, decode,
};

use crate::bus::{HandlerResult, MessageBus, unix_millis};
use crate::collaborators::{GameStateProvider, PersonaPresenter};
use crate::config::SessionConfig;
use crate::connection::{ConnectionReader, connect};
use crate::error::{ClientError, JoinError};
use crate::handshake::perform_join;
use crate::heartbeat::HeartbeatMonitor;
use crate::registry::{MembershipRegistry, PeerRecord};
use crate::replication::SessionStateReplicator;
use crate::snapshot::{CharacterSnapshotStore, CharacterStore};

/// What `poll` observed, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    PeerJoined(PeerInfo),
    PeerLeft {
        peer_id: PeerId,
        name: String,
        reason: LeaveReason,
    },
    System(String),
    Chat {
        from: PeerId,
        name: String,
        text: String,
    },
    VoteRequested {
        ticket: TicketId,
        requester: PeerId,
        reason: String,
        timeout_ms: u64,
    },
    LeadershipDenied(LeadershipRequestError),
    LeaderChanged {
        leader: Option<PeerId>,
        previous_leader: Option<PeerId>,
        transferred: bool,
        cause: ChangeCause,
        ticket: Option<TicketId>,
        votes_for: u32,
        votes_against: u32,
    },
    /// A follower accepted a new shared state.
    StateUpdated(SyncVersion),
    /// As leader, adopted a loaded save and published it at this version.
    StateLoaded(SyncVersion),
    SessionLost,
}

type Inbound = Result<Envelope, ClientError>;

pub struct PeerClient {
    id: PeerId,
    session_name: String,
    bus: MessageBus,
    inbox: Receiver<Inbound>,
    _reader_thread: Option<JoinHandle<()>>,
    registry: MembershipRegistry,
    replicator: SessionStateReplicator,
    heartbeat: HeartbeatMonitor,
    last_heard: Instant,
    pending_vote: Option<TicketId>,
    provider: Option<Box<dyn GameStateProvider>>,
    presenter: Option<Box<dyn PersonaPresenter>>,
    lost: bool,
}

impl PeerClient {
    /// Join the session at `host:port` under a fresh peer id.
    pub fn join(
        host: &str,
        port: u16,
        name: &str,
        config: &SessionConfig,
        persona: Option<CharacterSnapshot>,
    ) -> Result<Self, JoinError> {
        Self::join_as(PeerId::generate(), host, port, name, config, persona)
    }

    /// Join as a stored character. The snapshot is imported through `store`
    /// (which applies the local version gate) and sent along with `Connect`,
    /// where the host checks it against its own version.
    pub fn join_with_character<S: CharacterStore>(
        host: &str,
        port: u16,
        name: &str,
        config: &SessionConfig,
        store: &CharacterSnapshotStore<S>,
        character_id: &str,
    ) -> Result<Self, JoinError> {
        let persona = store.import(character_id)?;
        Self::join(host, port, name, config, Some(persona))
    }

    /// Join with a caller-chosen peer id.
    pub fn join_as(
        id: PeerId,
        host: &str,
        port: u16,
        name: &str,
        config: &SessionConfig,
        persona: Option<CharacterSnapshot>,
    ) -> Result<Self, JoinError> {
        let mut conn = connect(host, port)?;
        let mut bus = MessageBus::new(id);
        let admission = perform_join(
            &mut conn,
            &mut bus,
            name,
            config.game_version,
            persona,
            config.handshake_timeout(),
        )?;
        log::info!(
            "joined {:?} as {id} with {} peers",
            admission.session_name,
            admission.roster.len()
        );

        let now = Instant::now();
        let mut registry = MembershipRegistry::new(config.max_peers);
        for info in &admission.roster {
            registry.insert_replica(PeerRecord::from_info(info, now));
        }
        let mut replicator = SessionStateReplicator::new(id);
        replicator.recognize_leader(admission.leader, admission.sync_version);

        let (reader, writer) = conn.split();
        bus.attach(PeerId::SESSION, writer);
        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || reader_loop(reader, tx));

        Ok(Self {
            id,
            session_name: admission.session_name,
            bus,
            inbox: rx,
            _reader_thread: Some(reader_thread),
            registry,
            replicator,
            heartbeat: HeartbeatMonitor::new(
                config.heartbeat_interval(),
                config.heartbeat_timeout_multiplier,
                now,
            ),
            last_heard: now,
            pending_vote: None,
            provider: None,
            presenter: None,
            lost: false,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn is_connected(&self) -> bool {
        !self.lost
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.replicator.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.replicator.is_leader()
    }

    pub fn is_host(&self) -> bool {
        self.registry.get(self.id).is_some_and(|r| r.is_host)
    }

    /// Local view of the roster, in join order.
    pub fn roster(&self) -> Vec<PeerInfo> {
        self.registry.infos()
    }

    pub fn sync_version(&self) -> SyncVersion {
        self.replicator.version()
    }

    pub fn state(&self) -> &GameState {
        self.replicator.state()
    }

    /// Ticket this peer has been asked to vote on, if any.
    pub fn pending_vote(&self) -> Option<TicketId> {
        self.pending_vote
    }

    pub fn set_state_provider(&mut self, provider: Box<dyn GameStateProvider>) {
        self.provider = Some(provider);
    }

    pub fn set_presenter(&mut self, presenter: Box<dyn PersonaPresenter>) {
        self.presenter = Some(presenter);
    }

    /// Run `handler` for every received envelope of `kind`, before the
    /// client applies it.
    pub fn subscribe<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&Envelope) -> HandlerResult + Send + 'static,
    {
        self.bus.subscribe(kind, handler);
    }

    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    fn send(&mut self, body: Message) -> Result<(), ClientError> {
        if self.lost {
            return Err(ClientError::SessionLost);
        }
        let envelope = self.bus.envelope(body);
        if self.bus.send_to(PeerId::SESSION, &envelope) {
            Ok(())
        } else {
            Err(ClientError::SessionLost)
        }
    }

    pub fn send_chat(&mut self, text: &str) -> Result<(), ClientError> {
        self.send(Message::Chat { text: text.into() })
    }

    pub fn request_leadership(&mut self, reason: &str) -> Result<(), ClientError> {
        self.send(Message::LeadershipRequest {
            reason: reason.into(),
        })
    }

    pub fn cast_vote(&mut self, ticket: TicketId, in_favor: bool) -> Result<(), ClientError> {
        self.send(Message::VoteCast { ticket, in_favor })
    }

    /// Host only; the coordinator refuses anyone else.
    pub fn force_leadership(
        &mut self,
        new_leader: PeerId,
        reason: &str,
    ) -> Result<(), ClientError> {
        self.send(Message::ForceLeadership {
            new_leader,
            reason: reason.into(),
        })
    }

    pub fn request_save(&mut self, slot: &str) -> Result<(), ClientError> {
        self.send(Message::SaveRequest { slot: slot.into() })
    }

    pub fn request_load(&mut self, slot: &str) -> Result<(), ClientError> {
        self.send(Message::LoadRequest { slot: slot.into() })
    }

    /// Leader only: publish `state` as the next version.
    pub fn replicate(&mut self, state: GameState) -> Result<SyncVersion, ClientError> {
        let body = self.replicator.replicate(state)?;
        self.send(body)?;
        Ok(self.replicator.version())
    }

    /// Leader only: publish whatever the state provider reports now.
    pub fn publish(&mut self) -> Result<SyncVersion, ClientError> {
        let state = match self.provider.as_mut() {
            Some(provider) => provider.current_state(),
            None => self.replicator.state().clone(),
        };
        self.replicate(state)
    }

    /// Say goodbye and close the link.
    pub fn disconnect(&mut self) {
        if !self.lost {
            let _ = self.send(Message::Goodbye);
        }
        self.lost = true;
        self.bus.close_all();
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    /// Drain received envelopes and run the heartbeat (non-blocking).
    pub fn poll(&mut self) -> Vec<ClientEvent> {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if self.lost {
            return events;
        }
        loop {
            match self.inbox.try_recv() {
                Ok(Ok(envelope)) => {
                    self.last_heard = now;
                    self.apply(envelope, &mut events);
                }
                Ok(Err(e)) => {
                    log::warn!("session link failed: {e}");
                    self.mark_lost(&mut events);
                    return events;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.mark_lost(&mut events);
                    return events;
                }
            }
        }

        let (beat, expired) = self.heartbeat.poll_link(self.last_heard, now);
        if expired {
            log::warn!(
                "coordinator silent for over {:?}",
                self.heartbeat.timeout()
            );
            self.mark_lost(&mut events);
        } else if beat
            && self
                .send(Message::Heartbeat {
                    timestamp_ms: unix_millis(),
                })
                .is_err()
        {
            self.mark_lost(&mut events);
        }
        events
    }

    fn mark_lost(&mut self, events: &mut Vec<ClientEvent>) {
        self.lost = true;
        self.bus.close_all();
        events.push(ClientEvent::SessionLost);
    }

    fn name_of(&self, id: PeerId) -> String {
        self.registry
            .get(id)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn apply(&mut self, envelope: Envelope, events: &mut Vec<ClientEvent>) {
        self.bus.dispatch(&envelope);
        let sender = envelope.sender;
        match envelope.body {
            Message::Heartbeat { .. } => {}
            Message::SystemMessage { text } => {
                if let Some(presenter) = self.presenter.as_mut() {
                    presenter.system_message(&text);
                }
                events.push(ClientEvent::System(text));
            }
            Message::Chat { text } => {
                let name = self.name_of(sender);
                if let Some(presenter) = self.presenter.as_mut() {
                    presenter.chat(&name, &text);
                }
                events.push(ClientEvent::Chat {
                    from: sender,
                    name,
                    text,
                });
            }
            Message::PeerJoined { peer } => {
                self.registry
                    .insert_replica(PeerRecord::from_info(&peer, self.last_heard));
                events.push(ClientEvent::PeerJoined(peer));
                if self.is_leader() {
                    if let Err(e) = self.publish() {
                        log::warn!("republish for new peer failed: {e}");
                    }
                }
            }
            Message::PeerLeft {
                peer_id,
                name,
                reason,
            } => {
                self.registry.remove(peer_id);
                events.push(ClientEvent::PeerLeft {
                    peer_id,
                    name,
                    reason,
                });
            }
            Message::LeadershipVoteRequest {
                ticket,
                requester,
                reason,
                timeout_ms,
            } => {
                if requester != self.id {
                    self.pending_vote = Some(ticket);
                }
                events.push(ClientEvent::VoteRequested {
                    ticket,
                    requester,
                    reason,
                    timeout_ms,
                });
            }
            Message::LeadershipRequestDenied { error } => {
                events.push(ClientEvent::LeadershipDenied(error));
            }
            Message::LeadershipChangeResult {
                ticket,
                leader,
                previous_leader,
                transferred,
                votes_for,
                votes_against,
                cause,
                sync_version,
                ..
            } => {
                if ticket.is_some() && ticket == self.pending_vote {
                    self.pending_vote = None;
                }
                self.registry.set_leader(leader);
                self.replicator.recognize_leader(leader, sync_version);
                events.push(ClientEvent::LeaderChanged {
                    leader,
                    previous_leader,
                    transferred,
                    cause,
                    ticket,
                    votes_for,
                    votes_against,
                });
            }
            Message::GameStateSync {
                sync_version,
                authoritative_peer_id,
                state,
            } => match self
                .replicator
                .apply(sync_version, authoritative_peer_id, state)
            {
                Ok(version) => {
                    if let Some(provider) = self.provider.as_mut() {
                        provider.apply_state(self.replicator.state());
                    }
                    events.push(ClientEvent::StateUpdated(version));
                }
                Err(e) => log::debug!("{e}"),
            },
            Message::StateLoad { state } => {
                if !self.is_leader() {
                    log::debug!("ignoring StateLoad: no longer leader");
                    return;
                }
                if let Some(provider) = self.provider.as_mut() {
                    provider.apply_state(&state);
                }
                match self.replicate(state) {
                    Ok(version) => events.push(ClientEvent::StateLoaded(version)),
                    Err(e) => log::warn!("publishing loaded state failed: {e}"),
                }
            }
            other => log::debug!("ignoring {:?} from {sender}", other.kind()),
        }
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        // Shutting the socket down also ends the reader thread.
        self.bus.close_all();
    }
}

/// Reader thread: decode frames in a loop, push them to the channel.
fn reader_loop(mut reader: ConnectionReader, tx: Sender<Inbound>) {
    loop {
        let inbound = match reader.receive() {
            Ok(bytes) => decode(&bytes).map_err(ClientError::from),
            Err(e) => Err(ClientError::from(e)),
        };
        let failed = inbound.is_err();
        if tx.send(inbound).is_err() || failed {
            break;
        }
    }
}
