// Session state replication: leader-authored, versioned, wholesale.
//
// Every participant holds one `SessionStateReplicator`. The current leader
// calls `replicate` to publish a new `GameState`; everyone else feeds incoming
// `GameStateSync` bodies to `apply`. A sync is accepted only when its
// `authoritative_peer_id` is the locally recognized leader and its version is
// strictly greater than the local one. Accepted syncs replace the local state
// in full; there is no field-level merge.
//
// Versions are one global counter for the whole session. When leadership
// moves, the coordinator announces the latest version it has relayed and
// every replicator raises its floor to it (`recognize_leader`), so the new
// leader's first sync is numbered above anything the old leader sent and
// followers keep seeing strictly increasing versions across epochs.
//
// The coordinator runs a replicator too, with `PeerId::SESSION` as its local
// id. It never replicates; it applies the leader's syncs to validate them
// before relaying, and keeps the result for host saves.

use wayfarer_protocol::{GameState, Message, PeerId, SyncVersion};

use crate::error::ReplicationError;

/// Local copy of the shared state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncState {
    pub version: SyncVersion,
    /// Leader that authored `state`; `None` before the first sync.
    pub authoritative_peer_id: Option<PeerId>,
    pub state: GameState,
}

pub struct SessionStateReplicator {
    local_id: PeerId,
    leader: Option<PeerId>,
    current: SyncState,
}

impl SessionStateReplicator {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            leader: None,
            current: SyncState::default(),
        }
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.local_id)
    }

    pub fn version(&self) -> SyncVersion {
        self.current.version
    }

    pub fn current(&self) -> &SyncState {
        &self.current
    }

    pub fn state(&self) -> &GameState {
        &self.current.state
    }

    /// Adopt a new leader. `baseline` is the latest version the session has
    /// seen; the local counter never drops below it.
    ///
    /// A peer that loses leadership may hold a version of its own the
    /// session never accepted (published while the change was in flight).
    /// That version is rolled back to `baseline` and the state marked as
    /// unauthored, so the new leader's first sync is not mistaken for stale.
    pub fn recognize_leader(&mut self, leader: Option<PeerId>, baseline: SyncVersion) {
        let demoted = self.is_leader() && leader != Some(self.local_id);
        self.leader = leader;
        if demoted && self.current.version > baseline {
            log::debug!(
                "dropping unaccepted local version {} for baseline {}",
                self.current.version.0,
                baseline.0
            );
            self.current.version = baseline;
            self.current.authoritative_peer_id = None;
        }
        if baseline > self.current.version {
            self.current.version = baseline;
        }
    }

    /// Leader only: take `state` as the new shared state and return the
    /// `GameStateSync` body to broadcast.
    pub fn replicate(&mut self, state: GameState) -> Result<Message, ReplicationError> {
        if !self.is_leader() {
            return Err(ReplicationError::NotLeader);
        }
        let version = self.current.version.next();
        self.current = SyncState {
            version,
            authoritative_peer_id: Some(self.local_id),
            state: state.clone(),
        };
        Ok(Message::GameStateSync {
            sync_version: version,
            authoritative_peer_id: self.local_id,
            state,
        })
    }

    /// Follower side. On success the local state is replaced and the new
    /// version returned; otherwise nothing changes.
    pub fn apply(
        &mut self,
        sync_version: SyncVersion,
        authority: PeerId,
        state: GameState,
    ) -> Result<SyncVersion, ReplicationError> {
        if self.leader != Some(authority) || sync_version <= self.current.version {
            return Err(ReplicationError::StaleSyncIgnored {
                received: sync_version,
                local: self.current.version,
                authority,
                leader: self.leader,
            });
        }
        self.current = SyncState {
            version: sync_version,
            authoritative_peer_id: Some(authority),
            state,
        };
        Ok(sync_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(world: &str) -> GameState {
        GameState {
            world: world.into(),
            ..GameState::default()
        }
    }

    #[test]
    fn only_leader_replicates() {
        let me = PeerId::generate();
        let mut rep = SessionStateReplicator::new(me);
        assert_eq!(
            rep.replicate(state("x")),
            Err(ReplicationError::NotLeader)
        );
        rep.recognize_leader(Some(me), SyncVersion(0));
        match rep.replicate(state("x")).unwrap() {
            Message::GameStateSync {
                sync_version,
                authoritative_peer_id,
                ..
            } => {
                assert_eq!(sync_version, SyncVersion(1));
                assert_eq!(authoritative_peer_id, me);
            }
            other => panic!("expected GameStateSync, got {other:?}"),
        }
        assert_eq!(rep.version(), SyncVersion(1));
        assert_eq!(rep.state().world, "x");
    }

    #[test]
    fn follower_accepts_increasing_versions_from_leader() {
        let leader = PeerId::generate();
        let mut rep = SessionStateReplicator::new(PeerId::generate());
        rep.recognize_leader(Some(leader), SyncVersion(0));

        assert_eq!(
            rep.apply(SyncVersion(1), leader, state("a")),
            Ok(SyncVersion(1))
        );
        assert_eq!(
            rep.apply(SyncVersion(3), leader, state("b")),
            Ok(SyncVersion(3))
        );
        assert!(rep.apply(SyncVersion(3), leader, state("c")).is_err());
        assert!(rep.apply(SyncVersion(2), leader, state("c")).is_err());
        assert_eq!(rep.state().world, "b");
        assert_eq!(rep.current().authoritative_peer_id, Some(leader));
    }

    #[test]
    fn sync_from_wrong_authority_is_dropped() {
        let (x, y) = (PeerId::generate(), PeerId::generate());
        let mut rep = SessionStateReplicator::new(PeerId::generate());
        rep.recognize_leader(Some(y), SyncVersion(0));
        rep.apply(SyncVersion(1), y, state("ours")).unwrap();

        let err = rep.apply(SyncVersion(50), x, state("theirs")).unwrap_err();
        assert_eq!(
            err,
            ReplicationError::StaleSyncIgnored {
                received: SyncVersion(50),
                local: SyncVersion(1),
                authority: x,
                leader: Some(y),
            }
        );
        assert_eq!(rep.version(), SyncVersion(1));
        assert_eq!(rep.state().world, "ours");
    }

    #[test]
    fn new_leader_resumes_above_baseline() {
        let (old, me) = (PeerId::generate(), PeerId::generate());
        let mut rep = SessionStateReplicator::new(me);
        rep.recognize_leader(Some(old), SyncVersion(0));
        rep.apply(SyncVersion(4), old, state("old")).unwrap();

        // We missed version 7 but the coordinator relayed it.
        rep.recognize_leader(Some(me), SyncVersion(7));
        match rep.replicate(state("new")).unwrap() {
            Message::GameStateSync { sync_version, .. } => assert_eq!(sync_version, SyncVersion(8)),
            other => panic!("expected GameStateSync, got {other:?}"),
        }
    }

    #[test]
    fn baseline_never_lowers_the_counter() {
        let leader = PeerId::generate();
        let mut rep = SessionStateReplicator::new(PeerId::generate());
        rep.recognize_leader(Some(leader), SyncVersion(0));
        rep.apply(SyncVersion(9), leader, state("a")).unwrap();
        rep.recognize_leader(Some(leader), SyncVersion(2));
        assert_eq!(rep.version(), SyncVersion(9));
    }

    #[test]
    fn demoted_leader_drops_its_unaccepted_version() {
        let (h, p) = (PeerId::generate(), PeerId::generate());
        let mut old = SessionStateReplicator::new(h);
        let mut new = SessionStateReplicator::new(p);
        let mut coordinator = SessionStateReplicator::new(PeerId::SESSION);
        for rep in [&mut old, &mut new, &mut coordinator] {
            rep.recognize_leader(Some(h), SyncVersion(0));
        }

        let v1 = SyncVersion(1);
        old.replicate(state("shared")).unwrap();
        coordinator.apply(v1, h, state("shared")).unwrap();
        new.apply(v1, h, state("shared")).unwrap();

        // Published while the vote moved leadership; never relayed.
        old.replicate(state("h-only")).unwrap();
        assert_eq!(old.version(), SyncVersion(2));

        let baseline = coordinator.version();
        for rep in [&mut old, &mut new, &mut coordinator] {
            rep.recognize_leader(Some(p), baseline);
        }
        assert_eq!(old.version(), SyncVersion(1));
        assert_eq!(old.current().authoritative_peer_id, None);

        let (version, world) = match new.replicate(state("p-first")).unwrap() {
            Message::GameStateSync {
                sync_version,
                state,
                ..
            } => (sync_version, state),
            other => panic!("expected GameStateSync, got {other:?}"),
        };
        assert_eq!(
            coordinator.apply(version, p, world.clone()),
            Ok(SyncVersion(2))
        );
        assert_eq!(old.apply(version, p, world), Ok(SyncVersion(2)));
        assert_eq!(old.state().world, "p-first");
    }

    #[test]
    fn leader_kept_after_rejected_vote_keeps_its_version() {
        let me = PeerId::generate();
        let mut rep = SessionStateReplicator::new(me);
        rep.recognize_leader(Some(me), SyncVersion(0));
        rep.replicate(state("a")).unwrap();
        rep.replicate(state("b")).unwrap();

        // The result was announced before our second sync reached the
        // coordinator; it is still in flight and will be accepted.
        rep.recognize_leader(Some(me), SyncVersion(1));
        assert_eq!(rep.version(), SyncVersion(2));
        assert_eq!(rep.current().authoritative_peer_id, Some(me));
    }
}
