// Membership registry: the session roster.
//
// One `PeerRecord` per admitted peer, keyed by `PeerId`, plus a monotonic
// join counter so "earliest-joined" survives removals and doesn't depend on
// random id ordering. The coordinator holds the authoritative registry; each
// joining peer keeps a replica fed by `Welcome`, `PeerJoined`, `PeerLeft` and
// leadership results.
//
// Invariants held here:
// - at most one record has `is_host`, and it keeps it until removed;
// - at most one record has `is_leader` (`set_leader` clears all others in the
//   same call).
//
// Removal cascades (re-election, "peer left" notice) are the session's job:
// the registry only reports what was removed.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use wayfarer_protocol::{GameVersion, PeerId, PeerInfo};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    Duplicate(PeerId),
    Full { max: u32 },
    SecondHost(PeerId),
}

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub id: PeerId,
    pub name: String,
    pub game_version: GameVersion,
    pub protocol_version: u32,
    pub address: Option<SocketAddr>,
    pub is_host: bool,
    pub is_leader: bool,
    pub connected: bool,
    pub last_heartbeat: Instant,
    pub join_order: u64,
    pub character_id: Option<String>,
}

impl PeerRecord {
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            name: self.name.clone(),
            game_version: self.game_version,
            is_host: self.is_host,
            is_leader: self.is_leader,
            join_order: self.join_order,
            character_id: self.character_id.clone(),
        }
    }

    /// Replica record built from a wire `PeerInfo`.
    pub fn from_info(info: &PeerInfo, now: Instant) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            game_version: info.game_version,
            protocol_version: 0,
            address: None,
            is_host: info.is_host,
            is_leader: info.is_leader,
            connected: true,
            last_heartbeat: now,
            join_order: info.join_order,
            character_id: info.character_id.clone(),
        }
    }
}

pub struct MembershipRegistry {
    peers: BTreeMap<PeerId, PeerRecord>,
    next_join_order: u64,
    max_peers: u32,
}

impl MembershipRegistry {
    pub fn new(max_peers: u32) -> Self {
        Self {
            peers: BTreeMap::new(),
            next_join_order: 0,
            max_peers,
        }
    }

    /// Insert a newly admitted peer, assigning its join order. The record's
    /// own `join_order` is overwritten.
    pub fn add(&mut self, mut record: PeerRecord) -> Result<u64, RegistryError> {
        if self.peers.contains_key(&record.id) {
            return Err(RegistryError::Duplicate(record.id));
        }
        if self.peers.len() as u32 >= self.max_peers {
            return Err(RegistryError::Full {
                max: self.max_peers,
            });
        }
        if record.is_host && self.host().is_some() {
            return Err(RegistryError::SecondHost(record.id));
        }
        record.join_order = self.next_join_order;
        self.next_join_order += 1;
        let order = record.join_order;
        if record.is_leader {
            self.clear_leader();
        }
        self.peers.insert(record.id, record);
        Ok(order)
    }

    /// Insert a record as-is (replicas mirror the coordinator's ordering).
    pub fn insert_replica(&mut self, record: PeerRecord) {
        self.next_join_order = self.next_join_order.max(record.join_order + 1);
        if record.is_leader {
            self.clear_leader();
        }
        self.peers.insert(record.id, record);
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerRecord> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// All records in join order.
    pub fn get_all(&self) -> Vec<&PeerRecord> {
        let mut all: Vec<&PeerRecord> = self.peers.values().collect();
        all.sort_by_key(|r| r.join_order);
        all
    }

    pub fn infos(&self) -> Vec<PeerInfo> {
        self.get_all().into_iter().map(PeerRecord::info).collect()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.get_all().into_iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn max_peers(&self) -> u32 {
        self.max_peers
    }

    pub fn host(&self) -> Option<&PeerRecord> {
        self.peers.values().find(|r| r.is_host)
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.peers.values().find(|r| r.is_leader).map(|r| r.id)
    }

    /// Make `id` the only leader. `None`, or an id not on the roster,
    /// leaves nobody flagged.
    pub fn set_leader(&mut self, id: Option<PeerId>) {
        self.clear_leader();
        if let Some(record) = id.and_then(|id| self.peers.get_mut(&id)) {
            record.is_leader = true;
        }
    }

    fn clear_leader(&mut self) {
        for record in self.peers.values_mut() {
            record.is_leader = false;
        }
    }

    /// Earliest-joined connected peer, optionally skipping one.
    pub fn earliest_connected(&self, except: Option<PeerId>) -> Option<PeerId> {
        self.peers
            .values()
            .filter(|r| r.connected && Some(r.id) != except)
            .min_by_key(|r| r.join_order)
            .map(|r| r.id)
    }

    /// Refresh liveness of `id`. Unknown ids are ignored.
    pub fn touch(&mut self, id: PeerId, now: Instant) {
        if let Some(record) = self.peers.get_mut(&id) {
            record.last_heartbeat = now;
        }
    }

    /// Connected peers silent for longer than `timeout` at `now`.
    pub fn silent_since(&self, now: Instant, timeout: std::time::Duration) -> Vec<PeerId> {
        self.get_all()
            .into_iter()
            .filter(|r| r.connected && now.saturating_duration_since(r.last_heartbeat) > timeout)
            .map(|r| r.id)
            .collect()
    }
}
