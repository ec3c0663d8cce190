// Character snapshot store: versioned persona blobs for joining with a
// character.
//
// `CharacterSnapshotStore` puts the version gate in front of a plain keyed
// `CharacterStore`. Export stamps a snapshot with a fresh id, the owner and
// this build's game version; import refuses anything saved by a different
// major version, using the same rule as the handshake gate.
//
// `DirectoryStore` is the durable backend: one pretty-printed JSON file per
// character, `<dir>/<character_id>.json`. Ids are generated uuids, and reads
// refuse anything that isn't shaped like one so an id can never address a
// path outside the directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;
use wayfarer_protocol::{CharacterSnapshot, GameVersion, PeerId};

use crate::bus::unix_millis;
use crate::error::SnapshotError;

/// Keyed storage for snapshot blobs.
pub trait CharacterStore: Send {
    fn put(&mut self, snapshot: &CharacterSnapshot) -> Result<(), SnapshotError>;
    fn get(&self, character_id: &str) -> Result<Option<CharacterSnapshot>, SnapshotError>;
    fn all(&self) -> Result<Vec<CharacterSnapshot>, SnapshotError>;
}

pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, character_id: &str) -> Option<PathBuf> {
        Uuid::parse_str(character_id)
            .ok()
            .map(|_| self.dir.join(format!("{character_id}.json")))
    }
}

impl CharacterStore for DirectoryStore {
    fn put(&mut self, snapshot: &CharacterSnapshot) -> Result<(), SnapshotError> {
        let path = self
            .path_for(&snapshot.character_id)
            .ok_or_else(|| SnapshotError::NotFound(snapshot.character_id.clone()))?;
        fs::write(path, serde_json::to_vec_pretty(snapshot)?)?;
        Ok(())
    }

    fn get(&self, character_id: &str) -> Result<Option<CharacterSnapshot>, SnapshotError> {
        let Some(path) = self.path_for(character_id) else {
            return Ok(None);
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn all(&self) -> Result<Vec<CharacterSnapshot>, SnapshotError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match serde_json::from_slice(&fs::read(&path)?) {
                Ok(snapshot) => out.push(snapshot),
                Err(e) => log::warn!("skipping unreadable snapshot {}: {e}", path.display()),
            }
        }
        Ok(out)
    }
}

/// The major-version rule for personas. The snapshot store applies it on
/// import and the handshake gate applies it to personas brought to a join.
pub fn check_persona_version(
    expected: GameVersion,
    snapshot: &CharacterSnapshot,
) -> Result<(), SnapshotError> {
    if !expected.is_compatible_with(&snapshot.game_version) {
        return Err(SnapshotError::IncompatibleVersion {
            character_id: snapshot.character_id.clone(),
            found: snapshot.game_version,
            expected,
        });
    }
    Ok(())
}

/// Listing entry for `list_available`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub character_id: String,
    pub owner_peer_id: PeerId,
    pub creation_time: u64,
    pub game_version: GameVersion,
}

pub struct CharacterSnapshotStore<S: CharacterStore> {
    store: S,
    game_version: GameVersion,
}

impl<S: CharacterStore> CharacterSnapshotStore<S> {
    pub fn new(store: S, game_version: GameVersion) -> Self {
        Self {
            store,
            game_version,
        }
    }

    /// Save a persona payload and return the stamped snapshot.
    pub fn export(
        &mut self,
        owner: PeerId,
        payload: serde_json::Value,
    ) -> Result<CharacterSnapshot, SnapshotError> {
        let snapshot = CharacterSnapshot {
            character_id: Uuid::new_v4().to_string(),
            owner_peer_id: owner,
            creation_time: unix_millis(),
            game_version: self.game_version,
            payload,
        };
        self.store.put(&snapshot)?;
        log::info!("exported character {} for {owner}", snapshot.character_id);
        Ok(snapshot)
    }

    /// Load a stored snapshot, refusing other major versions.
    pub fn import(&self, character_id: &str) -> Result<CharacterSnapshot, SnapshotError> {
        let snapshot = self
            .store
            .get(character_id)?
            .ok_or_else(|| SnapshotError::NotFound(character_id.to_string()))?;
        self.validate(&snapshot)?;
        Ok(snapshot)
    }

    /// The version gate alone, for snapshots that arrived over the wire.
    pub fn validate(&self, snapshot: &CharacterSnapshot) -> Result<(), SnapshotError> {
        check_persona_version(self.game_version, snapshot)
    }

    /// Stored snapshots, newest first, optionally for one owner only.
    pub fn list_available(
        &self,
        owner: Option<PeerId>,
    ) -> Result<Vec<SnapshotMeta>, SnapshotError> {
        let mut metas: Vec<SnapshotMeta> = self
            .store
            .all()?
            .into_iter()
            .filter(|s| owner.is_none_or(|o| s.owner_peer_id == o))
            .map(|s| SnapshotMeta {
                character_id: s.character_id,
                owner_peer_id: s.owner_peer_id,
                creation_time: s.creation_time,
                game_version: s.game_version,
            })
            .collect();
        metas.sort_by(|a, b| b.creation_time.cmp(&a.creation_time));
        Ok(metas)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fresh empty directory under the system temp dir.
    pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wayfarer-{tag}-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn store(version: GameVersion) -> CharacterSnapshotStore<DirectoryStore> {
        let dir = scratch_dir("snapshots");
        CharacterSnapshotStore::new(DirectoryStore::open(dir).unwrap(), version)
    }

    #[test]
    fn export_then_import_keeps_id_and_payload() {
        let mut s = store(GameVersion::new(1, 3, 0));
        let owner = PeerId::generate();
        let payload = serde_json::json!({"name": "Wren", "level": 7, "kit": ["bow"]});
        let exported = s.export(owner, payload.clone()).unwrap();

        let imported = s.import(&exported.character_id).unwrap();
        assert_eq!(imported.character_id, exported.character_id);
        assert_eq!(imported.payload, payload);
        assert_eq!(imported.owner_peer_id, owner);
    }

    #[test]
    fn import_unknown_or_malformed_id_is_not_found() {
        let s = store(GameVersion::new(1, 0, 0));
        let missing = Uuid::new_v4().to_string();
        assert!(matches!(
            s.import(&missing),
            Err(SnapshotError::NotFound(_))
        ));
        assert!(matches!(
            s.import("../../etc/passwd"),
            Err(SnapshotError::NotFound(_))
        ));
    }

    #[test]
    fn other_major_version_is_refused_on_import() {
        let dir = scratch_dir("snapshots-major");
        let mut old = CharacterSnapshotStore::new(
            DirectoryStore::open(&dir).unwrap(),
            GameVersion::new(1, 9, 9),
        );
        let id = old
            .export(PeerId::generate(), serde_json::json!({}))
            .unwrap()
            .character_id;

        let new = CharacterSnapshotStore::new(
            DirectoryStore::open(&dir).unwrap(),
            GameVersion::new(2, 0, 0),
        );
        assert!(matches!(
            new.import(&id),
            Err(SnapshotError::IncompatibleVersion { .. })
        ));
        let patch = CharacterSnapshotStore::new(
            DirectoryStore::open(&dir).unwrap(),
            GameVersion::new(1, 0, 4),
        );
        assert!(patch.import(&id).is_ok());
    }

    #[test]
    fn list_is_newest_first_and_filters_by_owner() {
        let dir = scratch_dir("snapshots-list");
        let (a, b) = (PeerId::generate(), PeerId::generate());
        let mut raw = DirectoryStore::open(&dir).unwrap();
        for (owner, t) in [(a, 100), (b, 300), (a, 200)] {
            raw.put(&CharacterSnapshot {
                character_id: Uuid::new_v4().to_string(),
                owner_peer_id: owner,
                creation_time: t,
                game_version: GameVersion::new(1, 0, 0),
                payload: serde_json::Value::Null,
            })
            .unwrap();
        }
        let s = CharacterSnapshotStore::new(raw, GameVersion::new(1, 0, 0));

        let times: Vec<u64> = s
            .list_available(None)
            .unwrap()
            .iter()
            .map(|m| m.creation_time)
            .collect();
        assert_eq!(times, vec![300, 200, 100]);

        let mine = s.list_available(Some(a)).unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|m| m.owner_peer_id == a));
        assert_eq!(mine[0].creation_time, 200);
    }
}
