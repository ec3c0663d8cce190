// Game-side collaborators the session layer calls into.
//
// The coordination layer transports game state and text but never interprets
// them. These traits are the seams where the game plugs in:
// - `GameStateProvider`: the simulation. Supplies the state a leader
//   replicates and takes the state a follower accepts.
// - `PersonaPresenter`: local rendering of system notices and chat.
// - `SessionPersistence`: host save slots, used by `SaveRequest`/`LoadRequest`.
//
// `SaveDirectory` is the stock persistence: one JSON file per slot.

use std::fs;
use std::io;
use std::path::PathBuf;

use wayfarer_protocol::GameState;

use crate::error::PersistenceError;

pub trait GameStateProvider: Send {
    /// State to publish when this peer leads.
    fn current_state(&mut self) -> GameState;

    /// A replicated (or loaded) state to adopt locally.
    fn apply_state(&mut self, state: &GameState);
}

pub trait PersonaPresenter: Send {
    fn system_message(&mut self, text: &str);
    fn chat(&mut self, from: &str, text: &str);
}

pub trait SessionPersistence: Send {
    fn save(&mut self, slot: &str, state: &GameState) -> Result<(), PersistenceError>;
    fn load(&mut self, slot: &str) -> Result<GameState, PersistenceError>;
}

/// Persistence for a host without a save directory. Every call is refused.
pub struct NoPersistence;

impl SessionPersistence for NoPersistence {
    fn save(&mut self, _slot: &str, _state: &GameState) -> Result<(), PersistenceError> {
        Err(PersistenceError::Disabled)
    }

    fn load(&mut self, _slot: &str) -> Result<GameState, PersistenceError> {
        Err(PersistenceError::Disabled)
    }
}

/// `<dir>/<slot>.json` per save slot.
pub struct SaveDirectory {
    dir: PathBuf,
}

impl SaveDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Slot names are plain identifiers: ASCII alphanumerics, `-` and `_`.
    fn slot_path(&self, slot: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !slot.is_empty()
            && slot.len() <= 64
            && slot
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistenceError::InvalidSlot(slot.to_string()));
        }
        Ok(self.dir.join(format!("{slot}.json")))
    }
}

impl SessionPersistence for SaveDirectory {
    fn save(&mut self, slot: &str, state: &GameState) -> Result<(), PersistenceError> {
        let path = self.slot_path(slot)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, serde_json::to_vec_pretty(state)?)?;
        log::info!("saved session state to {}", path.display());
        Ok(())
    }

    fn load(&mut self, slot: &str) -> Result<GameState, PersistenceError> {
        let path = self.slot_path(slot)?;
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PersistenceError::SlotNotFound(slot.to_string()),
            _ => PersistenceError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
