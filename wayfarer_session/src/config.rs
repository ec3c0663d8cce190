// Session configuration.
//
// `SessionConfig` carries every tunable of the coordination layer. All fields
// have defaults (`#[serde(default)]`), so a JSON config file only needs the
// keys it overrides; the `host` binary then applies command-line overrides on
// top. Durations are stored as integer milliseconds to keep the file format
// flat, with `Duration` accessors for the code that uses them.
//
// Joining peers use the same struct for their heartbeat timing and handshake
// timeout so both ends of a connection agree on liveness without extra
// negotiation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wayfarer_protocol::GameVersion;

use crate::error::ConfigError;

/// Version this build of the game reports during the handshake.
pub fn build_game_version() -> GameVersion {
    env!("CARGO_PKG_VERSION")
        .parse()
        .unwrap_or(GameVersion::new(0, 1, 0))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interface the host listens on.
    pub bind_address: String,
    /// Listening port. 0 lets the OS pick one (tests).
    pub port: u16,
    pub session_name: String,
    /// Version this process admits joiners against.
    pub game_version: GameVersion,
    pub heartbeat_interval_ms: u64,
    /// A peer silent for `interval * multiplier` is removed.
    pub heartbeat_timeout_multiplier: u32,
    pub vote_timeout_ms: u64,
    /// Minimum time between two leadership transfers.
    pub leadership_cooldown_ms: u64,
    /// Roster size limit, host included. Also bounds inbound connections.
    pub max_peers: u32,
    /// How long a new connection has to send `Connect`.
    pub handshake_timeout_ms: u64,
    /// Directory for host save slots. Saves are refused when unset.
    pub save_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 7777,
            session_name: "wayfarer-session".into(),
            game_version: build_game_version(),
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_multiplier: 3,
            vote_timeout_ms: 30_000,
            leadership_cooldown_ms: 60_000,
            max_peers: 4,
            handshake_timeout_ms: 5_000,
            save_dir: None,
        }
    }
}

impl SessionConfig {
    /// Parse a config from JSON text. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Reject values the session can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0"));
        }
        if self.heartbeat_timeout_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_multiplier must be > 0",
            ));
        }
        if self.vote_timeout_ms == 0 {
            return Err(ConfigError::Invalid("vote_timeout_ms must be > 0"));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be > 0"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_timeout_multiplier
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    pub fn leadership_cooldown(&self) -> Duration {
        Duration::from_millis(self.leadership_cooldown_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = SessionConfig::default();
        assert_eq!(c.port, 7777);
        assert_eq!(c.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(c.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(c.vote_timeout(), Duration::from_secs(30));
        assert_eq!(c.leadership_cooldown(), Duration::from_secs(60));
        assert_eq!(c.max_peers, 4);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let c = SessionConfig::from_json(r#"{"port": 9000, "game_version": "2.1.0"}"#).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.game_version, GameVersion::new(2, 1, 0));
        assert_eq!(c.max_peers, 4);
        assert_eq!(c.heartbeat_interval_ms, 5_000);
    }

    #[test]
    fn zero_interval_rejected() {
        let err = SessionConfig::from_json(r#"{"heartbeat_interval_ms": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_handshake_timeout_rejected() {
        let err = SessionConfig::from_json(r#"{"handshake_timeout_ms": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("handshake_timeout_ms must be > 0")
        ));
        let c = SessionConfig {
            handshake_timeout_ms: 0,
            ..SessionConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn bad_json_is_parse_error() {
        let err = SessionConfig::from_json("{port: }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err =
            SessionConfig::from_json_file(Path::new("/nonexistent/wayfarer.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
