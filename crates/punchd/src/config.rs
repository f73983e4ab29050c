use punch_core::{CooldownScope, ReplayEviction, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by `PUNCH_CONFIG`,
/// then `PUNCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Face provider helper command line; empty disables detection.
    pub provider_cmd: String,
    /// How long the helper may take to answer one frame before it is killed.
    pub provider_timeout_ms: u64,
    /// Frames discarded after the camera opens, for exposure to settle.
    pub warmup_frames: usize,
    /// Use the session bus instead of the system bus.
    pub session_bus: bool,
    pub session: SessionConfig,
}

/// Shape of the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    db_path: Option<PathBuf>,
    provider_cmd: Option<String>,
    provider_timeout_ms: Option<u64>,
    warmup_frames: Option<usize>,
    session_bus: Option<bool>,
    session: Option<SessionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("punchclock");

        Self {
            camera_device: "/dev/video0".to_string(),
            db_path: data_dir.join("attendance.db"),
            provider_cmd: String::new(),
            provider_timeout_ms: 5000,
            warmup_frames: 4,
            session_bus: false,
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then `PUNCH_CONFIG` (if set), then `PUNCH_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("PUNCH_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env();
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.apply_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "config file loaded");
        Ok(())
    }

    fn apply_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.provider_cmd {
            self.provider_cmd = v;
        }
        if let Some(v) = file.provider_timeout_ms {
            self.provider_timeout_ms = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.session_bus {
            self.session_bus = v;
        }
        if let Some(v) = file.session {
            self.session = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PUNCH_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("PUNCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PUNCH_PROVIDER_CMD") {
            self.provider_cmd = v;
        }
        self.provider_timeout_ms = env_parse("PUNCH_PROVIDER_TIMEOUT_MS", self.provider_timeout_ms);
        self.warmup_frames = env_parse("PUNCH_WARMUP_FRAMES", self.warmup_frames);
        if let Ok(v) = std::env::var("PUNCH_SESSION_BUS") {
            self.session_bus = v != "0";
        }

        let s = &mut self.session;
        s.match_threshold = env_parse("PUNCH_MATCH_THRESHOLD", s.match_threshold);
        s.consensus_frames = env_parse("PUNCH_CONSENSUS_FRAMES", s.consensus_frames);
        s.cooldown_secs = env_parse("PUNCH_COOLDOWN_SECS", s.cooldown_secs);
        s.motion_threshold = env_parse("PUNCH_MOTION_THRESHOLD", s.motion_threshold);
        s.replay_capacity = env_parse("PUNCH_REPLAY_CAPACITY", s.replay_capacity);
        if let Ok(v) = std::env::var("PUNCH_COOLDOWN_SCOPE") {
            match parse_cooldown_scope(&v) {
                Some(scope) => s.cooldown_scope = scope,
                None => tracing::warn!(value = %v, "ignoring unknown PUNCH_COOLDOWN_SCOPE"),
            }
        }
        if let Ok(v) = std::env::var("PUNCH_REPLAY_EVICTION") {
            match parse_replay_eviction(&v) {
                Some(eviction) => s.replay_eviction = eviction,
                None => tracing::warn!(value = %v, "ignoring unknown PUNCH_REPLAY_EVICTION"),
            }
        }
        if let Ok(v) = std::env::var("PUNCH_CHALLENGE_SEED") {
            s.challenge_seed = v.parse().ok();
        }
    }
}

fn parse_cooldown_scope(v: &str) -> Option<CooldownScope> {
    match v {
        "session" => Some(CooldownScope::Session),
        "identity" => Some(CooldownScope::Identity),
        _ => None,
    }
}

fn parse_replay_eviction(v: &str) -> Option<ReplayEviction> {
    match v {
        "clear" => Some(ReplayEviction::Clear),
        "fifo" => Some(ReplayEviction::Fifo),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_behavior() {
        let config = Config::default();
        assert_eq!(config.session.match_threshold, 0.45);
        assert_eq!(config.session.consensus_frames, 3);
        assert_eq!(config.session.cooldown_secs, 10);
        assert_eq!(config.session.replay_capacity, 10);
        assert_eq!(config.session.replay_eviction, ReplayEviction::Clear);
        assert!(config.provider_cmd.is_empty());
        assert_eq!(config.provider_timeout_ms, 5000);
        assert!(config.db_path.ends_with("punchclock/attendance.db"));
    }

    #[test]
    fn test_toml_overrides_only_given_keys() {
        let mut config = Config::default();
        config
            .apply_toml(
                r#"
                camera_device = "/dev/video4"
                provider_cmd = "punch-faces --model small"

                [session]
                consensus_frames = 5
                cooldown_scope = "identity"
                replay_eviction = "fifo"
                "#,
            )
            .unwrap();

        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.provider_cmd, "punch-faces --model small");
        assert_eq!(config.warmup_frames, 4);
        assert_eq!(config.session.consensus_frames, 5);
        assert_eq!(config.session.cooldown_scope, CooldownScope::Identity);
        assert_eq!(config.session.replay_eviction, ReplayEviction::Fifo);
        // Unset session keys keep their defaults
        assert_eq!(config.session.cooldown_secs, 10);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        let mut config = Config::default();
        assert!(config.apply_toml("camera = \"/dev/video1\"").is_err());
    }

    #[test]
    fn test_toml_rejects_unknown_session_keys() {
        let mut config = Config::default();
        let err = config.apply_toml("[session]\ncooldown_sec = 30\n");
        assert!(err.is_err());
        assert_eq!(config.session.cooldown_secs, 10);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_file(Path::new("/nonexistent/punchclock.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_enum_names() {
        assert_eq!(parse_cooldown_scope("identity"), Some(CooldownScope::Identity));
        assert_eq!(parse_cooldown_scope("global"), None);
        assert_eq!(parse_replay_eviction("clear"), Some(ReplayEviction::Clear));
        assert_eq!(parse_replay_eviction("lru"), None);
    }
}
