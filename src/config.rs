//! Configuration for the board server and its clients.
//!
//! Settings live in an optional `kanban.toml`. Every section and key has a
//! default, so an empty or missing file is valid. CLI flags override file
//! values; `KANBAN_CONFIG` points at an alternate file.
//!
//! ```toml
//! [server]
//! port = 3141
//! db_path = ".kanban/board.db"
//! dev_mode = false
//!
//! [realtime]
//! max_attempts = 5
//! base_backoff_ms = 250
//! max_backoff_ms = 8000
//! subscribe_timeout_ms = 10000
//! ping_interval_secs = 30
//! pong_timeout_secs = 60
//!
//! [sync]
//! pending_timeout_ms = 15000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::board::server::ServerConfig;
use crate::board::ws::KeepAlive;
use crate::realtime::RetryPolicy;

pub const CONFIG_FILE: &str = "kanban.toml";
pub const CONFIG_ENV: &str = "KANBAN_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".kanban/board.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Change feed client and keepalive settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSection {
    /// Consecutive reconnect attempts before a channel stays offline
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// How long to wait for a subscription ack
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    8000
}

fn default_subscribe_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_pong_timeout_secs() -> u64 {
    60
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

impl RealtimeSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn keepalive(&self) -> KeepAlive {
        KeepAlive {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    /// How long an optimistic write may stay unconfirmed
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
}

fn default_pending_timeout_ms() -> u64 {
    15_000
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            pending_timeout_ms: default_pending_timeout_ms(),
        }
    }
}

impl SyncSection {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }
}

/// Root of `kanban.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KanbanToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub realtime: RealtimeSection,
    #[serde(default)]
    pub sync: SyncSection,
}

impl KanbanToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse kanban.toml")
    }

    /// Load `kanban.toml` from `dir`, or defaults if it doesn't exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the config file: an explicit path wins, then
    /// `KANBAN_CONFIG`, then `kanban.toml` in `dir`. An explicitly named
    /// file must exist.
    pub fn resolve(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV)
            && !path.is_empty()
        {
            return Self::load(Path::new(&path));
        }
        Self::load_or_default(dir)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize kanban.toml")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.server.port,
            db_path: self.server.db_path.clone(),
            dev_mode: self.server.dev_mode,
            keepalive: self.realtime.keepalive(),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: the server will bind a random port".to_string());
        }
        if self.realtime.max_attempts == 0 {
            warnings.push("realtime.max_attempts is 0: channels will never retry".to_string());
        }
        if self.realtime.base_backoff_ms > self.realtime.max_backoff_ms {
            warnings.push(format!(
                "realtime.base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.realtime.base_backoff_ms, self.realtime.max_backoff_ms
            ));
        }
        if self.realtime.subscribe_timeout_ms == 0 {
            warnings.push("realtime.subscribe_timeout_ms is 0: every subscribe will time out".to_string());
        }
        if self.realtime.pong_timeout_secs <= self.realtime.ping_interval_secs {
            warnings.push(format!(
                "realtime.pong_timeout_secs ({}) should be greater than ping_interval_secs ({})",
                self.realtime.pong_timeout_secs, self.realtime.ping_interval_secs
            ));
        }
        if self.sync.pending_timeout_ms == 0 {
            warnings.push("sync.pending_timeout_ms is 0: optimistic writes expire immediately".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = KanbanToml::parse("").unwrap();
        assert_eq!(config, KanbanToml::default());
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.server.db_path, PathBuf::from(".kanban/board.db"));
        assert_eq!(config.realtime.retry_policy(), RetryPolicy::default());
        assert_eq!(config.realtime.keepalive(), KeepAlive::default());
        assert_eq!(config.sync.pending_timeout(), Duration::from_secs(15));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = KanbanToml::parse(
            r#"
            [server]
            port = 8080

            [realtime]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(!config.server.dev_mode);
        assert_eq!(config.realtime.max_attempts, 2);
        assert_eq!(config.realtime.base_backoff_ms, 250);
        assert_eq!(config.server_config().port, 8080);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = KanbanToml::parse("[server\nport = ").unwrap_err();
        assert!(err.to_string().contains("kanban.toml"));
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = KanbanToml::default();
        config.realtime.base_backoff_ms = 10_000;
        config.realtime.pong_timeout_secs = 10;
        config.sync.pending_timeout_ms = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("base_backoff_ms")));
        assert!(warnings.iter().any(|w| w.contains("pong_timeout_secs")));
        assert!(warnings.iter().any(|w| w.contains("pending_timeout_ms")));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join(CONFIG_FILE);
        let mut config = KanbanToml::default();
        config.server.dev_mode = true;
        config.sync.pending_timeout_ms = 500;
        config.save(&path).unwrap();

        let loaded = KanbanToml::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = KanbanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, KanbanToml::default());
    }

    #[test]
    fn test_resolve_prefers_explicit_then_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();

        let mut in_dir = KanbanToml::default();
        in_dir.server.port = 1111;
        in_dir.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let env_path = dir.path().join("env.toml");
        let mut from_env = KanbanToml::default();
        from_env.server.port = 2222;
        from_env.save(&env_path).unwrap();

        let explicit_path = dir.path().join("explicit.toml");
        let mut explicit = KanbanToml::default();
        explicit.server.port = 3333;
        explicit.save(&explicit_path).unwrap();

        unsafe { std::env::remove_var(CONFIG_ENV) };
        assert_eq!(KanbanToml::resolve(None, dir.path()).unwrap().server.port, 1111);

        unsafe { std::env::set_var(CONFIG_ENV, &env_path) };
        assert_eq!(KanbanToml::resolve(None, dir.path()).unwrap().server.port, 2222);
        assert_eq!(
            KanbanToml::resolve(Some(&explicit_path), dir.path()).unwrap().server.port,
            3333
        );
        unsafe { std::env::remove_var(CONFIG_ENV) };

        assert!(KanbanToml::resolve(Some(&dir.path().join("missing.toml")), dir.path()).is_err());
    }
}
