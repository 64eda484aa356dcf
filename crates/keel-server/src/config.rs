//! Server configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use keel_repl::NodeConfig;
use keel_storage::{RetentionConfig, WalConfig};
use serde::Deserialize;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address this node advertises to its master and replicas.
    pub ip: String,
    /// Control port. The log stream, heartbeat, and snapshot listeners use
    /// fixed offsets from it.
    pub port: u16,
    /// WAL settings.
    pub wal: WalSection,
    /// Writer pool settings.
    pub writer: WriterSection,
    /// Apply pool settings.
    pub apply: ApplySection,
    /// Log retention settings.
    pub retention: RetentionSection,
    /// Replication tuning.
    pub repl: ReplSection,
}

/// `[wal]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalSection {
    /// Log directory.
    pub dir: PathBuf,
    /// Rotation threshold in bytes.
    pub max_file_size: u64,
    /// fdatasync on every append.
    pub sync_on_append: bool,
}

/// `[writer]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterSection {
    /// Number of writer lanes.
    pub lanes: usize,
    /// Per-lane queue capacity.
    pub queue_len: usize,
}

/// `[apply]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplySection {
    /// Number of apply workers.
    pub workers: usize,
}

/// `[retention]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionSection {
    /// Minimum number of log files to keep.
    pub keep_files: u32,
    /// Age-based expiry in days (0 disables).
    pub expire_days: u32,
    /// Files held back behind the slowest sender.
    pub safety_margin: u32,
    /// Seconds between automatic purge passes (0 disables).
    pub purge_interval_secs: u64,
}

/// `[repl]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplSection {
    /// Idle sender poll interval in milliseconds.
    pub sender_poll_ms: u64,
    /// Heartbeat probe interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat read timeout in milliseconds.
    pub heartbeat_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 9221,
            wal: WalSection::default(),
            writer: WriterSection::default(),
            apply: ApplySection::default(),
            retention: RetentionSection::default(),
            repl: ReplSection::default(),
        }
    }
}

impl Default for WalSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./keel-data/wal"),
            max_file_size: 100 * 1024 * 1024,
            sync_on_append: false,
        }
    }
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            lanes: 4,
            queue_len: 1024,
        }
    }
}

impl Default for ApplySection {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            keep_files: 10,
            expire_days: 7,
            safety_margin: 10,
            purge_interval_secs: 60,
        }
    }
}

impl Default for ReplSection {
    fn default() -> Self {
        Self {
            sender_poll_ms: 100,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 5000,
        }
    }
}

impl ServerConfig {
    /// Loads the configuration file, falling back to defaults if it does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// This node's advertised `ip:port`.
    #[must_use]
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Builds the node configuration for [`keel_repl::ReplNode`].
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        let wal = WalConfig::new(&self.wal.dir)
            .with_max_file_size(self.wal.max_file_size)
            .with_sync_on_append(self.wal.sync_on_append);
        NodeConfig {
            wal,
            writer_lanes: self.writer.lanes,
            writer_queue_len: self.writer.queue_len,
            apply_workers: self.apply.workers,
            retention: RetentionConfig {
                keep_files: self.retention.keep_files,
                expire_days: self.retention.expire_days,
                safety_margin: self.retention.safety_margin,
            },
            sender_poll_interval: Duration::from_millis(self.repl.sender_poll_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_file_missing() {
        let config = ServerConfig::load(Path::new("/nonexistent/keel.toml")).unwrap();
        assert_eq!(config.port, 9221);
        assert_eq!(config.writer.lanes, 4);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 7777

            [wal]
            dir = "/var/lib/keel/wal"

            [retention]
            keep_files = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 7777);
        assert_eq!(config.wal.dir, PathBuf::from("/var/lib/keel/wal"));
        assert_eq!(config.wal.max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.retention.keep_files, 20);
        assert_eq!(config.retention.safety_margin, 10);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<ServerConfig>("bogus = 1").is_err());
    }

    #[test]
    fn test_node_config_mapping() {
        let config = ServerConfig::default();
        let node = config.node_config();
        assert_eq!(node.writer_lanes, 4);
        assert_eq!(node.retention.safety_margin, 10);
        assert_eq!(node.sender_poll_interval, Duration::from_millis(100));
    }
}
