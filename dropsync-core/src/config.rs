use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Glob pattern matched against store-relative paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteCfg {
    /// SFTP remote endpoint
    Sftp {
        /// `host` or `host:port`
        host: String,
        user: String,
        password: Option<String>,
        #[serde(default)]
        fingerprints: Option<Vec<String>>, // allowed host key fingerprints or base64 keys
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id:        Uuid,
    pub name:      String,
    /// Local root; authoritative side of the mirror.
    pub local:     PathBuf,
    /// Remote base directory every store-relative path lives under.
    pub remote:    String,
    #[serde(default)]
    pub include:   Vec<Pattern>,
    #[serde(default)]
    pub exclude:   Vec<Pattern>,
    /// Transport retry attempts after the first try
    #[serde(default = "TaskConfig::default_retry_max")]
    pub retry_max: u32,
    /// Initial backoff in ms for retries (exponential)
    #[serde(default = "TaskConfig::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "TaskConfig::default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Periodic full reconciliation, catches events the watcher missed
    #[serde(default)]
    pub rescan_secs: Option<u64>,
    pub remote_cfg: RemoteCfg,
}

impl TaskConfig {
    fn default_retry_max() -> u32 { 3 }
    fn default_retry_backoff_ms() -> u64 { 500 }
    fn default_retry_backoff_max_ms() -> u64 { 30_000 }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }
}

/// Bounded exponential backoff for transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: TaskConfig::default_retry_max(),
            initial_backoff: Duration::from_millis(TaskConfig::default_retry_backoff_ms()),
            max_backoff: Duration::from_millis(TaskConfig::default_retry_backoff_max_ms()),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// No waiting between attempts; handy in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
- id: 6f1c2a8e-3f0b-4b5e-9a55-6a1c4d1f2e3b
  name: docs
  local: /home/me/docs
  remote: backup/docs
  exclude: ["*.swp"]
  rescan_secs: 600
  remote_cfg:
    type: sftp
    host: example.org:2222
    user: me
    password: secret
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let tasks: Vec<TaskConfig> = serde_yaml::from_str(YAML).unwrap();
        let cfg = &tasks[0];
        assert_eq!(cfg.name, "docs");
        assert_eq!(cfg.retry_max, 3);
        assert_eq!(cfg.rescan_secs, Some(600));
        assert!(cfg.include.is_empty());
        assert!(matches!(&cfg.remote_cfg, RemoteCfg::Sftp { host, .. } if host == "example.org:2222"));
    }

    #[test]
    fn parses_json() {
        let json = r#"[{
            "id": "6f1c2a8e-3f0b-4b5e-9a55-6a1c4d1f2e3b",
            "name": "media",
            "local": "/data/media",
            "remote": "/srv/media",
            "include": ["**/*.jpg"],
            "retry_max": 5,
            "remote_cfg": {"type": "sftp", "host": "nas", "user": "sync", "password": null,
                           "fingerprints": ["SHA256:abc"]}
        }]"#;
        let tasks: Vec<TaskConfig> = serde_json::from_str(json).unwrap();
        let policy = tasks[0].retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(tasks[0].include[0].0, "**/*.jpg");
        assert_eq!(tasks[0].rescan_secs, None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }
}
