//! Notary configuration, loaded from TOML. Every section is optional.
//!
//! ```toml
//! [cluster]
//! heartbeat_interval_ms = 100
//! election_timeout_ms = 1000
//!
//! [[cluster.members]]
//! id = 0
//! name = "O=Notary Replica 0, L=London, C=GB"
//!
//! [coordinator]
//! commit_timeout_ms = 5000
//!
//! [store]
//! backend = "journal"
//! journal_dir = "/var/lib/notary"
//!
//! [time_window]
//! replay_policy = "bypass"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::vsr::quorum::MAX_CLUSTER_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotaryConfig {
    pub cluster: ClusterConfig,
    pub coordinator: CoordinatorConfig,
    pub client: ClientConfig,
    pub store: StoreConfig,
    pub time_window: TimeWindowConfig,
}

impl NotaryConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: NotaryConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cluster.validate()?;
        if self.coordinator.commit_timeout_ms == 0 {
            return Err(ConfigError::Invalid("coordinator.commit_timeout_ms must be > 0".into()));
        }
        if self.client.max_attempts == 0 {
            return Err(ConfigError::Invalid("client.max_attempts must be > 0".into()));
        }
        if self.store.backend == StoreBackendKind::Journal && self.store.journal_dir.is_none() {
            return Err(ConfigError::Invalid(
                "store.journal_dir is required for the journal backend".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Replica ids must be exactly `0..members.len()`; the primary of view
    /// `v` is the member with id `v % members.len()`.
    pub members: Vec<MemberConfig>,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_ms: u64,
    /// Pause between iterations of a replica's event loop.
    pub tick_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            members: (0..3)
                .map(|id| MemberConfig {
                    id,
                    name: format!("O=Notary Replica {}, L=London, C=GB", id),
                })
                .collect(),
            heartbeat_interval_ms: 100,
            election_timeout_ms: 1000,
            tick_interval_ms: 1,
        }
    }
}

impl ClusterConfig {
    /// Default timing with `size` members.
    pub fn with_size(size: u32) -> Self {
        ClusterConfig {
            members: (0..size)
                .map(|id| MemberConfig {
                    id,
                    name: format!("O=Notary Replica {}, L=London, C=GB", id),
                })
                .collect(),
            ..ClusterConfig::default()
        }
    }

    pub fn size(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.members.is_empty() {
            return Err(ConfigError::Invalid("cluster.members must not be empty".into()));
        }
        if self.size() > MAX_CLUSTER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "cluster supports at most {} members, got {}",
                MAX_CLUSTER_SIZE,
                self.size()
            )));
        }
        let ids: HashSet<u32> = self.members.iter().map(|m| m.id).collect();
        if ids.len() != self.members.len() || (0..self.size()).any(|id| !ids.contains(&id)) {
            return Err(ConfigError::Invalid(
                "cluster member ids must be unique and cover 0..members.len()".into(),
            ));
        }
        if self.election_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "cluster.election_timeout_ms must exceed cluster.heartbeat_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub commit_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            commit_timeout_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_attempts: 8,
            backoff_base_ms: 20,
            backoff_cap_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    Journal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    /// Directory holding one journal (and one view manifest) per replica.
    pub journal_dir: Option<PathBuf>,
}

/// What the leader does when a resubmitted transaction is already committed
/// but its time window has since expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// Answer `Success` without re-checking the window.
    #[default]
    Bypass,
    /// Check the window on every submission, replay or not.
    Revalidate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindowConfig {
    pub replay_policy: ReplayPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = NotaryConfig::from_toml_str("").unwrap();
        assert_eq!(config, NotaryConfig::default());
        assert_eq!(config.cluster.size(), 3);
        assert_eq!(config.time_window.replay_policy, ReplayPolicy::Bypass);
    }

    #[test]
    fn test_parses_sections() {
        let config = NotaryConfig::from_toml_str(
            r#"
            [cluster]
            heartbeat_interval_ms = 20
            election_timeout_ms = 200

            [[cluster.members]]
            id = 0
            name = "O=A"

            [[cluster.members]]
            id = 1
            name = "O=B"

            [store]
            backend = "journal"
            journal_dir = "/tmp/notary"

            [time_window]
            replay_policy = "revalidate"
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.size(), 2);
        assert_eq!(config.cluster.election_timeout(), Duration::from_millis(200));
        assert_eq!(config.store.backend, StoreBackendKind::Journal);
        assert_eq!(config.time_window.replay_policy, ReplayPolicy::Revalidate);
        assert_eq!(config.coordinator.commit_timeout_ms, 5000);
    }

    #[test]
    fn test_rejects_gapped_member_ids() {
        let err = NotaryConfig::from_toml_str(
            r#"
            [[cluster.members]]
            id = 0
            name = "O=A"

            [[cluster.members]]
            id = 2
            name = "O=C"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_election_timeout_below_heartbeat() {
        let err = NotaryConfig::from_toml_str(
            "[cluster]\nheartbeat_interval_ms = 500\nelection_timeout_ms = 100\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_journal_backend_requires_dir() {
        let err = NotaryConfig::from_toml_str("[store]\nbackend = \"journal\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
