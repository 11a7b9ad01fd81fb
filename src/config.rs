//! Node Configuration
//!
//! TOML description of one process: its id, where it listens, its peers, and
//! the exclusion tuning knobs.
//!
//! ```toml
//! id = "P1"
//! listen = "127.0.0.1:50051"
//!
//! [[peers]]
//! id = "P2"
//! address = "http://127.0.0.1:50052"
//!
//! [exclusion]
//! acquire_timeout_ms = 5000
//! reply_mode = "push"
//! ```

use crate::engine::{MutexConfig, MutexError, ReplyMode};
use crate::quorum::MembershipPolicy;
use crate::request::{ProcessId, Timestamp};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// One process's configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub id: ProcessId,
    /// Address the gRPC server binds to.
    pub listen: SocketAddr,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    #[serde(default)]
    pub exclusion: ExclusionSection,
}

/// A peer and the endpoint it serves on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub id: ProcessId,
    /// Endpoint URI, e.g. `http://10.0.0.2:50051`.
    pub address: String,
}

/// `[exclusion]` table. Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExclusionSection {
    pub acquire_timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub reply_mode: ReplyMode,
    pub membership: MembershipPolicy,
    pub clock_history: usize,
    pub initial_timestamp: Timestamp,
}

impl Default for ExclusionSection {
    fn default() -> Self {
        let defaults = MutexConfig::default();
        Self {
            acquire_timeout_ms: defaults.acquire_timeout.as_millis() as u64,
            max_retries: defaults.max_retries,
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
            reply_mode: defaults.reply_mode,
            membership: defaults.membership,
            clock_history: defaults.clock_history,
            initial_timestamp: defaults.initial_timestamp,
        }
    }
}

impl From<ExclusionSection> for MutexConfig {
    fn from(section: ExclusionSection) -> Self {
        MutexConfig {
            acquire_timeout: Duration::from_millis(section.acquire_timeout_ms),
            max_retries: section.max_retries,
            initial_backoff: Duration::from_millis(section.initial_backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
            backoff_multiplier: section.backoff_multiplier,
            reply_mode: section.reply_mode,
            membership: section.membership,
            clock_history: section.clock_history,
            initial_timestamp: section.initial_timestamp,
        }
    }
}

impl NodeConfig {
    /// Builds a configuration from already parsed values, with default
    /// exclusion tuning.
    pub fn new(
        id: impl Into<ProcessId>,
        listen: SocketAddr,
        peers: impl IntoIterator<Item = PeerEntry>,
    ) -> Result<Self, MutexError> {
        let config = NodeConfig {
            id: id.into(),
            listen,
            peers: peers.into_iter().collect(),
            exclusion: ExclusionSection::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, MutexError> {
        let config: NodeConfig =
            toml::from_str(raw).map_err(|e| MutexError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MutexError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MutexError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn peer_ids(&self) -> Vec<ProcessId> {
        self.peers.iter().map(|p| p.id.clone()).collect()
    }

    pub fn mutex_config(&self) -> MutexConfig {
        self.exclusion.clone().into()
    }

    fn validate(&self) -> Result<(), MutexError> {
        if self.id.is_empty() {
            return Err(MutexError::Config("id must not be empty".into()));
        }
        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if peer.id.is_empty() || peer.address.is_empty() {
                return Err(MutexError::Config("peer id and address must not be empty".into()));
            }
            if peer.id == self.id {
                return Err(MutexError::Config(format!("{} lists itself as a peer", self.id)));
            }
            if !seen.insert(&peer.id) {
                return Err(MutexError::Config(format!("duplicate peer {}", peer.id)));
            }
        }
        if self.exclusion.initial_backoff_ms > self.exclusion.max_backoff_ms {
            return Err(MutexError::Config(
                "initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: &str = r#"
id = "P1"
listen = "127.0.0.1:50051"

[[peers]]
id = "P2"
address = "http://127.0.0.1:50052"

[[peers]]
id = "P3"
address = "http://127.0.0.1:50053"

[exclusion]
acquire_timeout_ms = 2500
reply_mode = "push"
membership = "exclude_unreachable"
"#;

    #[test]
    fn test_parse_node_config() {
        let config = NodeConfig::from_toml_str(NODE).unwrap();
        assert_eq!(config.id, ProcessId::from("P1"));
        assert_eq!(config.listen.port(), 50051);
        assert_eq!(config.peer_ids(), vec![ProcessId::from("P2"), ProcessId::from("P3")]);

        let mutex = config.mutex_config();
        assert_eq!(mutex.acquire_timeout, Duration::from_millis(2500));
        assert_eq!(mutex.reply_mode, ReplyMode::Push);
        assert_eq!(mutex.membership, MembershipPolicy::ExcludeUnreachable);
        // Unset keys keep their defaults.
        assert_eq!(mutex.max_retries, MutexConfig::default().max_retries);
    }

    #[test]
    fn test_missing_exclusion_table_uses_defaults() {
        let config = NodeConfig::from_toml_str("id = \"P1\"\nlisten = \"0.0.0.0:7000\"\n").unwrap();
        assert!(config.peers.is_empty());
        assert_eq!(config.mutex_config().reply_mode, ReplyMode::Inline);
    }

    #[test]
    fn test_new_keeps_ids_verbatim() {
        let listen: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let peer = PeerEntry {
            id: "nœud \"2\"\t".into(),
            address: "127.0.0.1:7001".into(),
        };
        let config = NodeConfig::new("P1", listen, [peer.clone()]).unwrap();
        assert_eq!(config.peers, vec![peer]);
        assert_eq!(config.mutex_config().max_retries, MutexConfig::default().max_retries);

        let self_peer = PeerEntry {
            id: "P1".into(),
            address: "127.0.0.1:7001".into(),
        };
        assert!(matches!(
            NodeConfig::new("P1", listen, [self_peer]),
            Err(MutexError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let self_peer = "id = \"P1\"\nlisten = \"0.0.0.0:7000\"\n[[peers]]\nid = \"P1\"\naddress = \"http://x\"\n";
        assert!(matches!(
            NodeConfig::from_toml_str(self_peer),
            Err(MutexError::Config(_))
        ));

        let unknown_key = "id = \"P1\"\nlisten = \"0.0.0.0:7000\"\ncolour = \"blue\"\n";
        assert!(NodeConfig::from_toml_str(unknown_key).is_err());

        let bad_mode = "id = \"P1\"\nlisten = \"0.0.0.0:7000\"\n[exclusion]\nreply_mode = \"sometimes\"\n";
        assert!(NodeConfig::from_toml_str(bad_mode).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = NodeConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, MutexError::Config(msg) if msg.contains("not/here.toml")));
    }
}
