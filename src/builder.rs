use crate::engine::{MutexConfig, MutexEngine, MutexError};
use crate::metrics::MutexMetrics;
use crate::network::PeerNetwork;
use crate::request::ProcessId;
use std::collections::BTreeSet;

/// Builder for `MutexEngine`.
///
/// Provides a fluent API for configuring and creating an engine.
pub struct MutexEngineBuilder<N> {
    id: Option<ProcessId>,
    peers: Option<Vec<ProcessId>>,
    network: Option<N>,
    config: MutexConfig,
    metrics: Option<MutexMetrics>,
}

impl<N: PeerNetwork + 'static> MutexEngineBuilder<N> {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            id: None,
            peers: None,
            network: None,
            config: MutexConfig::default(),
            metrics: None,
        }
    }

    /// Sets the process id (Required).
    pub fn id(mut self, id: impl Into<ProcessId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the peer set. Defaults to the ids the network knows about.
    pub fn peers<I, P>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProcessId>,
    {
        self.peers = Some(peers.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the network transport (Required).
    pub fn with_network(mut self, network: N) -> Self {
        self.network = Some(network);
        self
    }

    /// Modifies the configuration via a closure.
    pub fn configure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut MutexConfig),
    {
        f(&mut self.config);
        self
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: MutexConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares existing metrics instead of creating fresh ones.
    pub fn with_metrics(mut self, metrics: MutexMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the `MutexEngine`.
    ///
    /// # Errors
    ///
    /// `MutexError::Config` if the id or network is missing, an id is empty,
    /// or a peer is listed twice. The process's own id is dropped from the
    /// peer set.
    pub fn build(self) -> Result<MutexEngine<N>, MutexError> {
        let id = self
            .id
            .ok_or_else(|| MutexError::Config("Process id is required".to_string()))?;
        if id.is_empty() {
            return Err(MutexError::Config("Process id must not be empty".to_string()));
        }

        let network = self
            .network
            .ok_or_else(|| MutexError::Config("Network transport is required".to_string()))?;

        let requested = self.peers.unwrap_or_else(|| network.peer_ids());
        let mut seen = BTreeSet::new();
        let mut peers = Vec::with_capacity(requested.len());
        for peer in requested {
            if peer.is_empty() {
                return Err(MutexError::Config("Peer id must not be empty".to_string()));
            }
            if peer == id {
                continue;
            }
            if !seen.insert(peer.clone()) {
                return Err(MutexError::Config(format!("Duplicate peer id: {}", peer)));
            }
            peers.push(peer);
        }

        if self.config.backoff_multiplier < 1.0 {
            return Err(MutexError::Config(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        let metrics = self
            .metrics
            .unwrap_or_else(|| MutexMetrics::new(id.clone()));
        Ok(MutexEngine::new(id, peers, network, self.config, metrics))
    }
}

impl<N: PeerNetwork + 'static> Default for MutexEngineBuilder<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReplyMode;
    use crate::network::local::{LocalNetwork, LocalRouter};

    fn builder(router: &LocalRouter, id: &str) -> MutexEngineBuilder<LocalNetwork> {
        MutexEngineBuilder::new().id(id).with_network(router.network(id))
    }

    #[test]
    fn test_requires_id_and_network() {
        let err = MutexEngineBuilder::<LocalNetwork>::new().build().unwrap_err();
        assert!(matches!(err, MutexError::Config(_)));

        let err = MutexEngineBuilder::<LocalNetwork>::new().id("P1").build().unwrap_err();
        assert!(matches!(err, MutexError::Config(_)));
    }

    #[test]
    fn test_self_is_removed_from_peers() {
        let router = LocalRouter::new();
        let engine = builder(&router, "P1").peers(["P1", "P2", "P3"]).build().unwrap();
        assert_eq!(engine.peers(), &[ProcessId::from("P2"), ProcessId::from("P3")]);
    }

    #[test]
    fn test_rejects_duplicate_and_empty_peers() {
        let router = LocalRouter::new();
        assert!(builder(&router, "P1").peers(["P2", "P2"]).build().is_err());
        assert!(builder(&router, "P1").peers(["P2", ""]).build().is_err());
        assert!(builder(&router, "").build().is_err());
    }

    #[test]
    fn test_peers_default_to_network_membership() {
        let router = LocalRouter::new();
        for id in ["P1", "P2", "P3"] {
            let engine = builder(&router, id).peers(Vec::<ProcessId>::new()).build().unwrap();
            router.register(id.into(), std::sync::Arc::new(engine));
        }

        let engine = builder(&router, "P2").build().unwrap();
        assert_eq!(engine.peers(), &[ProcessId::from("P1"), ProcessId::from("P3")]);
    }

    #[test]
    fn test_configure_closure() {
        let router = LocalRouter::new();
        let engine = builder(&router, "P1")
            .configure(|c| {
                c.reply_mode = ReplyMode::Push;
                c.initial_timestamp = 4;
            })
            .build()
            .unwrap();
        assert_eq!(engine.config().reply_mode, ReplyMode::Push);
        assert_eq!(engine.current_timestamp(), 4);
    }

    #[test]
    fn test_invalid_backoff_multiplier() {
        let router = LocalRouter::new();
        let err = builder(&router, "P1")
            .configure(|c| c.backoff_multiplier = 0.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, MutexError::Config(_)));
    }
}
