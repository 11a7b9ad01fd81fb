use crate::engine::MutexError;
use crate::request::{ProcessId, RequestRecord, ResourceId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// MESSAGES
// ============================================================================

/// Ask a peer for permission to enter a resource's critical section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub timestamp: Timestamp,
    pub process_id: ProcessId,
    pub resource_id: ResourceId,
}

impl RequestMessage {
    pub fn from_record(record: &RequestRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            process_id: record.requester.clone(),
            resource_id: record.resource.clone(),
        }
    }

    /// Validates the message and turns it into a record.
    pub fn into_record(self) -> Result<RequestRecord, MutexError> {
        validate_ids(&self.process_id, &self.resource_id)?;
        Ok(RequestRecord::new(
            self.timestamp,
            self.process_id,
            self.resource_id,
        ))
    }
}

/// Answer to a request.
///
/// Returned from `RequestEntry` (where `granted == false` means the peer
/// deferred and will push the grant later) and carried by `ReplyEntry` when a
/// deferred grant is pushed. `request_timestamp` names the request being
/// answered so stale grants can be told apart from current ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub timestamp: Timestamp,
    pub process_id: ProcessId,
    pub resource_id: ResourceId,
    pub request_timestamp: Timestamp,
    pub granted: bool,
    pub message: String,
}

impl ReplyMessage {
    pub fn grant(timestamp: Timestamp, from: ProcessId, request: &RequestRecord) -> Self {
        let message = format!("Request granted by {}", from);
        Self {
            timestamp,
            process_id: from,
            resource_id: request.resource.clone(),
            request_timestamp: request.timestamp,
            granted: true,
            message,
        }
    }

    pub fn deferred(timestamp: Timestamp, from: ProcessId, request: &RequestRecord) -> Self {
        let message = format!("Request deferred by {}", from);
        Self {
            timestamp,
            process_id: from,
            resource_id: request.resource.clone(),
            request_timestamp: request.timestamp,
            granted: false,
            message,
        }
    }

    pub fn validate(&self) -> Result<(), MutexError> {
        validate_ids(&self.process_id, &self.resource_id)
    }
}

/// Announces that a process left the critical section, or withdrew a request
/// it gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMessage {
    pub timestamp: Timestamp,
    pub process_id: ProcessId,
    pub resource_id: ResourceId,
}

impl ReleaseMessage {
    pub fn validate(&self) -> Result<(), MutexError> {
        validate_ids(&self.process_id, &self.resource_id)
    }
}

/// Acknowledgement for `ReplyEntry` and `ReleaseEntry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub timestamp: Timestamp,
    pub process_id: ProcessId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    pub process_id: ProcessId,
    /// `None` asks for the process-wide view.
    pub resource_id: Option<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub process_id: ProcessId,
    pub in_critical_section: bool,
    pub current_timestamp: Timestamp,
    /// Requesters this process is currently deferring, in priority order.
    pub pending_requests: Vec<ProcessId>,
}

fn validate_ids(process_id: &ProcessId, resource_id: &ResourceId) -> Result<(), MutexError> {
    if process_id.is_empty() {
        return Err(MutexError::InvalidMessage("empty process_id".into()));
    }
    if resource_id.is_empty() {
        return Err(MutexError::InvalidMessage("empty resource_id".into()));
    }
    Ok(())
}

// ============================================================================
// ERRORS
// ============================================================================

/// Transport-level failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Peer not found: {0}")]
    PeerNotFound(ProcessId),
    #[error("Peer {0} is unreachable")]
    Unreachable(ProcessId),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Rejected by peer: {0}")]
    Rejected(String),
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl NetworkError {
    /// Whether sending the same call again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetworkError::Unreachable(_)
                | NetworkError::ConnectionFailed(_)
                | NetworkError::Timeout
                | NetworkError::TransportError(_)
        )
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Outbound half of the transport: delivers calls to named peers.
///
/// Implementations must keep calls between one pair of processes in send
/// order and report an unreachable peer within bounded time.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// `RequestEntry`. In inline mode the call returns once the peer grants.
    async fn send_request(
        &self,
        peer: &ProcessId,
        request: RequestMessage,
    ) -> Result<ReplyMessage, NetworkError>;

    /// `ReplyEntry`: pushes a deferred grant.
    async fn send_reply(
        &self,
        peer: &ProcessId,
        reply: ReplyMessage,
    ) -> Result<AckMessage, NetworkError>;

    /// `ReleaseEntry`.
    async fn send_release(
        &self,
        peer: &ProcessId,
        release: ReleaseMessage,
    ) -> Result<AckMessage, NetworkError>;

    /// `GetStatus`.
    async fn get_status(
        &self,
        peer: &ProcessId,
        request: StatusRequest,
    ) -> Result<StatusResponse, NetworkError>;

    /// Peers this transport knows how to reach.
    fn peer_ids(&self) -> Vec<ProcessId>;
}

/// Inbound half: what a transport calls when a peer's message arrives.
#[async_trait]
pub trait ExclusionHandler: Send + Sync {
    async fn handle_request(&self, request: RequestMessage) -> Result<ReplyMessage, MutexError>;

    async fn handle_reply(&self, reply: ReplyMessage) -> Result<AckMessage, MutexError>;

    async fn handle_release(&self, release: ReleaseMessage) -> Result<AckMessage, MutexError>;

    async fn handle_status(&self, request: StatusRequest) -> Result<StatusResponse, MutexError>;
}

// ============================================================================
// IN-MEMORY TRANSPORT
// ============================================================================

/// In-process transport connecting engines that live in the same process.
///
/// Calls are delivered by invoking the target's handler directly on the
/// caller's task, so each caller sees its own messages in send order.
pub mod local {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, PoisonError, RwLock};

    struct Endpoint {
        handler: Arc<dyn ExclusionHandler>,
        reachable: bool,
    }

    /// Registry of in-process endpoints.
    #[derive(Clone, Default)]
    pub struct LocalRouter {
        endpoints: Arc<RwLock<HashMap<ProcessId, Endpoint>>>,
    }

    impl std::fmt::Debug for LocalRouter {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("LocalRouter")
                .field("members", &self.members())
                .finish()
        }
    }

    impl LocalRouter {
        pub fn new() -> Self {
            Self::default()
        }

        /// A transport that sends on behalf of `owner`.
        pub fn network(&self, owner: impl Into<ProcessId>) -> LocalNetwork {
            LocalNetwork {
                owner: owner.into(),
                router: self.clone(),
            }
        }

        /// Makes `handler` reachable under `id`.
        pub fn register(&self, id: ProcessId, handler: Arc<dyn ExclusionHandler>) {
            let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
            endpoints.insert(
                id,
                Endpoint {
                    handler,
                    reachable: true,
                },
            );
        }

        /// Simulates a crash or partition of `id` (both directions).
        pub fn set_reachable(&self, id: &ProcessId, reachable: bool) {
            let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(endpoint) = endpoints.get_mut(id) {
                endpoint.reachable = reachable;
                tracing::debug!(process_id = %id, reachable, "Local endpoint reachability changed");
            }
        }

        /// Registered ids, sorted.
        pub fn members(&self) -> Vec<ProcessId> {
            let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
            let mut ids: Vec<_> = endpoints.keys().cloned().collect();
            ids.sort();
            ids
        }

        fn route(
            &self,
            from: &ProcessId,
            to: &ProcessId,
        ) -> Result<Arc<dyn ExclusionHandler>, NetworkError> {
            let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
            if endpoints.get(from).is_some_and(|e| !e.reachable) {
                return Err(NetworkError::Unreachable(to.clone()));
            }
            match endpoints.get(to) {
                Some(endpoint) if endpoint.reachable => Ok(endpoint.handler.clone()),
                Some(_) => Err(NetworkError::Unreachable(to.clone())),
                None => Err(NetworkError::PeerNotFound(to.clone())),
            }
        }
    }

    /// `PeerNetwork` over a `LocalRouter`.
    #[derive(Clone, Debug)]
    pub struct LocalNetwork {
        owner: ProcessId,
        router: LocalRouter,
    }

    fn rejected(e: MutexError) -> NetworkError {
        NetworkError::Rejected(e.to_string())
    }

    #[async_trait]
    impl PeerNetwork for LocalNetwork {
        async fn send_request(
            &self,
            peer: &ProcessId,
            request: RequestMessage,
        ) -> Result<ReplyMessage, NetworkError> {
            let handler = self.router.route(&self.owner, peer)?;
            handler.handle_request(request).await.map_err(rejected)
        }

        async fn send_reply(
            &self,
            peer: &ProcessId,
            reply: ReplyMessage,
        ) -> Result<AckMessage, NetworkError> {
            let handler = self.router.route(&self.owner, peer)?;
            handler.handle_reply(reply).await.map_err(rejected)
        }

        async fn send_release(
            &self,
            peer: &ProcessId,
            release: ReleaseMessage,
        ) -> Result<AckMessage, NetworkError> {
            let handler = self.router.route(&self.owner, peer)?;
            handler.handle_release(release).await.map_err(rejected)
        }

        async fn get_status(
            &self,
            peer: &ProcessId,
            request: StatusRequest,
        ) -> Result<StatusResponse, NetworkError> {
            let handler = self.router.route(&self.owner, peer)?;
            handler.handle_status(request).await.map_err(rejected)
        }

        fn peer_ids(&self) -> Vec<ProcessId> {
            self.router
                .members()
                .into_iter()
                .filter(|id| id != &self.owner)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::local::LocalRouter;
    use super::*;
    use std::sync::Arc;

    /// Grants everything and echoes status.
    struct EchoHandler(ProcessId);

    #[async_trait]
    impl ExclusionHandler for EchoHandler {
        async fn handle_request(&self, request: RequestMessage) -> Result<ReplyMessage, MutexError> {
            let record = request.into_record()?;
            Ok(ReplyMessage::grant(record.timestamp + 1, self.0.clone(), &record))
        }

        async fn handle_reply(&self, reply: ReplyMessage) -> Result<AckMessage, MutexError> {
            Ok(AckMessage {
                timestamp: reply.timestamp + 1,
                process_id: self.0.clone(),
            })
        }

        async fn handle_release(&self, release: ReleaseMessage) -> Result<AckMessage, MutexError> {
            Ok(AckMessage {
                timestamp: release.timestamp + 1,
                process_id: self.0.clone(),
            })
        }

        async fn handle_status(&self, _request: StatusRequest) -> Result<StatusResponse, MutexError> {
            Ok(StatusResponse {
                process_id: self.0.clone(),
                in_critical_section: false,
                current_timestamp: 0,
                pending_requests: Vec::new(),
            })
        }
    }

    fn request(ts: Timestamp, from: &str) -> RequestMessage {
        RequestMessage {
            timestamp: ts,
            process_id: from.into(),
            resource_id: "resA".into(),
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(request(1, "P1").into_record().is_ok());
        assert!(matches!(
            request(1, "").into_record(),
            Err(MutexError::InvalidMessage(_))
        ));

        let mut missing_resource = request(1, "P1");
        missing_resource.resource_id = ResourceId::from("");
        assert!(missing_resource.into_record().is_err());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(NetworkError::Timeout.is_retryable());
        assert!(NetworkError::Unreachable("P".into()).is_retryable());
        assert!(!NetworkError::Rejected("no".into()).is_retryable());
        assert!(!NetworkError::PeerNotFound("P".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_local_router_delivers() {
        let router = LocalRouter::new();
        router.register("P2".into(), Arc::new(EchoHandler("P2".into())));
        router.register("P1".into(), Arc::new(EchoHandler("P1".into())));

        let net = router.network("P1");
        assert_eq!(net.peer_ids(), vec![ProcessId::from("P2")]);

        let reply = net.send_request(&"P2".into(), request(4, "P1")).await.unwrap();
        assert!(reply.granted);
        assert_eq!(reply.process_id, ProcessId::from("P2"));
        assert_eq!(reply.request_timestamp, 4);
    }

    #[tokio::test]
    async fn test_local_router_unreachable_and_unknown() {
        let router = LocalRouter::new();
        router.register("P1".into(), Arc::new(EchoHandler("P1".into())));
        router.register("P2".into(), Arc::new(EchoHandler("P2".into())));
        let net = router.network("P1");

        router.set_reachable(&"P2".into(), false);
        let err = net.send_request(&"P2".into(), request(1, "P1")).await.unwrap_err();
        assert_eq!(err, NetworkError::Unreachable("P2".into()));

        router.set_reachable(&"P2".into(), true);
        assert!(net.send_request(&"P2".into(), request(1, "P1")).await.is_ok());

        let err = net.send_request(&"P9".into(), request(1, "P1")).await.unwrap_err();
        assert_eq!(err, NetworkError::PeerNotFound("P9".into()));
    }

    #[tokio::test]
    async fn test_local_router_rejection_is_not_retryable() {
        let router = LocalRouter::new();
        router.register("P1".into(), Arc::new(EchoHandler("P1".into())));
        router.register("P2".into(), Arc::new(EchoHandler("P2".into())));

        let err = router
            .network("P1")
            .send_request(&"P2".into(), request(1, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Rejected(_)));
        assert!(!err.is_retryable());
    }
}
