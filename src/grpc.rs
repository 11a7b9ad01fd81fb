//! gRPC Transport for Mutual Exclusion
//!
//! Tonic client and server for the `ExclusionManager` service, with a
//! per-peer connection pool and circuit breaker.

use crate::engine::MutexError;
use crate::metrics::MutexMetrics;
use crate::network::{
    AckMessage, ExclusionHandler, NetworkError, PeerNetwork, ReleaseMessage, ReplyMessage,
    RequestMessage, StatusRequest, StatusResponse,
};
use crate::request::{ProcessId, ResourceId, Timestamp};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

// Include generated protobuf code
pub mod proto {
    tonic::include_proto!("exclusion");
}

use proto::exclusion_manager_client::ExclusionManagerClient;
use proto::exclusion_manager_server::{ExclusionManager, ExclusionManagerServer};
use tonic::{
    Code, Request, Response, Status,
    transport::{Channel, Endpoint, Server},
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for gRPC transport.
#[derive(Debug, Clone)]
pub struct GrpcConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Per-call timeout. With inline replies a `RequestEntry` call stays open
    /// while the peer holds the resource, so this must cover the longest
    /// expected hold.
    pub request_timeout: Duration,
    /// HTTP/2 keep-alive interval
    pub keep_alive_interval: Duration,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Number of successes in half-open state to close
    pub success_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Breaker {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// Circuit breaker guarding the calls to one peer.
#[derive(Debug)]
pub struct CircuitBreaker {
    peer: ProcessId,
    state: Mutex<Breaker>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(peer: ProcessId, config: CircuitBreakerConfig) -> Self {
        Self {
            peer,
            state: Mutex::new(Breaker::Closed { failures: 0 }),
            config,
        }
    }

    fn breaker(&self) -> MutexGuard<'_, Breaker> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        match *self.breaker() {
            Breaker::Closed { .. } => CircuitState::Closed,
            Breaker::Open { .. } => CircuitState::Open,
            Breaker::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Whether a call to the peer may go out. An open breaker lets a trial
    /// call through once `reset_timeout` has passed.
    pub fn allow_request(&self) -> bool {
        let mut breaker = self.breaker();
        match *breaker {
            Breaker::Open { since } if since.elapsed() >= self.config.reset_timeout => {
                tracing::debug!(peer = %self.peer, "Circuit breaker half-open, probing peer");
                *breaker = Breaker::HalfOpen { successes: 0 };
                true
            }
            Breaker::Open { .. } => false,
            Breaker::Closed { .. } | Breaker::HalfOpen { .. } => true,
        }
    }

    pub fn record_success(&self) {
        let mut breaker = self.breaker();
        match *breaker {
            Breaker::Closed { ref mut failures } => *failures = 0,
            Breaker::HalfOpen { successes } if successes + 1 >= self.config.success_threshold => {
                *breaker = Breaker::Closed { failures: 0 };
                tracing::info!(peer = %self.peer, "Circuit breaker closed");
            }
            Breaker::HalfOpen { ref mut successes } => *successes += 1,
            Breaker::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut breaker = self.breaker();
        match *breaker {
            Breaker::Closed { failures } if failures + 1 >= self.config.failure_threshold => {
                *breaker = Breaker::Open { since: Instant::now() };
                tracing::warn!(peer = %self.peer, failures = failures + 1, "Circuit breaker opened");
            }
            Breaker::Closed { ref mut failures } => *failures += 1,
            Breaker::HalfOpen { .. } => {
                *breaker = Breaker::Open { since: Instant::now() };
                tracing::warn!(peer = %self.peer, "Circuit breaker re-opened");
            }
            Breaker::Open { .. } => {}
        }
    }
}

/// Whether a failed call counts against the peer's breaker. A `RequestEntry`
/// that runs out of time is usually a grant still deferred by a live peer.
fn trips_breaker(method: &str, code: Code) -> bool {
    match code {
        Code::DeadlineExceeded | Code::Cancelled => method != "request_entry",
        Code::Unavailable => true,
        _ => false,
    }
}

// ============================================================================
// CONNECTION POOL
// ============================================================================

struct PeerConnection {
    address: String,
    client: Option<ExclusionManagerClient<Channel>>,
    circuit_breaker: CircuitBreaker,
}

/// Lazily connected clients for a fixed set of peers.
pub struct ConnectionPool {
    connections: RwLock<HashMap<ProcessId, PeerConnection>>,
    config: GrpcConfig,
}

impl ConnectionPool {
    pub fn new(config: GrpcConfig, peers: impl IntoIterator<Item = (ProcessId, String)>) -> Self {
        let connections = peers
            .into_iter()
            .map(|(id, address)| {
                let connection = PeerConnection {
                    address,
                    client: None,
                    circuit_breaker: CircuitBreaker::new(id.clone(), config.circuit_breaker.clone()),
                };
                (id, connection)
            })
            .collect();

        Self {
            connections: RwLock::new(connections),
            config,
        }
    }

    /// Gets or creates the client for a peer.
    pub async fn get_connection(
        &self,
        peer: &ProcessId,
    ) -> Result<ExclusionManagerClient<Channel>, NetworkError> {
        let address = {
            let connections = self.connections.read().await;
            let conn = connections
                .get(peer)
                .ok_or_else(|| NetworkError::PeerNotFound(peer.clone()))?;
            if !conn.circuit_breaker.allow_request() {
                return Err(NetworkError::ConnectionFailed(format!(
                    "circuit breaker open for {}",
                    peer
                )));
            }
            if let Some(client) = &conn.client {
                return Ok(client.clone());
            }
            conn.address.clone()
        };

        let endpoint = Endpoint::from_shared(normalize_address(&address))
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .http2_keep_alive_interval(self.config.keep_alive_interval);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| {
                tracing::debug!(peer = %peer, error = %e, "gRPC connect failed");
                NetworkError::Unreachable(peer.clone())
            })?;
        let client = ExclusionManagerClient::new(channel);

        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(peer) {
            conn.client = Some(client.clone());
        }

        tracing::info!(peer = %peer, address = %address, "Created new gRPC connection");
        Ok(client)
    }

    pub async fn record_success(&self, peer: &ProcessId) {
        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(peer) {
            conn.circuit_breaker.record_success();
        }
    }

    /// Records a failure; connection-level failures also drop the cached
    /// client so the next call reconnects.
    pub async fn record_failure(&self, peer: &ProcessId, reconnect: bool) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(peer) {
            conn.circuit_breaker.record_failure();
            if reconnect {
                conn.client = None;
            }
        }
    }

    pub async fn circuit_state(&self, peer: &ProcessId) -> Option<CircuitState> {
        let connections = self.connections.read().await;
        connections.get(peer).map(|c| c.circuit_breaker.state())
    }

    async fn peer_ids(&self) -> Vec<ProcessId> {
        let connections = self.connections.read().await;
        let mut ids: Vec<_> = connections.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn normalize_address(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_wire(timestamp: Timestamp) -> Result<i64, NetworkError> {
    i64::try_from(timestamp)
        .map_err(|_| NetworkError::Rejected(format!("timestamp {} exceeds wire range", timestamp)))
}

fn from_wire(timestamp: i64, field: &str) -> Result<Timestamp, MutexError> {
    u64::try_from(timestamp)
        .map_err(|_| MutexError::InvalidMessage(format!("negative {}: {}", field, timestamp)))
}

fn invalid_response(e: MutexError) -> NetworkError {
    NetworkError::TransportError(format!("malformed response: {}", e))
}

impl TryFrom<proto::RequestMessage> for RequestMessage {
    type Error = MutexError;

    fn try_from(m: proto::RequestMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: from_wire(m.timestamp, "timestamp")?,
            process_id: m.process_id.into(),
            resource_id: m.resource_id.into(),
        })
    }
}

impl TryFrom<proto::ReplyMessage> for ReplyMessage {
    type Error = MutexError;

    fn try_from(m: proto::ReplyMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: from_wire(m.timestamp, "timestamp")?,
            process_id: m.process_id.into(),
            resource_id: m.resource_id.into(),
            request_timestamp: from_wire(m.request_timestamp, "request_timestamp")?,
            granted: m.granted,
            message: m.message,
        })
    }
}

impl TryFrom<proto::ReleaseMessage> for ReleaseMessage {
    type Error = MutexError;

    fn try_from(m: proto::ReleaseMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: from_wire(m.timestamp, "timestamp")?,
            process_id: m.process_id.into(),
            resource_id: m.resource_id.into(),
        })
    }
}

impl TryFrom<proto::AckMessage> for AckMessage {
    type Error = MutexError;

    fn try_from(m: proto::AckMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: from_wire(m.timestamp, "timestamp")?,
            process_id: m.process_id.into(),
        })
    }
}

impl From<proto::StatusRequest> for StatusRequest {
    fn from(m: proto::StatusRequest) -> Self {
        Self {
            process_id: m.process_id.into(),
            resource_id: (!m.resource_id.is_empty()).then(|| ResourceId::from(m.resource_id)),
        }
    }
}

impl TryFrom<proto::StatusResponse> for StatusResponse {
    type Error = MutexError;

    fn try_from(m: proto::StatusResponse) -> Result<Self, Self::Error> {
        Ok(Self {
            process_id: m.process_id.into(),
            in_critical_section: m.in_critical_section,
            current_timestamp: from_wire(m.current_timestamp, "current_timestamp")?,
            pending_requests: m.pending_requests.into_iter().map(ProcessId::from).collect(),
        })
    }
}

fn request_to_proto(m: &RequestMessage) -> Result<proto::RequestMessage, NetworkError> {
    Ok(proto::RequestMessage {
        timestamp: to_wire(m.timestamp)?,
        process_id: m.process_id.to_string(),
        resource_id: m.resource_id.to_string(),
    })
}

fn reply_to_proto(m: &ReplyMessage) -> Result<proto::ReplyMessage, NetworkError> {
    Ok(proto::ReplyMessage {
        timestamp: to_wire(m.timestamp)?,
        process_id: m.process_id.to_string(),
        granted: m.granted,
        message: m.message.clone(),
        resource_id: m.resource_id.to_string(),
        request_timestamp: to_wire(m.request_timestamp)?,
    })
}

fn release_to_proto(m: &ReleaseMessage) -> Result<proto::ReleaseMessage, NetworkError> {
    Ok(proto::ReleaseMessage {
        timestamp: to_wire(m.timestamp)?,
        process_id: m.process_id.to_string(),
        resource_id: m.resource_id.to_string(),
    })
}

fn ack_to_proto(m: &AckMessage) -> Result<proto::AckMessage, Status> {
    Ok(proto::AckMessage {
        timestamp: to_wire(m.timestamp).map_err(|e| Status::internal(e.to_string()))?,
        process_id: m.process_id.to_string(),
    })
}

fn status_request_to_proto(m: &StatusRequest) -> proto::StatusRequest {
    proto::StatusRequest {
        process_id: m.process_id.to_string(),
        resource_id: m
            .resource_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    }
}

fn status_response_to_proto(m: &StatusResponse) -> Result<proto::StatusResponse, Status> {
    Ok(proto::StatusResponse {
        process_id: m.process_id.to_string(),
        in_critical_section: m.in_critical_section,
        current_timestamp: to_wire(m.current_timestamp)
            .map_err(|e| Status::internal(e.to_string()))?,
        pending_requests: m.pending_requests.iter().map(ToString::to_string).collect(),
    })
}

/// Maps engine errors onto gRPC status codes.
pub fn status_from_error(e: MutexError) -> Status {
    let message = e.to_string();
    match e {
        MutexError::InvalidMessage(_) => Status::invalid_argument(message),
        MutexError::UnknownPeer(_) => Status::permission_denied(message),
        MutexError::AlreadyPending { .. } | MutexError::NotHeld { .. } => {
            Status::failed_precondition(message)
        }
        MutexError::RequestWithdrawn { .. } => Status::aborted(message),
        MutexError::AttemptTimedOut { .. } => Status::deadline_exceeded(message),
        MutexError::PeerUnreachable { .. } | MutexError::Network(_) => {
            Status::unavailable(message)
        }
        MutexError::Config(_) => Status::internal(message),
    }
}

/// Maps a failed call onto the transport error the retry policy understands.
fn error_from_status(peer: &ProcessId, status: &Status) -> NetworkError {
    match status.code() {
        Code::Unavailable => NetworkError::Unreachable(peer.clone()),
        Code::DeadlineExceeded | Code::Cancelled => NetworkError::Timeout,
        Code::InvalidArgument
        | Code::PermissionDenied
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::NotFound => NetworkError::Rejected(status.message().to_string()),
        _ => NetworkError::TransportError(status.to_string()),
    }
}

// ============================================================================
// GRPC TRANSPORT
// ============================================================================

/// `PeerNetwork` over gRPC.
pub struct GrpcTransport {
    id: ProcessId,
    pool: Arc<ConnectionPool>,
    peer_ids: Vec<ProcessId>,
    metrics: Option<MutexMetrics>,
}

impl GrpcTransport {
    /// Creates a transport for `id` that can reach every `(peer, address)`.
    pub fn new(
        id: ProcessId,
        config: GrpcConfig,
        peers: impl IntoIterator<Item = (ProcessId, String)>,
        metrics: Option<MutexMetrics>,
    ) -> Self {
        let mut peers: Vec<_> = peers.into_iter().collect();
        peers.sort();
        let peer_ids = peers.iter().map(|(id, _)| id.clone()).collect();

        Self {
            id,
            pool: Arc::new(ConnectionPool::new(config, peers)),
            peer_ids,
            metrics,
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs one call against `peer`, feeding the outcome into its circuit
    /// breaker and the RPC latency metrics.
    async fn call<R, F, Fut>(&self, peer: &ProcessId, method: &'static str, operation: F) -> Result<R, NetworkError>
    where
        F: FnOnce(ExclusionManagerClient<Channel>) -> Fut,
        Fut: Future<Output = Result<Response<R>, Status>>,
    {
        let start = std::time::Instant::now();
        let client = match self.pool.get_connection(peer).await {
            Ok(client) => client,
            Err(e) => {
                self.pool.record_failure(peer, true).await;
                return Err(e);
            }
        };

        let result = operation(client).await;

        if let Some(metrics) = &self.metrics {
            metrics.observe_rpc(method, start.elapsed());
        }

        match result {
            Ok(response) => {
                self.pool.record_success(peer).await;
                Ok(response.into_inner())
            }
            Err(status) => {
                let error = error_from_status(peer, &status);
                if trips_breaker(method, status.code()) {
                    self.pool
                        .record_failure(peer, status.code() == Code::Unavailable)
                        .await;
                }
                tracing::debug!(peer = %peer, method, code = ?status.code(), "gRPC call failed");
                Err(error)
            }
        }
    }
}

#[async_trait]
impl PeerNetwork for GrpcTransport {
    async fn send_request(
        &self,
        peer: &ProcessId,
        request: RequestMessage,
    ) -> Result<ReplyMessage, NetworkError> {
        let message = request_to_proto(&request)?;
        let reply = self
            .call(peer, "request_entry", |mut client| async move {
                client.request_entry(Request::new(message)).await
            })
            .await?;
        ReplyMessage::try_from(reply).map_err(invalid_response)
    }

    async fn send_reply(
        &self,
        peer: &ProcessId,
        reply: ReplyMessage,
    ) -> Result<AckMessage, NetworkError> {
        let message = reply_to_proto(&reply)?;
        let ack = self
            .call(peer, "reply_entry", |mut client| async move {
                client.reply_entry(Request::new(message)).await
            })
            .await?;
        AckMessage::try_from(ack).map_err(invalid_response)
    }

    async fn send_release(
        &self,
        peer: &ProcessId,
        release: ReleaseMessage,
    ) -> Result<AckMessage, NetworkError> {
        let message = release_to_proto(&release)?;
        let ack = self
            .call(peer, "release_entry", |mut client| async move {
                client.release_entry(Request::new(message)).await
            })
            .await?;
        AckMessage::try_from(ack).map_err(invalid_response)
    }

    async fn get_status(
        &self,
        peer: &ProcessId,
        request: StatusRequest,
    ) -> Result<StatusResponse, NetworkError> {
        let message = status_request_to_proto(&request);
        let status = self
            .call(peer, "get_status", |mut client| async move {
                client.get_status(Request::new(message)).await
            })
            .await?;
        StatusResponse::try_from(status).map_err(invalid_response)
    }

    fn peer_ids(&self) -> Vec<ProcessId> {
        self.peer_ids.clone()
    }
}

// ============================================================================
// GRPC SERVER
// ============================================================================

/// `ExclusionManager` service backed by an `ExclusionHandler`.
pub struct ExclusionService {
    handler: Arc<dyn ExclusionHandler>,
}

impl ExclusionService {
    pub fn new(handler: Arc<dyn ExclusionHandler>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl ExclusionManager for ExclusionService {
    async fn request_entry(
        &self,
        request: Request<proto::RequestMessage>,
    ) -> Result<Response<proto::ReplyMessage>, Status> {
        let message = RequestMessage::try_from(request.into_inner()).map_err(status_from_error)?;
        let reply = self
            .handler
            .handle_request(message)
            .await
            .map_err(status_from_error)?;
        let reply = reply_to_proto(&reply).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(reply))
    }

    async fn reply_entry(
        &self,
        request: Request<proto::ReplyMessage>,
    ) -> Result<Response<proto::AckMessage>, Status> {
        let message = ReplyMessage::try_from(request.into_inner()).map_err(status_from_error)?;
        let ack = self
            .handler
            .handle_reply(message)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(ack_to_proto(&ack)?))
    }

    async fn release_entry(
        &self,
        request: Request<proto::ReleaseMessage>,
    ) -> Result<Response<proto::AckMessage>, Status> {
        let message = ReleaseMessage::try_from(request.into_inner()).map_err(status_from_error)?;
        let ack = self
            .handler
            .handle_release(message)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(ack_to_proto(&ack)?))
    }

    async fn get_status(
        &self,
        request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let status = self
            .handler
            .handle_status(request.into_inner().into())
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(status_response_to_proto(&status)?))
    }
}

/// Serves `handler` on `addr` until the process exits.
pub async fn start_grpc_server(
    addr: SocketAddr,
    handler: Arc<dyn ExclusionHandler>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    start_grpc_server_with_shutdown(addr, handler, std::future::pending()).await
}

/// Serves `handler` on `addr` until `shutdown` completes.
pub async fn start_grpc_server_with_shutdown(
    addr: SocketAddr,
    handler: Arc<dyn ExclusionHandler>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::info!(addr = %addr, "Starting gRPC server");

    Server::builder()
        .add_service(ExclusionManagerServer::new(ExclusionService::new(handler)))
        .serve_with_shutdown(addr, shutdown)
        .await?;

    tracing::info!(addr = %addr, "gRPC server stopped");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
