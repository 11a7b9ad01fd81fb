//! Mutual Exclusion Engine
//!
//! Ricart-Agrawala over Lamport clocks. One `MutexEngine` per process owns the
//! clock and the state of every resource, drives acquisition attempts to
//! completion, and answers the calls peers make to it.

use crate::clock::{ClockEvent, LamportClock};
use crate::deferred::{DeferredReply, Responder};
use crate::metrics::{self, MutexMetrics};
use crate::network::{
    AckMessage, ExclusionHandler, NetworkError, PeerNetwork, ReleaseMessage, ReplyMessage,
    RequestMessage, StatusRequest, StatusResponse,
};
use crate::quorum::{MembershipPolicy, ReplyOutcome, RetryPolicy};
use crate::request::{ProcessId, RequestRecord, ResourceId, Timestamp};
use crate::state_machine::{AbortOutcome, LockState, RequestDecision, ResourceState, ResourceStatus};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How a deferred grant is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// `RequestEntry` stays open until the grant is given and returns it.
    #[default]
    Inline,
    /// `RequestEntry` returns a deferral at once; the grant follows as a
    /// separate `ReplyEntry` call.
    Push,
}

/// Engine timing and policy configuration.
#[derive(Debug, Clone)]
pub struct MutexConfig {
    /// Deadline used by `acquire` when the caller gives none.
    pub acquire_timeout: Duration,
    /// Retries per peer call before the peer counts as unreachable.
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
    /// Backoff growth factor.
    pub backoff_multiplier: f64,
    pub reply_mode: ReplyMode,
    pub membership: MembershipPolicy,
    /// Clock movements to remember (0 disables the history).
    pub clock_history: usize,
    /// Starting value of the logical clock.
    pub initial_timestamp: Timestamp,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            reply_mode: ReplyMode::Inline,
            membership: MembershipPolicy::Strict,
            clock_history: 0,
            initial_timestamp: 0,
        }
    }
}

impl MutexConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Error type for mutual exclusion operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MutexError {
    #[error("An acquisition of {resource} is already pending or held")]
    AlreadyPending { resource: ResourceId },
    #[error("Resource {resource} is not held")]
    NotHeld { resource: ResourceId },
    #[error("Quorum for {resource} not reached before the deadline")]
    AttemptTimedOut { resource: ResourceId },
    #[error("Peer {peer} is unreachable: {reason}")]
    PeerUnreachable { peer: ProcessId, reason: String },
    #[error("Unknown peer: {0}")]
    UnknownPeer(ProcessId),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Request for {resource} was withdrawn before it was granted")]
    RequestWithdrawn { resource: ResourceId },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Network error: {0}")]
    Network(String),
}

impl From<NetworkError> for MutexError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Unreachable(peer) => MutexError::PeerUnreachable {
                reason: "unreachable".to_string(),
                peer,
            },
            NetworkError::PeerNotFound(peer) => MutexError::UnknownPeer(peer),
            other => MutexError::Network(other.to_string()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// ENGINE
// ============================================================================

/// Proof of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub resource: ResourceId,
    /// Timestamp of the request that won.
    pub request_timestamp: Timestamp,
}

type Slot = Arc<Mutex<ResourceState>>;

struct EngineInner<N> {
    id: ProcessId,
    peers: Vec<ProcessId>,
    network: N,
    config: MutexConfig,
    retry: RetryPolicy,
    // Lock order: the resource map or a resource slot before the clock, never
    // the reverse. The map and a slot are never held together.
    clock: Mutex<LamportClock>,
    resources: Mutex<HashMap<ResourceId, Slot>>,
    metrics: MutexMetrics,
}

impl<N> EngineInner<N> {
    fn clock(&self) -> MutexGuard<'_, LamportClock> {
        lock(&self.clock)
    }

    fn tick(&self, event: &'static str) -> Timestamp {
        let timestamp = self.clock().tick(event);
        self.metrics.set_clock(timestamp);
        timestamp
    }

    fn observe(&self, remote: Timestamp, from: &ProcessId) -> Timestamp {
        let timestamp = self.clock().observe(remote, from);
        self.metrics.set_clock(timestamp);
        timestamp
    }

    fn slot(&self, resource: &ResourceId) -> Slot {
        lock(&self.resources)
            .entry(resource.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ResourceState::new(resource.clone()))))
            .clone()
    }

    fn existing_slot(&self, resource: &ResourceId) -> Option<Slot> {
        lock(&self.resources).get(resource).cloned()
    }

    fn all_slots(&self) -> Vec<Slot> {
        let mut slots: Vec<_> = lock(&self.resources)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots.into_iter().map(|(_, slot)| slot).collect()
    }

    /// Rejects messages from ourselves or from outside the peer set.
    fn check_sender(&self, sender: &ProcessId) -> Result<(), MutexError> {
        if sender == &self.id {
            return Err(MutexError::InvalidMessage(format!(
                "message from self ({})",
                sender
            )));
        }
        if !self.peers.contains(sender) {
            return Err(MutexError::UnknownPeer(sender.clone()));
        }
        Ok(())
    }
}

/// Outcome of deciding on an incoming request.
enum Deferral {
    Granted(ReplyMessage),
    Waiting(oneshot::Receiver<ReplyMessage>),
    Acknowledged(Timestamp),
}

/// Distributed mutual exclusion engine for one process.
///
/// Cheap to clone; clones share all state.
pub struct MutexEngine<N> {
    inner: Arc<EngineInner<N>>,
}

impl<N> Clone for MutexEngine<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N> std::fmt::Debug for MutexEngine<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexEngine")
            .field("id", &self.inner.id)
            .field("peers", &self.inner.peers)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<N: PeerNetwork + 'static> MutexEngine<N> {
    /// Creates an engine. Prefer `MutexEngineBuilder`, which validates the
    /// peer set.
    pub fn new(
        id: ProcessId,
        peers: Vec<ProcessId>,
        network: N,
        config: MutexConfig,
        metrics: MutexMetrics,
    ) -> Self {
        tracing::info!(
            process_id = %id,
            peer_count = peers.len(),
            reply_mode = ?config.reply_mode,
            membership = ?config.membership,
            "Creating mutual exclusion engine"
        );

        let clock = LamportClock::with_history(config.initial_timestamp, config.clock_history);
        Self {
            inner: Arc::new(EngineInner {
                id,
                peers,
                network,
                retry: config.retry_policy(),
                config,
                clock: Mutex::new(clock),
                resources: Mutex::new(HashMap::new()),
                metrics,
            }),
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.inner.id
    }

    pub fn peers(&self) -> &[ProcessId] {
        &self.inner.peers
    }

    pub fn config(&self) -> &MutexConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &MutexMetrics {
        &self.inner.metrics
    }

    pub fn network(&self) -> &N {
        &self.inner.network
    }

    /// Current logical time.
    pub fn current_timestamp(&self) -> Timestamp {
        self.inner.clock().now()
    }

    /// Recorded clock movements, oldest first.
    pub fn clock_history(&self) -> Vec<(Timestamp, ClockEvent)> {
        self.inner.clock().history()
    }

    // ========================================================================
    // ACQUIRE
    // ========================================================================

    /// Acquires `resource` using the configured deadline.
    pub async fn acquire(&self, resource: impl Into<ResourceId>) -> Result<Acquired, MutexError> {
        self.acquire_timeout(resource, self.inner.config.acquire_timeout)
            .await
    }

    /// Acquires `resource`, giving up after `timeout`.
    pub async fn acquire_timeout(
        &self,
        resource: impl Into<ResourceId>,
        timeout: Duration,
    ) -> Result<Acquired, MutexError> {
        self.acquire_until(resource, Instant::now() + timeout).await
    }

    /// Acquires `resource`, giving up at `deadline`.
    ///
    /// Dropping the returned future abandons the attempt the same way a
    /// missed deadline does.
    pub async fn acquire_until(
        &self,
        resource: impl Into<ResourceId>,
        deadline: Instant,
    ) -> Result<Acquired, MutexError> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(MutexError::InvalidMessage("empty resource id".into()));
        }

        let slot = self.inner.slot(&resource);
        let (record, mut granted) = {
            let mut state = lock(&slot);
            if state.state() != LockState::Released {
                return Err(MutexError::AlreadyPending { resource });
            }
            let timestamp = self.inner.tick("request critical section");
            let record = RequestRecord::new(timestamp, self.inner.id.clone(), resource.clone());
            let granted = state.begin(record.clone(), &self.inner.peers)?;
            (record, granted)
        };

        let started = std::time::Instant::now();
        self.inner.metrics.inc_acquisitions();
        tracing::debug!(
            process_id = %self.inner.id,
            resource = %resource,
            timestamp = record.timestamp,
            peer_count = self.inner.peers.len(),
            "Requesting critical section"
        );

        let mut guard = AttemptGuard {
            engine: Some(self.clone()),
            record: record.clone(),
        };

        let mut fanout: FuturesUnordered<_> = self
            .inner
            .peers
            .iter()
            .map(|peer| self.solicit(peer, &record))
            .collect();
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        let failure = loop {
            tokio::select! {
                biased;

                result = &mut granted => {
                    if result.is_ok() {
                        guard.disarm();
                        return Ok(self.entered(&record, started));
                    }
                    break MutexError::AttemptTimedOut { resource: resource.clone() };
                }

                Some(outcome) = fanout.next(), if !fanout.is_empty() => {
                    if let Err(peer) = outcome {
                        tracing::warn!(
                            process_id = %self.inner.id,
                            resource = %resource,
                            peer = %peer,
                            "Peer unreachable after retries, abandoning attempt"
                        );
                        break MutexError::AttemptTimedOut { resource: resource.clone() };
                    }
                }

                _ = &mut expired => {
                    tracing::warn!(
                        process_id = %self.inner.id,
                        resource = %resource,
                        timestamp = record.timestamp,
                        "Deadline reached before quorum"
                    );
                    break MutexError::AttemptTimedOut { resource: resource.clone() };
                }
            }
        };

        guard.disarm();
        drop(fanout);
        match self.abandon(&record).await {
            AbandonResult::Held => Ok(self.entered(&record, started)),
            AbandonResult::Abandoned => {
                self.inner.metrics.inc_acquisitions_timed_out();
                Err(failure)
            }
        }
    }

    fn entered(&self, record: &RequestRecord, started: std::time::Instant) -> Acquired {
        self.inner.metrics.inc_acquisitions_granted();
        self.inner.metrics.inc_held();
        self.inner.metrics.observe_acquire(started.elapsed());
        metrics::trace_entered_critical_section(&self.inner.id, &record.resource, record.timestamp);
        Acquired {
            resource: record.resource.clone(),
            request_timestamp: record.timestamp,
        }
    }

    /// Sends the request to one peer. `Err` names a peer that stayed
    /// unreachable under the strict membership policy.
    async fn solicit(&self, peer: &ProcessId, record: &RequestRecord) -> Result<(), ProcessId> {
        let message = RequestMessage::from_record(record);
        let result = self
            .inner
            .retry
            .run(peer, "request_entry", || {
                self.inner.network.send_request(peer, message.clone())
            })
            .await;

        match result {
            Ok(reply) if reply.granted => {
                self.on_grant(&reply);
                Ok(())
            }
            Ok(reply) => {
                self.inner.observe(reply.timestamp, &reply.process_id);
                tracing::debug!(
                    process_id = %self.inner.id,
                    peer = %peer,
                    resource = %record.resource,
                    "Request deferred, awaiting pushed grant"
                );
                Ok(())
            }
            Err(e) => match self.inner.config.membership {
                MembershipPolicy::Strict => {
                    tracing::warn!(peer = %peer, error = %e, "Peer did not answer request");
                    Err(peer.clone())
                }
                MembershipPolicy::ExcludeUnreachable => {
                    tracing::warn!(
                        process_id = %self.inner.id,
                        peer = %peer,
                        resource = %record.resource,
                        error = %e,
                        "Excluding unreachable peer from quorum; exclusion is unsafe if it recovers"
                    );
                    self.exclude(peer, record);
                    Ok(())
                }
            },
        }
    }

    fn granted(&self, reply: ReplyMessage, record: &RequestRecord) -> ReplyMessage {
        self.inner.metrics.inc_grants_sent();
        tracing::debug!(process_id = %self.inner.id, request = %record, "Granted request");
        reply
    }

    fn exclude(&self, peer: &ProcessId, record: &RequestRecord) {
        let Some(slot) = self.inner.existing_slot(&record.resource) else {
            return;
        };
        let outcome = lock(&slot).exclude(record.timestamp, peer);
        tracing::debug!(peer = %peer, outcome = ?outcome, "Peer excluded");
    }

    /// Counts a grant towards the matching attempt.
    fn on_grant(&self, reply: &ReplyMessage) -> ReplyOutcome {
        let Some(slot) = self.inner.existing_slot(&reply.resource_id) else {
            tracing::debug!(
                peer = %reply.process_id,
                resource = %reply.resource_id,
                "Grant for a resource never requested"
            );
            return ReplyOutcome::Stale;
        };

        let outcome = {
            let mut state = lock(&slot);
            self.inner.observe(reply.timestamp, &reply.process_id);
            state.on_grant(reply.request_timestamp, &reply.process_id)
        };

        tracing::debug!(
            process_id = %self.inner.id,
            peer = %reply.process_id,
            resource = %reply.resource_id,
            request_timestamp = reply.request_timestamp,
            outcome = ?outcome,
            "Received grant"
        );
        outcome
    }

    // ========================================================================
    // RELEASE
    // ========================================================================

    /// Leaves the critical section of `resource`, then grants every request
    /// deferred meanwhile. Returns the release timestamp.
    pub async fn release(&self, resource: impl Into<ResourceId>) -> Result<Timestamp, MutexError> {
        let resource = resource.into();
        let Some(slot) = self.inner.existing_slot(&resource) else {
            return Err(MutexError::NotHeld { resource });
        };

        let (timestamp, deferred) = {
            let mut state = lock(&slot);
            let deferred = state.release()?;
            (self.inner.tick("release critical section"), deferred)
        };

        self.inner.metrics.inc_releases();
        self.inner.metrics.dec_held();
        metrics::trace_released(&self.inner.id, &resource, timestamp, deferred.len());

        let pushes = self.answer_deferred(deferred);
        self.broadcast_release(&resource, timestamp, &self.inner.peers)
            .await;
        self.push_grants(pushes).await;
        Ok(timestamp)
    }

    /// Sends a Release to `targets`. Informational: one attempt, failures are
    /// only logged.
    async fn broadcast_release(&self, resource: &ResourceId, timestamp: Timestamp, targets: &[ProcessId]) {
        let message = ReleaseMessage {
            timestamp,
            process_id: self.inner.id.clone(),
            resource_id: resource.clone(),
        };

        let sends = targets.iter().map(|peer| {
            let message = message.clone();
            async move { (peer, self.inner.network.send_release(peer, message).await) }
        });

        for (peer, result) in join_all(sends).await {
            match result {
                Ok(ack) => {
                    self.inner.observe(ack.timestamp, &ack.process_id);
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, resource = %resource, error = %e, "Failed to send release");
                }
            }
        }
    }

    /// Grants deferred requests in priority order. Inline grants are handed
    /// over at once; pushed grants are returned for sending.
    fn answer_deferred(&self, deferred: Vec<DeferredReply>) -> Vec<(ProcessId, ReplyMessage)> {
        let mut pushes = Vec::new();
        for DeferredReply { record, responder } in deferred {
            let timestamp = self.inner.tick("grant deferred request");
            let reply = ReplyMessage::grant(timestamp, self.inner.id.clone(), &record);
            self.inner.metrics.inc_grants_sent();

            match responder {
                Responder::Inline(tx) => {
                    if tx.send(reply).is_err() {
                        tracing::debug!(
                            peer = %record.requester,
                            resource = %record.resource,
                            "Requester stopped waiting for grant"
                        );
                    }
                }
                Responder::Remote => pushes.push((record.requester, reply)),
            }
        }
        pushes
    }

    async fn push_grants(&self, pushes: Vec<(ProcessId, ReplyMessage)>) {
        let sends = pushes.iter().map(|(peer, reply)| async move {
            let result = self
                .inner
                .retry
                .run(peer, "reply_entry", || {
                    self.inner.network.send_reply(peer, reply.clone())
                })
                .await;
            (peer, result)
        });

        for (peer, result) in join_all(sends).await {
            match result {
                Ok(ack) => {
                    self.inner.observe(ack.timestamp, &ack.process_id);
                }
                Err(e) => {
                    tracing::error!(peer = %peer, error = %e, "Failed to deliver deferred grant");
                }
            }
        }
    }

    // ========================================================================
    // ABORT
    // ========================================================================

    /// Rolls back an attempt and tells the affected peers.
    async fn abandon(&self, record: &RequestRecord) -> AbandonResult {
        match self.abort_local(record) {
            Some(Withdrawal {
                timestamp,
                unanswered,
                pushes,
            }) => {
                self.broadcast_release(&record.resource, timestamp, &unanswered)
                    .await;
                self.push_grants(pushes).await;
                AbandonResult::Abandoned
            }
            None if self.holds(&record.resource, record.timestamp) => AbandonResult::Held,
            None => AbandonResult::Abandoned,
        }
    }

    /// The synchronous part of an abort: state rollback and inline grants.
    fn abort_local(&self, record: &RequestRecord) -> Option<Withdrawal> {
        let slot = self.inner.existing_slot(&record.resource)?;
        let (deferred, unanswered, timestamp) = {
            let mut state = lock(&slot);
            match state.abort(record.timestamp) {
                AbortOutcome::Aborted {
                    deferred,
                    unanswered,
                } => (deferred, unanswered, self.inner.tick("withdraw request")),
                AbortOutcome::AlreadyHeld | AbortOutcome::NotPending => return None,
            }
        };

        self.inner.metrics.inc_withdrawals();
        metrics::trace_attempt_aborted(&self.inner.id, &record.resource, record.timestamp, unanswered.len());
        let pushes = self.answer_deferred(deferred);
        Some(Withdrawal {
            timestamp,
            unanswered,
            pushes,
        })
    }

    fn holds(&self, resource: &ResourceId, request_timestamp: Timestamp) -> bool {
        self.inner.existing_slot(resource).is_some_and(|slot| {
            let state = lock(&slot);
            state.state() == LockState::Held
                && state.own_request().map(|r| r.timestamp) == Some(request_timestamp)
        })
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    /// Status of one resource. Never creates or mutates state.
    pub fn status(&self, resource: impl Into<ResourceId>) -> ResourceStatus {
        let resource = resource.into();
        match self.inner.existing_slot(&resource) {
            Some(slot) => {
                let state = lock(&slot);
                state.status(self.inner.clock().now())
            }
            None => ResourceStatus::released(resource, self.current_timestamp()),
        }
    }

    /// Process-wide status as served by `GetStatus`.
    pub fn process_status(&self) -> StatusResponse {
        let mut in_critical_section = false;
        let mut pending = Vec::new();

        for slot in self.inner.all_slots() {
            let state = lock(&slot);
            in_critical_section |= state.state() == LockState::Held;
            pending.extend(state.deferred().records().cloned());
        }
        pending.sort();

        StatusResponse {
            process_id: self.inner.id.clone(),
            in_critical_section,
            current_timestamp: self.current_timestamp(),
            pending_requests: pending.into_iter().map(|r| r.requester).collect(),
        }
    }

    /// Asks `peer` for its status.
    pub async fn query_peer_status(
        &self,
        peer: &ProcessId,
        resource: Option<ResourceId>,
    ) -> Result<StatusResponse, MutexError> {
        let request = StatusRequest {
            process_id: self.inner.id.clone(),
            resource_id: resource,
        };
        let response = self.inner.network.get_status(peer, request).await?;
        Ok(response)
    }
}

// ============================================================================
// INBOUND
// ============================================================================

#[async_trait]
impl<N: PeerNetwork + 'static> ExclusionHandler for MutexEngine<N> {
    async fn handle_request(&self, request: RequestMessage) -> Result<ReplyMessage, MutexError> {
        let record = request.into_record().inspect_err(|e| {
            tracing::warn!(process_id = %self.inner.id, error = %e, "Rejected malformed request");
        })?;
        self.inner.check_sender(&record.requester).inspect_err(|e| {
            tracing::warn!(process_id = %self.inner.id, error = %e, "Rejected request");
        })?;
        self.inner.metrics.inc_requests_received();

        let slot = {
            let resources = lock(&self.inner.resources);
            let existing = resources.get(&record.resource).cloned();
            match existing {
                Some(slot) => slot,
                None => {
                    // Never requested here. Holding the map keeps a local
                    // acquisition from starting until the grant is stamped.
                    self.inner.observe(record.timestamp, &record.requester);
                    let timestamp = self.inner.tick("grant request");
                    drop(resources);
                    let reply = ReplyMessage::grant(timestamp, self.inner.id.clone(), &record);
                    return Ok(self.granted(reply, &record));
                }
            }
        };
        let deferral = {
            let mut state = lock(&slot);
            self.inner.observe(record.timestamp, &record.requester);

            match state.decide(&record) {
                RequestDecision::Grant => {
                    let timestamp = self.inner.tick("grant request");
                    Deferral::Granted(ReplyMessage::grant(timestamp, self.inner.id.clone(), &record))
                }
                RequestDecision::Defer => {
                    let (responder, deferral) = match self.inner.config.reply_mode {
                        ReplyMode::Inline => {
                            let (tx, rx) = oneshot::channel();
                            (Responder::Inline(tx), Deferral::Waiting(rx))
                        }
                        ReplyMode::Push => (
                            Responder::Remote,
                            Deferral::Acknowledged(self.inner.tick("acknowledge deferral")),
                        ),
                    };
                    if let Some(old) = state.deferred_mut().defer(record.clone(), responder) {
                        tracing::debug!(superseded = %old, "Replaced older deferred request");
                    }
                    deferral
                }
            }
        };

        match deferral {
            Deferral::Granted(reply) => Ok(self.granted(reply, &record)),
            Deferral::Acknowledged(timestamp) => {
                self.inner.metrics.inc_requests_deferred();
                tracing::debug!(process_id = %self.inner.id, request = %record, "Deferred request");
                Ok(ReplyMessage::deferred(timestamp, self.inner.id.clone(), &record))
            }
            Deferral::Waiting(rx) => {
                self.inner.metrics.inc_requests_deferred();
                tracing::debug!(process_id = %self.inner.id, request = %record, "Deferred request");
                rx.await.map_err(|_| MutexError::RequestWithdrawn {
                    resource: record.resource.clone(),
                })
            }
        }
    }

    async fn handle_reply(&self, reply: ReplyMessage) -> Result<AckMessage, MutexError> {
        reply.validate()?;
        self.inner.check_sender(&reply.process_id)?;

        if reply.granted {
            self.on_grant(&reply);
        } else {
            self.inner.observe(reply.timestamp, &reply.process_id);
        }

        Ok(AckMessage {
            timestamp: self.inner.tick("acknowledge reply"),
            process_id: self.inner.id.clone(),
        })
    }

    async fn handle_release(&self, release: ReleaseMessage) -> Result<AckMessage, MutexError> {
        release.validate()?;
        self.inner.check_sender(&release.process_id)?;

        let withdrawn = match self.inner.existing_slot(&release.resource_id) {
            Some(slot) => {
                let mut state = lock(&slot);
                self.inner.observe(release.timestamp, &release.process_id);
                // A late Release must not cancel a newer request.
                let withdrawn_request = state
                    .deferred()
                    .records()
                    .any(|r| r.requester == release.process_id && r.timestamp < release.timestamp);
                if withdrawn_request {
                    state.deferred_mut().remove_requester(&release.process_id)
                } else {
                    None
                }
            }
            None => {
                self.inner.observe(release.timestamp, &release.process_id);
                None
            }
        };

        match withdrawn {
            Some(entry) => tracing::debug!(
                process_id = %self.inner.id,
                withdrawn = %entry.record,
                "Peer withdrew deferred request"
            ),
            None => tracing::debug!(
                process_id = %self.inner.id,
                peer = %release.process_id,
                resource = %release.resource_id,
                "Peer released resource"
            ),
        }

        Ok(AckMessage {
            timestamp: self.inner.tick("acknowledge release"),
            process_id: self.inner.id.clone(),
        })
    }

    async fn handle_status(&self, request: StatusRequest) -> Result<StatusResponse, MutexError> {
        if request.process_id.is_empty() {
            return Err(MutexError::InvalidMessage("empty process_id".into()));
        }

        match request.resource_id {
            Some(resource) => {
                let status = self.status(resource);
                Ok(StatusResponse {
                    process_id: self.inner.id.clone(),
                    in_critical_section: status.state == LockState::Held,
                    current_timestamp: status.current_timestamp,
                    pending_requests: status.deferred,
                })
            }
            None => Ok(self.process_status()),
        }
    }
}

// ============================================================================
// ATTEMPT GUARD
// ============================================================================

struct Withdrawal {
    timestamp: Timestamp,
    unanswered: Vec<ProcessId>,
    pushes: Vec<(ProcessId, ReplyMessage)>,
}

enum AbandonResult {
    Held,
    Abandoned,
}

/// Abandons the attempt if `acquire_until` is dropped mid-flight.
struct AttemptGuard<N: PeerNetwork + 'static> {
    engine: Option<MutexEngine<N>>,
    record: RequestRecord,
}

impl<N: PeerNetwork + 'static> AttemptGuard<N> {
    fn disarm(&mut self) {
        self.engine = None;
    }
}

impl<N: PeerNetwork + 'static> Drop for AttemptGuard<N> {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let withdrawal = engine.abort_local(&self.record);
        // Quorum may have completed on another task after the caller stopped
        // waiting. Nobody owns that critical section, so leave it.
        let orphaned = withdrawal.is_none() && engine.holds(&self.record.resource, self.record.timestamp);
        if withdrawal.is_none() && !orphaned {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let record = self.record.clone();
                handle.spawn(async move {
                    match withdrawal {
                        Some(withdrawal) => {
                            engine
                                .broadcast_release(&record.resource, withdrawal.timestamp, &withdrawal.unanswered)
                                .await;
                            engine.push_grants(withdrawal.pushes).await;
                        }
                        None => {
                            tracing::info!(
                                process_id = %engine.inner.id,
                                resource = %record.resource,
                                timestamp = record.timestamp,
                                "Releasing critical section entered after its acquire was dropped"
                            );
                            engine.inner.metrics.inc_held();
                            if let Err(e) = engine.release(record.resource.clone()).await {
                                tracing::error!(resource = %record.resource, error = %e, "Orphaned release failed");
                            }
                        }
                    }
                });
            }
            Err(_) => tracing::warn!(
                resource = %self.record.resource,
                orphaned,
                "No runtime to notify peers about the abandoned request"
            ),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
