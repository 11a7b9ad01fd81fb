//! Resource State Machine
//!
//! Per-resource lock state of one process: RELEASED → WANTED → HELD →
//! RELEASED. Pure bookkeeping; the engine wraps each `ResourceState` in its
//! own mutex and performs all I/O after leaving it.

use crate::deferred::{DeferredQueue, DeferredReply};
use crate::engine::MutexError;
use crate::quorum::{ReplyOutcome, ReplyTracker};
use crate::request::{ProcessId, RequestRecord, ResourceId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Lock state of one resource on one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockState {
    #[default]
    Released,
    Wanted,
    Held,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Released => write!(f, "RELEASED"),
            LockState::Wanted => write!(f, "WANTED"),
            LockState::Held => write!(f, "HELD"),
        }
    }
}

/// What to do with an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    Grant,
    Defer,
}

/// Outcome of abandoning an attempt.
#[derive(Debug)]
pub enum AbortOutcome {
    /// The attempt was rolled back to RELEASED.
    Aborted {
        /// Requests deferred while WANTED; they must now be granted.
        deferred: Vec<DeferredReply>,
        /// Peers that had not granted yet; they should receive a withdrawal.
        unanswered: Vec<ProcessId>,
    },
    /// Quorum was reached before the abort got the lock.
    AlreadyHeld,
    /// Nothing to abort: the attempt no longer exists.
    NotPending,
}

/// Read-only view of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource: ResourceId,
    pub state: LockState,
    pub current_timestamp: Timestamp,
    /// Timestamp of this process's own outstanding or winning request.
    pub own_request: Option<Timestamp>,
    /// Deferred requesters in priority order.
    pub deferred: Vec<ProcessId>,
}

/// State of one resource on one process.
#[derive(Debug)]
pub struct ResourceState {
    resource: ResourceId,
    state: LockState,
    own_request: Option<RequestRecord>,
    attempt: Option<ReplyTracker>,
    deferred: DeferredQueue,
}

impl ResourceState {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            state: LockState::Released,
            own_request: None,
            attempt: None,
            deferred: DeferredQueue::new(),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn own_request(&self) -> Option<&RequestRecord> {
        self.own_request.as_ref()
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn deferred_mut(&mut self) -> &mut DeferredQueue {
        &mut self.deferred
    }

    pub fn attempt(&self) -> Option<&ReplyTracker> {
        self.attempt.as_ref()
    }

    /// Grant-now or defer, for a request from another process.
    pub fn decide(&self, incoming: &RequestRecord) -> RequestDecision {
        match (self.state, &self.own_request) {
            (LockState::Held, _) => RequestDecision::Defer,
            (LockState::Wanted, Some(own)) if own.has_priority_over(incoming) => {
                RequestDecision::Defer
            }
            _ => RequestDecision::Grant,
        }
    }

    /// RELEASED → WANTED for `request`, awaiting grants from `peers`.
    ///
    /// The receiver fires when the resource becomes HELD; with no peers that
    /// happens before this returns.
    pub fn begin(
        &mut self,
        request: RequestRecord,
        peers: &[ProcessId],
    ) -> Result<oneshot::Receiver<()>, MutexError> {
        if self.state != LockState::Released {
            return Err(MutexError::AlreadyPending {
                resource: self.resource.clone(),
            });
        }

        let (tracker, granted) = ReplyTracker::new(request.clone(), peers);
        self.own_request = Some(request);
        self.state = LockState::Wanted;
        self.attempt = Some(tracker);

        if self.attempt.as_ref().is_some_and(ReplyTracker::is_complete) {
            self.enter();
        }
        Ok(granted)
    }

    /// Counts a grant; WANTED → HELD once the quorum is complete.
    pub fn on_grant(&mut self, request_timestamp: Timestamp, from: &ProcessId) -> ReplyOutcome {
        let Some(tracker) = self.attempt.as_mut() else {
            return ReplyOutcome::Stale;
        };
        let outcome = tracker.record_grant(request_timestamp, from);
        if outcome == ReplyOutcome::QuorumReached {
            self.enter();
        }
        outcome
    }

    /// Drops an unreachable peer from the current attempt's quorum.
    pub fn exclude(&mut self, request_timestamp: Timestamp, peer: &ProcessId) -> ReplyOutcome {
        let Some(tracker) = self.attempt.as_mut() else {
            return ReplyOutcome::Stale;
        };
        let outcome = tracker.exclude(request_timestamp, peer);
        if outcome == ReplyOutcome::QuorumReached {
            self.enter();
        }
        outcome
    }

    /// HELD → RELEASED. Returns the deferred requests in the order they must
    /// be granted. Fails without touching anything unless HELD.
    pub fn release(&mut self) -> Result<Vec<DeferredReply>, MutexError> {
        if self.state != LockState::Held {
            return Err(MutexError::NotHeld {
                resource: self.resource.clone(),
            });
        }
        self.state = LockState::Released;
        self.own_request = None;
        Ok(self.deferred.drain_ordered())
    }

    /// WANTED → RELEASED for the attempt stamped `request_timestamp`.
    pub fn abort(&mut self, request_timestamp: Timestamp) -> AbortOutcome {
        let is_current = self
            .own_request
            .as_ref()
            .is_some_and(|r| r.timestamp == request_timestamp);
        if !is_current {
            return AbortOutcome::NotPending;
        }

        match self.state {
            LockState::Held => AbortOutcome::AlreadyHeld,
            LockState::Released => AbortOutcome::NotPending,
            LockState::Wanted => {
                let unanswered = self
                    .attempt
                    .take()
                    .map(|t| t.awaiting().cloned().collect())
                    .unwrap_or_default();
                self.state = LockState::Released;
                self.own_request = None;
                AbortOutcome::Aborted {
                    deferred: self.deferred.drain_ordered(),
                    unanswered,
                }
            }
        }
    }

    pub fn status(&self, current_timestamp: Timestamp) -> ResourceStatus {
        ResourceStatus {
            resource: self.resource.clone(),
            state: self.state,
            current_timestamp,
            own_request: self.own_request.as_ref().map(|r| r.timestamp),
            deferred: self.deferred.requesters(),
        }
    }

    fn enter(&mut self) {
        self.state = LockState::Held;
        if let Some(mut tracker) = self.attempt.take() {
            tracker.notify();
        }
    }
}

impl ResourceStatus {
    /// Status of a resource this process has never touched.
    pub fn released(resource: ResourceId, current_timestamp: Timestamp) -> Self {
        Self {
            resource,
            state: LockState::Released,
            current_timestamp,
            own_request: None,
            deferred: Vec::new(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Responder;

    fn record(ts: Timestamp, who: &str) -> RequestRecord {
        RequestRecord::new(ts, ProcessId::from(who), ResourceId::from("R"))
    }

    fn peers(ids: &[&str]) -> Vec<ProcessId> {
        ids.iter().map(|id| ProcessId::from(*id)).collect()
    }

    #[test]
    fn test_released_grants_everything() {
        let state = ResourceState::new("R".into());
        assert_eq!(state.decide(&record(1, "P2")), RequestDecision::Grant);
    }

    #[test]
    fn test_held_defers_everything() {
        let mut state = ResourceState::new("R".into());
        state.begin(record(9, "P1"), &[]).unwrap();
        assert_eq!(state.state(), LockState::Held);
        assert_eq!(state.decide(&record(1, "P2")), RequestDecision::Defer);
    }

    #[test]
    fn test_wanted_ties_resolve_by_identity() {
        // All three stamped 5: P2 yields to P1 and holds off P3.
        let mut state = ResourceState::new("R".into());
        state.begin(record(5, "P2"), &peers(&["P1", "P3"])).unwrap();

        assert_eq!(state.decide(&record(5, "P1")), RequestDecision::Grant);
        assert_eq!(state.decide(&record(5, "P3")), RequestDecision::Defer);
        assert_eq!(state.decide(&record(4, "P3")), RequestDecision::Grant);
        assert_eq!(state.decide(&record(6, "P1")), RequestDecision::Defer);
    }

    #[test]
    fn test_acquire_while_pending_fails() {
        let mut state = ResourceState::new("R".into());
        let _rx = state.begin(record(1, "P1"), &peers(&["P2"])).unwrap();

        let err = state.begin(record(2, "P1"), &peers(&["P2"])).unwrap_err();
        assert_eq!(err, MutexError::AlreadyPending { resource: "R".into() });
        assert_eq!(state.own_request(), Some(&record(1, "P1")));
    }

    #[test]
    fn test_quorum_moves_to_held_and_signals() {
        let mut state = ResourceState::new("R".into());
        let mut granted = state.begin(record(3, "P1"), &peers(&["P2", "P3"])).unwrap();

        assert_eq!(
            state.on_grant(3, &"P2".into()),
            ReplyOutcome::Pending { remaining: 1 }
        );
        assert_eq!(state.state(), LockState::Wanted);
        assert!(granted.try_recv().is_err());

        assert_eq!(state.on_grant(3, &"P3".into()), ReplyOutcome::QuorumReached);
        assert_eq!(state.state(), LockState::Held);
        assert!(granted.try_recv().is_ok());
        // The tracker is gone once the attempt concluded.
        assert!(state.attempt().is_none());
        assert_eq!(state.on_grant(3, &"P3".into()), ReplyOutcome::Stale);
    }

    #[test]
    fn test_release_requires_held() {
        let mut state = ResourceState::new("R".into());
        assert_eq!(
            state.release().unwrap_err(),
            MutexError::NotHeld { resource: "R".into() }
        );

        let _rx = state.begin(record(1, "P1"), &peers(&["P2"])).unwrap();
        assert!(state.release().is_err());
        // No mutation on failure.
        assert_eq!(state.state(), LockState::Wanted);
    }

    #[test]
    fn test_release_returns_deferred_in_order() {
        let mut state = ResourceState::new("R".into());
        state.begin(record(2, "P1"), &[]).unwrap();
        state.deferred_mut().defer(record(8, "P3"), Responder::Remote);
        state.deferred_mut().defer(record(4, "P2"), Responder::Remote);

        let deferred: Vec<_> = state.release().unwrap().into_iter().map(|d| d.record).collect();
        assert_eq!(deferred, vec![record(4, "P2"), record(8, "P3")]);
        assert_eq!(state.state(), LockState::Released);
        assert!(state.deferred().is_empty());
        assert!(state.own_request().is_none());
    }

    #[test]
    fn test_abort_rolls_back_wanted() {
        let mut state = ResourceState::new("R".into());
        let _rx = state.begin(record(5, "P1"), &peers(&["P2", "P3"])).unwrap();
        state.on_grant(5, &"P2".into());
        state.deferred_mut().defer(record(6, "P4"), Responder::Remote);

        match state.abort(5) {
            AbortOutcome::Aborted {
                deferred,
                unanswered,
            } => {
                assert_eq!(deferred.len(), 1);
                assert_eq!(unanswered, peers(&["P3"]));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(state.state(), LockState::Released);
        assert!(state.deferred().is_empty());
    }

    #[test]
    fn test_abort_after_quorum_keeps_held() {
        let mut state = ResourceState::new("R".into());
        let _rx = state.begin(record(5, "P1"), &peers(&["P2"])).unwrap();
        state.on_grant(5, &"P2".into());

        assert!(matches!(state.abort(5), AbortOutcome::AlreadyHeld));
        assert_eq!(state.state(), LockState::Held);
        // Aborting some other attempt is a no-op.
        assert!(matches!(state.abort(4), AbortOutcome::NotPending));
    }

    #[test]
    fn test_status_snapshot() {
        let mut state = ResourceState::new("R".into());
        let _rx = state.begin(record(5, "P1"), &peers(&["P2"])).unwrap();
        state.deferred_mut().defer(record(7, "P3"), Responder::Remote);

        let status = state.status(9);
        assert_eq!(status.state, LockState::Wanted);
        assert_eq!(status.current_timestamp, 9);
        assert_eq!(status.own_request, Some(5));
        assert_eq!(status.deferred, peers(&["P3"]));
    }
}
