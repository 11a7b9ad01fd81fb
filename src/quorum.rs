//! Quorum Tracking
//!
//! Bookkeeping for a single acquisition attempt (which peers have granted,
//! which are still awaited) plus the retry and membership policies the engine
//! applies while soliciting grants.

use crate::network::NetworkError;
use crate::request::{ProcessId, RequestRecord, Timestamp};
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

/// What to do with a peer that stays unreachable after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipPolicy {
    /// Give up on the attempt. Keeps mutual exclusion intact.
    #[default]
    Strict,
    /// Drop the peer from this attempt's quorum and carry on.
    ///
    /// If the excluded peer is alive and later grants someone else, two
    /// processes may both believe they hold the resource.
    ExcludeUnreachable,
}

/// Result of feeding a reply (or an exclusion) into a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Still waiting for `remaining` peers.
    Pending { remaining: usize },
    /// Every live peer has granted.
    QuorumReached,
    /// The reply answers a different (older) request.
    Stale,
    /// The peer had already granted this request.
    Duplicate,
    /// The sender is not part of this attempt's quorum.
    Unexpected,
}

/// Reply bookkeeping for one outstanding request.
#[derive(Debug)]
pub struct ReplyTracker {
    request: RequestRecord,
    awaiting: BTreeSet<ProcessId>,
    granted: BTreeSet<ProcessId>,
    excluded: BTreeSet<ProcessId>,
    on_quorum: Option<oneshot::Sender<()>>,
}

impl ReplyTracker {
    /// Starts tracking `request` against `peers`. The receiver fires once the
    /// quorum is complete.
    pub fn new(request: RequestRecord, peers: &[ProcessId]) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let tracker = Self {
            request,
            awaiting: peers.iter().cloned().collect(),
            granted: BTreeSet::new(),
            excluded: BTreeSet::new(),
            on_quorum: Some(tx),
        };
        (tracker, rx)
    }

    /// Peers that have neither granted nor been excluded.
    pub fn awaiting(&self) -> impl Iterator<Item = &ProcessId> {
        self.awaiting.iter()
    }

    pub fn granted_count(&self) -> usize {
        self.granted.len()
    }

    pub fn excluded(&self) -> impl Iterator<Item = &ProcessId> {
        self.excluded.iter()
    }

    pub fn is_complete(&self) -> bool {
        self.awaiting.is_empty()
    }

    /// Counts a grant from `from` answering the request stamped
    /// `request_timestamp`.
    pub fn record_grant(&mut self, request_timestamp: Timestamp, from: &ProcessId) -> ReplyOutcome {
        if request_timestamp != self.request.timestamp {
            return ReplyOutcome::Stale;
        }
        if self.granted.contains(from) {
            return ReplyOutcome::Duplicate;
        }
        if !self.awaiting.remove(from) {
            return ReplyOutcome::Unexpected;
        }
        self.granted.insert(from.clone());
        self.progress()
    }

    /// Removes `peer` from the quorum of this attempt.
    pub fn exclude(&mut self, request_timestamp: Timestamp, peer: &ProcessId) -> ReplyOutcome {
        if request_timestamp != self.request.timestamp {
            return ReplyOutcome::Stale;
        }
        if !self.awaiting.remove(peer) {
            return ReplyOutcome::Unexpected;
        }
        self.excluded.insert(peer.clone());
        self.progress()
    }

    /// Wakes the acquirer. Only the first call has an effect.
    pub fn notify(&mut self) {
        if let Some(tx) = self.on_quorum.take() {
            // The acquirer may already have given up.
            let _ = tx.send(());
        }
    }

    fn progress(&self) -> ReplyOutcome {
        if self.awaiting.is_empty() {
            ReplyOutcome::QuorumReached
        } else {
            ReplyOutcome::Pending {
                remaining: self.awaiting.len(),
            }
        }
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Exponential backoff for calls to a single peer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry as i32);
        let nanos = self.initial_backoff.as_nanos() as f64 * factor;
        if nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Backoff with up to 50% jitter subtracted, so retries from different
    /// processes do not line up.
    pub fn jittered_backoff(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        let half = base.as_millis() as u64 / 2;
        if half == 0 {
            return base;
        }
        base - Duration::from_millis(rand::rng().random_range(0..=half))
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent.
    pub async fn run<F, Fut, R>(
        &self,
        peer: &ProcessId,
        call: &'static str,
        mut operation: F,
    ) -> Result<R, NetworkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, NetworkError>>,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    let backoff = self.jittered_backoff(retry);
                    tracing::warn!(
                        peer = %peer,
                        call = call,
                        attempt = retry + 1,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(backoff).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ResourceId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn peers(ids: &[&str]) -> Vec<ProcessId> {
        ids.iter().map(|id| ProcessId::from(*id)).collect()
    }

    fn request(ts: Timestamp) -> RequestRecord {
        RequestRecord::new(ts, "P1".into(), ResourceId::from("R"))
    }

    #[test]
    fn test_quorum_requires_every_peer() {
        let (mut tracker, mut rx) = ReplyTracker::new(request(3), &peers(&["P2", "P3"]));

        assert_eq!(
            tracker.record_grant(3, &"P2".into()),
            ReplyOutcome::Pending { remaining: 1 }
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(tracker.record_grant(3, &"P3".into()), ReplyOutcome::QuorumReached);
        tracker.notify();
        assert!(rx.try_recv().is_ok());
        assert_eq!(tracker.granted_count(), 2);
    }

    #[test]
    fn test_stale_duplicate_and_unexpected_grants() {
        let (mut tracker, _rx) = ReplyTracker::new(request(3), &peers(&["P2", "P3"]));

        assert_eq!(tracker.record_grant(2, &"P2".into()), ReplyOutcome::Stale);
        assert_eq!(
            tracker.record_grant(3, &"P2".into()),
            ReplyOutcome::Pending { remaining: 1 }
        );
        assert_eq!(tracker.record_grant(3, &"P2".into()), ReplyOutcome::Duplicate);
        assert_eq!(tracker.record_grant(3, &"P9".into()), ReplyOutcome::Unexpected);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn test_exclusion_completes_quorum() {
        let (mut tracker, _rx) = ReplyTracker::new(request(1), &peers(&["P2", "P3"]));
        tracker.record_grant(1, &"P2".into());

        assert_eq!(tracker.exclude(1, &"P3".into()), ReplyOutcome::QuorumReached);
        assert_eq!(tracker.excluded().cloned().collect::<Vec<_>>(), peers(&["P3"]));
        // A late grant from the excluded peer is not counted.
        assert_eq!(tracker.record_grant(1, &"P3".into()), ReplyOutcome::Unexpected);
    }

    #[test]
    fn test_empty_peer_set_is_complete() {
        let (tracker, _rx) = ReplyTracker::new(request(1), &[]);
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(300));
        assert_eq!(policy.backoff(7), Duration::from_millis(300));

        for retry in 0..4 {
            let jittered = policy.jittered_backoff(retry);
            assert!(jittered <= policy.backoff(retry));
            assert!(jittered >= policy.backoff(retry) / 2);
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run(&"P2".into(), "test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(NetworkError::Timeout)
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .run(&"P2".into(), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(NetworkError::Unreachable("P2".into()))
            })
            .await;

        assert_eq!(result, Err(NetworkError::Unreachable("P2".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run(&"P2".into(), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(NetworkError::Rejected("unknown peer".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
