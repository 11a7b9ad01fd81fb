//! Request Records and the Lamport Ordering Key
//!
//! Every acquisition attempt is identified by a `RequestRecord`. Records are
//! totally ordered by `(timestamp, requester)`, which every process computes
//! identically from the record alone.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Lamport logical time.
pub type Timestamp = u64;

/// Opaque identity of a peer process. Compared lexicographically, and only to
/// break timestamp ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Name of a shared resource guarded by the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single request to enter a resource's critical section.
///
/// Immutable once created. The derived equality covers all three fields; the
/// ordering compares `(timestamp, requester)` first and only falls back to the
/// resource so that `Ord` stays consistent with `Eq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: Timestamp,
    pub requester: ProcessId,
    pub resource: ResourceId,
}

impl RequestRecord {
    pub fn new(timestamp: Timestamp, requester: ProcessId, resource: ResourceId) -> Self {
        Self {
            timestamp,
            requester,
            resource,
        }
    }

    /// The fairness key: ascending timestamp, then ascending requester.
    pub fn priority_key(&self) -> (Timestamp, &ProcessId) {
        (self.timestamp, &self.requester)
    }

    /// Returns true if `self` must be served before `other`.
    pub fn has_priority_over(&self, other: &RequestRecord) -> bool {
        self.priority_key() < other.priority_key()
    }
}

impl Ord for RequestRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority_key()
            .cmp(&other.priority_key())
            .then_with(|| self.resource.cmp(&other.resource))
    }
}

impl PartialOrd for RequestRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.requester, self.timestamp, self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(ts: Timestamp, who: &str) -> RequestRecord {
        RequestRecord::new(ts, ProcessId::from(who), ResourceId::from("R"))
    }

    #[test]
    fn test_lower_timestamp_wins() {
        assert!(record(3, "P9").has_priority_over(&record(4, "P1")));
        assert!(!record(4, "P1").has_priority_over(&record(3, "P9")));
    }

    #[test]
    fn test_tie_broken_by_identity() {
        let p1 = record(5, "P1");
        let p2 = record(5, "P2");
        let p3 = record(5, "P3");

        assert!(p1.has_priority_over(&p2));
        assert!(p2.has_priority_over(&p3));
        assert!(p1.has_priority_over(&p3));
        assert!(!p3.has_priority_over(&p1));
    }

    #[test]
    fn test_identity_is_lexicographic() {
        // "P10" sorts before "P2" as a string, not as a number.
        assert!(record(1, "P10").has_priority_over(&record(1, "P2")));
    }

    #[test]
    fn test_sorting_follows_priority() {
        let mut records = vec![record(7, "B"), record(2, "C"), record(7, "A"), record(2, "A")];
        records.sort();

        let order: Vec<_> = records
            .iter()
            .map(|r| (r.timestamp, r.requester.as_str().to_string()))
            .collect();
        assert_eq!(
            order,
            vec![
                (2, "A".to_string()),
                (2, "C".to_string()),
                (7, "A".to_string()),
                (7, "B".to_string()),
            ]
        );
    }

    #[test]
    fn test_serde_transparent_ids() {
        let json = serde_json::to_string(&record(1, "P1")).unwrap();
        assert_eq!(json, r#"{"timestamp":1,"requester":"P1","resource":"R"}"#);
    }

    proptest! {
        #[test]
        fn prop_priority_is_strict_total_order(
            t1 in 0u64..8, t2 in 0u64..8,
            a in "[A-C][0-9]", b in "[A-C][0-9]",
        ) {
            let r1 = record(t1, &a);
            let r2 = record(t2, &b);

            if r1.priority_key() == r2.priority_key() {
                prop_assert!(!r1.has_priority_over(&r2));
                prop_assert!(!r2.has_priority_over(&r1));
            } else {
                // Exactly one side wins.
                prop_assert!(r1.has_priority_over(&r2) ^ r2.has_priority_over(&r1));
            }
        }
    }
}
