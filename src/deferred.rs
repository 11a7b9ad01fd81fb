//! Deferred Request Queue
//!
//! Requests a process has chosen not to answer yet, kept in priority order
//! together with the way each grant must eventually be delivered.

use crate::network::ReplyMessage;
use crate::request::{ProcessId, RequestRecord};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// How a deferred grant reaches its requester.
#[derive(Debug)]
pub enum Responder {
    /// The requester's `RequestEntry` call is still open and waits on this
    /// channel.
    Inline(oneshot::Sender<ReplyMessage>),
    /// The grant is pushed later with a separate `ReplyEntry` call.
    Remote,
}

/// A request removed from the queue, ready to be answered.
#[derive(Debug)]
pub struct DeferredReply {
    pub record: RequestRecord,
    pub responder: Responder,
}

/// Ordered set of deferred requests for one resource.
///
/// Holds at most one request per requester: a newer request from the same
/// process supersedes the older one.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    entries: BTreeMap<RequestRecord, Responder>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defers `record`. Returns the superseded request of the same requester,
    /// if there was one.
    pub fn defer(&mut self, record: RequestRecord, responder: Responder) -> Option<RequestRecord> {
        let superseded = self.remove_requester(&record.requester).map(|d| d.record);
        self.entries.insert(record, responder);
        superseded
    }

    /// Drops the pending request of `requester`.
    pub fn remove_requester(&mut self, requester: &ProcessId) -> Option<DeferredReply> {
        let key = self
            .entries
            .keys()
            .find(|r| &r.requester == requester)
            .cloned()?;
        self.entries
            .remove_entry(&key)
            .map(|(record, responder)| DeferredReply { record, responder })
    }

    /// Empties the queue, highest priority first.
    pub fn drain_ordered(&mut self) -> Vec<DeferredReply> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(record, responder)| DeferredReply { record, responder })
            .collect()
    }

    /// Requesters in priority order.
    pub fn requesters(&self) -> Vec<ProcessId> {
        self.entries.keys().map(|r| r.requester.clone()).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &RequestRecord> {
        self.entries.keys()
    }

    pub fn contains(&self, requester: &ProcessId) -> bool {
        self.entries.keys().any(|r| &r.requester == requester)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ResourceId;

    fn record(ts: u64, who: &str) -> RequestRecord {
        RequestRecord::new(ts, ProcessId::from(who), ResourceId::from("R"))
    }

    #[test]
    fn test_drains_in_priority_order() {
        let mut queue = DeferredQueue::new();
        queue.defer(record(9, "P1"), Responder::Remote);
        queue.defer(record(4, "P3"), Responder::Remote);
        queue.defer(record(4, "P2"), Responder::Remote);

        assert_eq!(
            queue.requesters(),
            vec![ProcessId::from("P2"), ProcessId::from("P3"), ProcessId::from("P1")]
        );

        let drained: Vec<_> = queue.drain_ordered().into_iter().map(|d| d.record).collect();
        assert_eq!(drained, vec![record(4, "P2"), record(4, "P3"), record(9, "P1")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_newer_request_supersedes_older() {
        let mut queue = DeferredQueue::new();
        assert!(queue.defer(record(3, "P2"), Responder::Remote).is_none());

        let superseded = queue.defer(record(7, "P2"), Responder::Remote);
        assert_eq!(superseded, Some(record(3, "P2")));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.records().next(), Some(&record(7, "P2")));
    }

    #[test]
    fn test_remove_requester() {
        let mut queue = DeferredQueue::new();
        queue.defer(record(3, "P2"), Responder::Remote);
        queue.defer(record(5, "P3"), Responder::Remote);

        let removed = queue.remove_requester(&ProcessId::from("P2")).unwrap();
        assert_eq!(removed.record, record(3, "P2"));
        assert!(!queue.contains(&ProcessId::from("P2")));
        assert!(queue.contains(&ProcessId::from("P3")));
        assert!(queue.remove_requester(&ProcessId::from("P9")).is_none());
    }

    #[tokio::test]
    async fn test_dropping_inline_responder_closes_channel() {
        let mut queue = DeferredQueue::new();
        let (tx, rx) = oneshot::channel();
        queue.defer(record(1, "P2"), Responder::Inline(tx));

        drop(queue.remove_requester(&ProcessId::from("P2")));
        assert!(rx.await.is_err());
    }
}
