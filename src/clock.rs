//! Lamport Logical Clock
//!
//! One clock per process. `tick` before every locally originated send,
//! `observe` on every receive before acting on the message.

use crate::request::{ProcessId, Timestamp};
use std::collections::VecDeque;

/// What caused the clock to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockEvent {
    /// A local event, usually a message about to be sent.
    Local(&'static str),
    /// A message received from a peer carrying `remote` as its timestamp.
    Received { from: ProcessId, remote: Timestamp },
}

/// Lamport clock with an optional bounded event history.
#[derive(Debug, Clone)]
pub struct LamportClock {
    time: Timestamp,
    history: VecDeque<(Timestamp, ClockEvent)>,
    history_capacity: usize,
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl LamportClock {
    /// Creates a clock starting at `initial` with history disabled.
    pub fn new(initial: Timestamp) -> Self {
        Self::with_history(initial, 0)
    }

    /// Creates a clock that remembers its last `capacity` movements.
    pub fn with_history(initial: Timestamp, capacity: usize) -> Self {
        Self {
            time: initial,
            history: VecDeque::with_capacity(capacity.min(1024)),
            history_capacity: capacity,
        }
    }

    /// Current time, without advancing.
    pub fn now(&self) -> Timestamp {
        self.time
    }

    /// Advances the clock for a local event and returns the new time.
    pub fn tick(&mut self, event: &'static str) -> Timestamp {
        self.time = self.time.saturating_add(1);
        self.record(ClockEvent::Local(event));
        self.time
    }

    /// Merges a received timestamp: `max(local, remote) + 1`.
    pub fn observe(&mut self, remote: Timestamp, from: &ProcessId) -> Timestamp {
        self.time = self.time.max(remote).saturating_add(1);
        self.record(ClockEvent::Received {
            from: from.clone(),
            remote,
        });
        self.time
    }

    /// Recorded movements, oldest first.
    pub fn history(&self) -> Vec<(Timestamp, ClockEvent)> {
        self.history.iter().cloned().collect()
    }

    fn record(&mut self, event: ClockEvent) {
        if self.history_capacity == 0 {
            return;
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back((self.time, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tick_increments() {
        let mut clock = LamportClock::default();
        let times: Vec<_> = (0..3).map(|_| clock.tick("local")).collect();
        assert_eq!(times, vec![1, 2, 3]);
    }

    #[test]
    fn test_observe_follows_lamport_rule() {
        let mut clock = LamportClock::new(0);
        let peer = ProcessId::from("B");

        for _ in 0..3 {
            clock.tick("local");
        }
        // Larger remote time jumps ahead.
        assert_eq!(clock.observe(10, &peer), 11);
        // Smaller remote time still advances by one.
        assert_eq!(clock.observe(5, &peer), 12);
    }

    #[test]
    fn test_causal_chain_between_processes() {
        let (a, b, c) = (ProcessId::from("A"), ProcessId::from("B"), ProcessId::from("C"));
        let mut pa = LamportClock::new(0);
        let mut pb = LamportClock::new(0);
        let mut pc = LamportClock::new(0);

        pa.tick("start");
        pb.tick("start");
        pb.tick("local");
        pc.tick("start");

        let ts = pa.tick("send A->B");
        pb.observe(ts, &a);
        let ts = pb.tick("send B->C");
        pc.observe(ts, &b);
        let ts = pc.tick("send C->A");
        let received = pa.observe(ts, &c);

        // A's receive is causally after every event in the chain.
        assert!(received > ts);
        assert_eq!(received, 7);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut clock = LamportClock::with_history(0, 2);
        clock.tick("one");
        clock.tick("two");
        clock.observe(9, &ProcessId::from("P"));

        let history = clock.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], (2, ClockEvent::Local("two")));
        assert_eq!(
            history[1],
            (
                10,
                ClockEvent::Received {
                    from: ProcessId::from("P"),
                    remote: 9
                }
            )
        );
    }

    #[test]
    fn test_history_disabled_by_default() {
        let mut clock = LamportClock::new(4);
        clock.tick("x");
        assert!(clock.history().is_empty());
        assert_eq!(clock.now(), 5);
    }

    proptest! {
        #[test]
        fn prop_clock_never_decreases(
            ops in proptest::collection::vec(proptest::option::of(0u64..1_000), 1..64)
        ) {
            let peer = ProcessId::from("peer");
            let mut clock = LamportClock::new(0);
            let mut last = clock.now();

            for op in ops {
                let next = match op {
                    Some(remote) => {
                        let t = clock.observe(remote, &peer);
                        prop_assert!(t > remote);
                        t
                    }
                    None => clock.tick("local"),
                };
                prop_assert!(next > last);
                last = next;
            }
        }
    }
}
