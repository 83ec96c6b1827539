//! Bounded outbound publish queue with an in-flight set for
//! acknowledged-delivery messages.
//!
//! Enqueue never blocks: beyond the configured depth the oldest unsent
//! entry is evicted (the caller is interactive code that must not wait).
//! QoS 0 entries are done once handed to the transport; QoS >= 1 entries
//! move to the in-flight set until the transport confirms the hand-off,
//! and are re-sent at most once per reconnect cycle if the connection
//! drops before confirmation.

use bytes::Bytes;
use std::collections::VecDeque;

use crate::transport::QosLevel;

/// A message waiting to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    /// Monotonic sequence number assigned at enqueue time.
    pub seq: u64,
}

#[derive(Debug)]
struct InFlight {
    message: OutboundMessage,
    /// Set once the message has been re-sent in the current reconnect
    /// cycle; cleared when a new cycle begins.
    resent: bool,
}

/// FIFO publish queue owned exclusively by the session worker.
#[derive(Debug)]
pub struct PublishQueue {
    pending: VecDeque<OutboundMessage>,
    in_flight: Vec<InFlight>,
    next_seq: u64,
    max_depth: usize,
}

impl PublishQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            next_seq: 0,
            max_depth,
        }
    }

    /// Append a message. Returns the evicted oldest entry when the queue
    /// was already at capacity.
    pub fn enqueue(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QosLevel,
    ) -> Option<OutboundMessage> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(OutboundMessage {
            topic,
            payload,
            qos,
            seq,
        });

        if self.pending.len() > self.max_depth {
            self.pending.pop_front()
        } else {
            None
        }
    }

    /// Next message to hand off, FIFO.
    pub fn pop_pending(&mut self) -> Option<OutboundMessage> {
        self.pending.pop_front()
    }

    /// Track a QoS >= 1 message between hand-off and confirmation.
    pub fn begin_flight(&mut self, message: OutboundMessage) {
        self.in_flight.push(InFlight {
            message,
            resent: false,
        });
    }

    /// The transport confirmed delivery for `seq`.
    pub fn confirm(&mut self, seq: u64) {
        self.in_flight.retain(|f| f.message.seq != seq);
    }

    /// Messages to re-send after a reconnect: every unconfirmed entry
    /// that has not already been re-sent this cycle. Marks them re-sent.
    pub fn take_resends(&mut self) -> Vec<OutboundMessage> {
        self.in_flight
            .iter_mut()
            .filter(|f| !f.resent)
            .map(|f| {
                f.resent = true;
                f.message.clone()
            })
            .collect()
    }

    /// A new reconnect cycle began (the connection dropped): entries
    /// still unconfirmed become eligible for one more re-send.
    pub fn start_new_cycle(&mut self) {
        for flight in &mut self.in_flight {
            flight.resent = false;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Bytes {
        Bytes::from_static(b"x")
    }

    #[test]
    fn test_enqueue_assigns_monotonic_seq() {
        let mut queue = PublishQueue::new(8);
        queue.enqueue("a".to_string(), payload(), QosLevel::AtMostOnce);
        queue.enqueue("b".to_string(), payload(), QosLevel::AtMostOnce);

        let first = queue.pop_pending().unwrap();
        let second = queue.pop_pending().unwrap();
        assert!(second.seq > first.seq);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut queue = PublishQueue::new(2);
        assert!(queue
            .enqueue("first".to_string(), payload(), QosLevel::AtMostOnce)
            .is_none());
        assert!(queue
            .enqueue("second".to_string(), payload(), QosLevel::AtMostOnce)
            .is_none());

        let dropped = queue
            .enqueue("third".to_string(), payload(), QosLevel::AtMostOnce)
            .expect("oldest entry should be evicted");
        assert_eq!(dropped.topic, "first");
        assert_eq!(queue.pending_len(), 2);
        assert_eq!(queue.pop_pending().unwrap().topic, "second");
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut queue = PublishQueue::new(8);
        for topic in ["a", "b", "c"] {
            queue.enqueue(topic.to_string(), payload(), QosLevel::AtMostOnce);
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_pending())
            .map(|m| m.topic)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_confirm_removes_from_in_flight() {
        let mut queue = PublishQueue::new(8);
        queue.enqueue("a".to_string(), payload(), QosLevel::AtLeastOnce);
        let msg = queue.pop_pending().unwrap();
        let seq = msg.seq;
        queue.begin_flight(msg);
        assert_eq!(queue.in_flight_len(), 1);

        queue.confirm(seq);
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[test]
    fn test_resend_at_most_once_per_cycle() {
        let mut queue = PublishQueue::new(8);
        queue.enqueue("a".to_string(), payload(), QosLevel::AtLeastOnce);
        let msg = queue.pop_pending().unwrap();
        queue.begin_flight(msg);

        // First reconnect cycle: one resend, then nothing more.
        let resends = queue.take_resends();
        assert_eq!(resends.len(), 1);
        assert!(queue.take_resends().is_empty());

        // Connection drops again: eligible once more.
        queue.start_new_cycle();
        assert_eq!(queue.take_resends().len(), 1);
        assert!(queue.take_resends().is_empty());
    }
}
