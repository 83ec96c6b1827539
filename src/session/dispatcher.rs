//! Inbound message routing to per-filter handlers.
//!
//! Handlers are registered per topic filter and receive every inbound
//! message whose concrete topic matches, in arrival order. A message that
//! matches no live handler is dropped without error; that covers the race
//! where an unsubscribe overtakes an in-flight delivery.

use tokio::sync::mpsc;
use tracing::debug;

use super::events::InboundMessage;

/// Check if an MQTT topic matches a subscription filter.
///
/// Filter wildcards:
/// - `+` matches exactly one level
/// - `#` matches any number of levels and must be the last segment
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic == filter {
        return true;
    }
    if filter == "#" {
        return true;
    }

    let topic_parts: Vec<&str> = topic.split('/').collect();
    let filter_parts: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    for (fi, fp) in filter_parts.iter().enumerate() {
        if *fp == "#" {
            // Multi-level wildcard matches everything remaining, but only
            // as the final segment.
            return fi == filter_parts.len() - 1;
        }
        if ti >= topic_parts.len() {
            return false;
        }
        if *fp == "+" || *fp == topic_parts[ti] {
            ti += 1;
        } else {
            return false;
        }
    }

    ti == topic_parts.len()
}

/// Validate a topic filter: `#` only as the trailing segment, wildcards
/// only as whole segments, no empty filter.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let parts: Vec<&str> = filter.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        if *part == "#" && i != parts.len() - 1 {
            return false;
        }
        if part.len() > 1 && (part.contains('#') || part.contains('+')) {
            return false;
        }
    }
    true
}

struct HandlerEntry {
    filter: String,
    tx: mpsc::Sender<InboundMessage>,
}

/// Routes inbound messages to registered per-filter handlers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Vec<HandlerEntry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler channel for `filter`.
    pub fn register(&mut self, filter: &str, tx: mpsc::Sender<InboundMessage>) {
        self.handlers.push(HandlerEntry {
            filter: filter.to_string(),
            tx,
        });
    }

    /// Drop every handler registered for `filter`.
    pub fn unregister(&mut self, filter: &str) {
        self.handlers.retain(|h| h.filter != filter);
    }

    /// Deliver `message` to every matching live handler. Handlers whose
    /// receiver has gone away are pruned. Returns the number of handlers
    /// that got the message.
    pub fn dispatch(&mut self, message: &InboundMessage) -> usize {
        let mut delivered = 0;
        self.handlers.retain(|handler| {
            if !topic_matches_filter(&message.topic, &handler.filter) {
                return true;
            }
            match handler.tx.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop this message for that handler
                    // rather than stalling the session worker.
                    debug!(
                        filter = %handler.filter,
                        topic = %message.topic,
                        "handler channel full, message dropped"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if delivered == 0 {
            debug!(topic = %message.topic, "no matching handler, message dropped");
        }
        delivered
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QosLevel;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn message(topic: &str) -> InboundMessage {
        InboundMessage::new(topic.to_string(), Bytes::from_static(b"x"), QosLevel::AtMostOnce)
    }

    #[test]
    fn test_exact_match() {
        assert!(topic_matches_filter("home/temp", "home/temp"));
        assert!(!topic_matches_filter("home/temp", "home/hum"));
        assert!(!topic_matches_filter("home", "home/temp"));
        assert!(!topic_matches_filter("home/temp", "home"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches_filter("home/temp", "home/+"));
        assert!(topic_matches_filter("home/hum", "home/+"));
        assert!(!topic_matches_filter("home", "home/+"));
        assert!(!topic_matches_filter("home/temp/raw", "home/+"));
        assert!(topic_matches_filter("a/b/c", "+/+/+"));
        assert!(topic_matches_filter("a/b/c", "+/b/+"));
        assert!(!topic_matches_filter("a/x/c", "+/b/+"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches_filter("home", "#"));
        assert!(topic_matches_filter("home/temp/raw", "#"));
        assert!(topic_matches_filter("home/temp", "home/#"));
        assert!(topic_matches_filter("home/temp/raw", "home/#"));
        assert!(!topic_matches_filter("office/temp", "home/#"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(is_valid_filter("home/+"));
        assert!(is_valid_filter("home/#"));
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("+/+/temp"));
        assert!(is_valid_filter("home/temp"));

        assert!(!is_valid_filter(""));
        assert!(!is_valid_filter("home/#/more"));
        assert!(!is_valid_filter("home/te+mp"));
        assert!(!is_valid_filter("home/temp#"));
    }

    #[test]
    fn test_dispatch_to_matching_handler_only() {
        let mut dispatcher = Dispatcher::new();
        let (home_tx, mut home_rx) = mpsc::channel(4);
        let (office_tx, mut office_rx) = mpsc::channel(4);
        dispatcher.register("home/+", home_tx);
        dispatcher.register("office/+", office_tx);

        let delivered = dispatcher.dispatch(&message("home/temp"));
        assert_eq!(delivered, 1);
        assert_eq!(home_rx.try_recv().unwrap().topic, "home/temp");
        assert!(office_rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_no_match_drops_silently() {
        let mut dispatcher = Dispatcher::new();
        let (tx, _rx) = mpsc::channel(4);
        dispatcher.register("home/+", tx);

        assert_eq!(dispatcher.dispatch(&message("garage/door")), 0);
    }

    #[test]
    fn test_dispatch_prunes_closed_handlers() {
        let mut dispatcher = Dispatcher::new();
        let (tx, rx) = mpsc::channel(4);
        dispatcher.register("home/+", tx);
        drop(rx);

        assert_eq!(dispatcher.dispatch(&message("home/temp")), 0);
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[test]
    fn test_dispatch_preserves_per_topic_order() {
        let mut dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher.register("home/+", tx);

        for payload in ["1", "2", "3"] {
            let msg = InboundMessage::new(
                "home/temp".to_string(),
                Bytes::copy_from_slice(payload.as_bytes()),
                QosLevel::AtMostOnce,
            );
            dispatcher.dispatch(&msg);
        }

        let received: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.payload_text())
            .collect();
        assert_eq!(received, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_unregister_removes_all_entries_for_filter() {
        let mut dispatcher = Dispatcher::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, _rx_b) = mpsc::channel(4);
        dispatcher.register("home/+", tx_a);
        dispatcher.register("home/+", tx_b);

        dispatcher.unregister("home/+");
        assert_eq!(dispatcher.handler_count(), 0);
    }

    proptest! {
        #[test]
        fn concrete_topic_always_matches_itself(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}") {
            prop_assert!(topic_matches_filter(&topic, &topic));
        }

        #[test]
        fn hash_matches_every_topic(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}") {
            prop_assert!(topic_matches_filter(&topic, "#"));
        }

        #[test]
        fn prefix_hash_matches_extensions(
            prefix in "[a-z0-9]{1,8}",
            rest in "(/[a-z0-9]{1,8}){0,4}",
        ) {
            let topic = format!("{prefix}{rest}");
            let filter = format!("{prefix}/#");
            prop_assert!(topic_matches_filter(&topic, &filter));
        }

        #[test]
        fn plus_never_crosses_levels(
            a in "[a-z0-9]{1,8}",
            b in "[a-z0-9]{1,8}",
            c in "[a-z0-9]{1,8}",
        ) {
            // A single-level wildcard must not match two levels.
            let topic = format!("{a}/{b}/{c}");
            let filter = format!("{a}/+");
            prop_assert!(!topic_matches_filter(&topic, &filter));
        }
    }
}
