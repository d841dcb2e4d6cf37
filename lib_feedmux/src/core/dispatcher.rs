//! # Zero-Copy Subscriber Fan-out
//!
//! Each provider session keeps one `Fanout`: the ordered set of endpoints
//! subscribed to it. A broadcast wraps the response in an `Arc` once and hands
//! every subscriber a pointer to the same allocation.
//!
//! A failed send means the endpoint's receiver is gone. Such endpoints are
//! pruned during the broadcast (`retain`) and reported back to the caller, so
//! one dead endpoint never blocks delivery to the others.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::model::Response;

/// The sending half an endpoint registers with the multiplexer.
pub type EndpointSink = mpsc::UnboundedSender<Arc<Response>>;

/// One endpoint subscribed to a provider.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub endpoint_id: String,
    pub subscribed_at: DateTime<Utc>,
    sink: EndpointSink,
}

/// Ordered, duplicate-free set of subscribers.
#[derive(Debug, Default)]
pub struct Fanout {
    subscribers: Vec<Subscriber>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an endpoint. Returns `false` if it was already subscribed.
    pub fn add(&mut self, endpoint_id: &str, sink: EndpointSink) -> bool {
        if self.contains(endpoint_id) {
            return false;
        }
        self.subscribers.push(Subscriber {
            endpoint_id: endpoint_id.to_string(),
            subscribed_at: Utc::now(),
            sink,
        });
        true
    }

    /// Removes an endpoint. Returns `false` if it was not subscribed.
    pub fn remove(&mut self, endpoint_id: &str) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.endpoint_id != endpoint_id);
        self.subscribers.len() != before
    }

    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.subscribers.iter().any(|s| s.endpoint_id == endpoint_id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn endpoint_ids(&self) -> impl Iterator<Item = &str> {
        self.subscribers.iter().map(|s| s.endpoint_id.as_str())
    }

    /// Sends `response` to every subscriber. Returns the endpoints that were
    /// removed because their receiver is gone.
    pub fn broadcast(&mut self, response: Response) -> Vec<String> {
        let frame = Arc::new(response);
        let mut removed = Vec::new();
        self.subscribers.retain(|subscriber| match subscriber.sink.send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(_) => {
                removed.push(subscriber.endpoint_id.clone());
                false
            }
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseType;

    #[test]
    fn duplicate_subscribe_is_a_no_op() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut fanout = Fanout::new();
        assert!(fanout.add("e1", tx.clone()));
        assert!(!fanout.add("e1", tx));
        assert_eq!(fanout.len(), 1);
    }

    #[test]
    fn broadcast_shares_one_allocation_and_prunes_dead_endpoints() {
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        let mut fanout = Fanout::new();
        fanout.add("e1", tx1);
        fanout.add("e2", tx2);
        fanout.add("e3", tx3);
        drop(rx2);

        let removed = fanout.broadcast(Response::new(ResponseType::Update, "abc"));
        assert_eq!(removed, vec!["e2".to_string()]);
        assert_eq!(fanout.endpoint_ids().collect::<Vec<_>>(), vec!["e1", "e3"]);

        let a = rx1.try_recv().unwrap();
        let b = rx3.try_recv().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_reports_membership() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut fanout = Fanout::new();
        fanout.add("e1", tx);
        assert!(fanout.remove("e1"));
        assert!(!fanout.remove("e1"));
        assert!(fanout.is_empty());
    }
}
