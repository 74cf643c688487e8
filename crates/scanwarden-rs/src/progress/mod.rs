use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::ScanEvent;

/// Fan-out of scan events to the subscribers attached to each scan id.
///
/// Every subscriber owns an unbounded queue, so a slow or dropped reader never
/// blocks `publish` or the other subscribers. There is no replay: a subscriber
/// sees only events published after it attached.
#[derive(Debug, Clone, Default)]
pub struct ProgressBroadcaster {
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ScanEvent>>>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, scan_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .entry(scan_id.to_string())
            .or_default()
            .push(tx);
        Subscription { rx }
    }

    /// Fire-and-forget. Subscribers whose receiver is gone are pruned.
    pub fn publish(&self, event: ScanEvent) {
        let mut channels = self.channels.lock();
        let Some(subscribers) = channels.get_mut(event.scan_id()) else {
            return;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            debug!(scan_id = event.scan_id(), "last subscriber detached");
            channels.remove(event.scan_id());
        }
    }

    /// Drops the scan's channel; attached streams end after draining.
    pub fn close(&self, scan_id: &str) {
        self.channels.lock().remove(scan_id);
    }

    pub fn subscriber_count(&self, scan_id: &str) -> usize {
        self.channels.lock().get(scan_id).map_or(0, Vec::len)
    }
}

/// Receiving end for one scan. Usable with `recv` or as a [`Stream`].
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ScanEvent>,
}

impl Subscription {
    /// `None` once the scan's channel was closed and drained.
    pub async fn recv(&mut self) -> Option<ScanEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ScanEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = ScanEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn error_event(scan_id: &str, error: &str) -> ScanEvent {
        ScanEvent::ScanError {
            scan_id: scan_id.to_string(),
            error: error.to_string(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let broadcaster = ProgressBroadcaster::new();
        let mut sub = broadcaster.subscribe("scan-1");
        for i in 0..5 {
            broadcaster.publish(error_event("scan-1", &i.to_string()));
        }
        broadcaster.close("scan-1");

        let received: Vec<ScanEvent> = sub.by_ref().collect().await;
        let errors: Vec<String> = received
            .into_iter()
            .map(|e| match e {
                ScanEvent::ScanError { error, .. } => error,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(errors, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let broadcaster = ProgressBroadcaster::new();
        let mut early = broadcaster.subscribe("scan-1");
        broadcaster.publish(error_event("scan-1", "first"));
        let mut late = broadcaster.subscribe("scan-1");
        broadcaster.publish(error_event("scan-1", "second"));

        assert!(matches!(early.recv().await, Some(ScanEvent::ScanError { error, .. }) if error == "first"));
        assert!(matches!(late.recv().await, Some(ScanEvent::ScanError { error, .. }) if error == "second"));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let broadcaster = ProgressBroadcaster::new();
        let dropped = broadcaster.subscribe("scan-1");
        let mut kept = broadcaster.subscribe("scan-1");
        drop(dropped);

        broadcaster.publish(error_event("scan-1", "boom"));
        assert_eq!(broadcaster.subscriber_count("scan-1"), 1);
        assert!(kept.recv().await.is_some());
    }

    #[test]
    fn scans_are_isolated() {
        let broadcaster = ProgressBroadcaster::new();
        let mut a = broadcaster.subscribe("a");
        broadcaster.publish(error_event("b", "not for a"));
        broadcaster.publish(error_event("nobody-listens", "dropped"));
        assert!(a.try_recv().is_none());
    }
}
