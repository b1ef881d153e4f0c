//! Fan-out of `LogEvent`s to many concurrent subscribers.
//!
//! Built directly on `tokio::sync::broadcast`: its bounded ring buffer gives
//! every subscriber a fixed-size backlog for free, and a subscriber that
//! falls behind observes `RecvError::Lagged` on its next `recv()` rather than
//! blocking the publisher. That is exactly the "drop the oldest undelivered
//! event" back-pressure policy the proxy needs, without a hand-rolled
//! per-subscriber queue.

use crate::event::LogEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Recommended per-subscriber backlog before the oldest event is dropped.
pub const CHANNEL_CAPACITY: usize = 64;

/// Shared publish point for `LogEvent`s.
///
/// Cloning is cheap (it is a thin wrapper around a `broadcast::Sender`); hand
/// clones to the `Interceptor` and `RewriteProxy`, never a back-reference.
#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<Arc<LogEvent>>,
    console: Arc<std::sync::atomic::AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new(console: bool) -> Self {
        let (sender, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            console: Arc::new(std::sync::atomic::AtomicBool::new(console)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_console_output(&self, enabled: bool) {
        self.console.store(enabled, Ordering::Relaxed);
    }

    /// Fire-and-forget publish. Never blocks: `broadcast::Sender::send` is
    /// synchronous and only fails when there are zero subscribers, which is
    /// not an error for a producer that doesn't care whether anyone is
    /// listening.
    pub fn publish(&self, event: LogEvent) {
        if self.console.load(Ordering::Relaxed) {
            println!("{}", event.to_console_line());
        }
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe a new sink (e.g. a websocket client task).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LogEvent>> {
        self.sender.subscribe()
    }

    /// Count of subscriber-side drops observed so far (surfaced via
    /// `/api/status`). Call [`Broadcaster::note_lag`] from each subscriber
    /// task when its `recv()` returns `Lagged(n)`.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn note_lag(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let b = Broadcaster::new(false);
        let mut rx = b.subscribe();
        b.publish(LogEvent::request("GET", "http://x/", false, vec![]));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, EventKind::Request);
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_dropped_events_and_others_keep_going() {
        let b = Broadcaster::new(false);
        let mut slow = b.subscribe();

        for i in 0..(CHANNEL_CAPACITY + 10) {
            b.publish(LogEvent::response("GET", format!("http://x/{i}"), 200));
        }

        // The slow subscriber never read, so it must observe a lag rather
        // than stalling the producer (which already finished its loop above).
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                b.note_lag(n);
                assert!(n > 0);
            }
            other => panic!("expected Lagged, got {other:?}"),
        }
        assert!(b.dropped_count() > 0);

        // A freshly attached subscriber keeps receiving events normally.
        let mut fresh = b.subscribe();
        b.publish(LogEvent::response("GET", "http://x/final", 200));
        let got = fresh.recv().await.unwrap();
        assert_eq!(got.url, "http://x/final");
    }
}
