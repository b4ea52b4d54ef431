//! Per-session event fan-out to observers.
//!
//! Each session owns a set of bounded subscriber queues. Publishing
//! snapshots the subscriber list under the registry lock and then pushes
//! into each queue; a full queue drops its oldest entry first, so slow
//! observers see the freshest events. No history is kept: a late
//! subscriber only sees events published after it joined.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use magi_core::events::Envelope;

/// Default per-subscriber queue capacity.
const SUBSCRIBER_QUEUE_SIZE: usize = 256;

#[derive(Debug)]
struct SubscriberQueue {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, envelope: Envelope) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(envelope);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// A live observer attachment. Dropping it without unsubscribing leaves a
/// dormant queue behind until the session closes; handlers unsubscribe
/// explicitly.
#[derive(Debug)]
pub struct Subscription {
    session_id: Uuid,
    id: u64,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Receive the next event; `None` once the session closed and the
    /// queue drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut queue = self.queue.queue.lock();
                if let Some(envelope) = queue.pop_front() {
                    return Some(envelope);
                }
                if self.queue.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Events this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct SessionChannels {
    next_id: u64,
    subscribers: Vec<(u64, Arc<SubscriberQueue>)>,
}

/// Fan-out hub: session id → subscriber queues.
#[derive(Debug)]
pub struct EventBroadcaster {
    sessions: Mutex<HashMap<Uuid, SessionChannels>>,
    capacity: usize,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity: SUBSCRIBER_QUEUE_SIZE,
        }
    }

    /// Open a session's fan-out channel. Idempotent.
    pub fn register(&self, session_id: Uuid) {
        self.sessions.lock().entry(session_id).or_default();
    }

    /// Attach an observer; `None` when the session is unknown or closed.
    pub fn subscribe(&self, session_id: Uuid) -> Option<Subscription> {
        let mut sessions = self.sessions.lock();
        let channels = sessions.get_mut(&session_id)?;
        let id = channels.next_id;
        channels.next_id += 1;
        let queue = Arc::new(SubscriberQueue::new(self.capacity));
        channels.subscribers.push((id, Arc::clone(&queue)));
        Some(Subscription {
            session_id,
            id,
            queue,
        })
    }

    /// Detach an observer.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut sessions = self.sessions.lock();
        if let Some(channels) = sessions.get_mut(&subscription.session_id) {
            channels.subscribers.retain(|(id, _)| *id != subscription.id);
        }
        subscription.queue.close();
    }

    /// Publish one event to every current subscriber of a session.
    pub fn publish(&self, session_id: Uuid, envelope: &Envelope) {
        let snapshot: Vec<Arc<SubscriberQueue>> = {
            let sessions = self.sessions.lock();
            match sessions.get(&session_id) {
                Some(channels) => channels
                    .subscribers
                    .iter()
                    .map(|(_, q)| Arc::clone(q))
                    .collect(),
                None => return,
            }
        };
        for queue in snapshot {
            queue.push(envelope.clone());
        }
    }

    /// Tear down a session's channel; subscribers drain and then end.
    pub fn close_session(&self, session_id: Uuid) {
        let channels = self.sessions.lock().remove(&session_id);
        if let Some(channels) = channels {
            for (_, queue) in channels.subscribers {
                queue.close();
            }
        }
    }

    /// Current subscriber count for a session.
    pub fn subscriber_count(&self, session_id: Uuid) -> usize {
        self.sessions
            .lock()
            .get(&session_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magi_core::events::{Event, LogLevel};

    fn envelope(session: Uuid, line: &str) -> Envelope {
        Envelope::new(session, Event::log_line(LogLevel::Info, line))
    }

    #[tokio::test]
    async fn test_publication_order_per_subscriber() {
        let broadcaster = EventBroadcaster::new();
        let session = Uuid::new_v4();
        broadcaster.register(session);
        let sub = broadcaster.subscribe(session).unwrap();

        for i in 0..4 {
            broadcaster.publish(session, &envelope(session, &format!("e{i}")));
        }
        broadcaster.close_session(session);

        let mut seen = Vec::new();
        while let Some(env) = sub.recv().await {
            if let Event::Log { lines, .. } = env.event {
                seen.push(lines[0].clone());
            }
        }
        assert_eq!(seen, vec!["e0", "e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_later_events() {
        let broadcaster = EventBroadcaster::new();
        let session = Uuid::new_v4();
        broadcaster.register(session);

        broadcaster.publish(session, &envelope(session, "early"));
        let sub = broadcaster.subscribe(session).unwrap();
        broadcaster.publish(session, &envelope(session, "late"));
        broadcaster.close_session(session);

        let first = sub.recv().await.unwrap();
        if let Event::Log { lines, .. } = first.event {
            assert_eq!(lines[0], "late");
        }
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let broadcaster = EventBroadcaster {
            sessions: Mutex::new(HashMap::new()),
            capacity: 2,
        };
        let session = Uuid::new_v4();
        broadcaster.register(session);
        let sub = broadcaster.subscribe(session).unwrap();

        for i in 0..3 {
            broadcaster.publish(session, &envelope(session, &format!("e{i}")));
        }
        broadcaster.close_session(session);

        let mut seen = Vec::new();
        while let Some(env) = sub.recv().await {
            if let Event::Log { lines, .. } = env.event {
                seen.push(lines[0].clone());
            }
        }
        // Recency wins: the oldest event was evicted.
        assert_eq!(seen, vec!["e1", "e2"]);
        assert_eq!(sub.dropped(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches() {
        let broadcaster = EventBroadcaster::new();
        let session = Uuid::new_v4();
        broadcaster.register(session);
        let sub = broadcaster.subscribe(session).unwrap();
        assert_eq!(broadcaster.subscriber_count(session), 1);

        broadcaster.unsubscribe(&sub);
        assert_eq!(broadcaster.subscriber_count(session), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_session_rejects_subscribers() {
        let broadcaster = EventBroadcaster::new();
        assert!(broadcaster.subscribe(Uuid::new_v4()).is_none());
    }
}
