//! Bounded streaming event queue with priority classes.
//!
//! Producers emit enveloped events; one consumer drains them in FIFO
//! order. Under pressure the `drop` policy evicts the oldest non-critical
//! entry; `backpressure` makes the producer wait. Critical events are
//! never dropped: they evict a non-critical entry to make room, and when
//! the queue holds only critical entries they wait for space regardless of
//! policy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{OverflowPolicy, StreamingConfig};
use crate::error::{MagiError, MagiResult};
use crate::events::{Envelope, EventPriority};

struct Queued {
    envelope: Envelope,
    priority: EventPriority,
}

struct EmitterInner {
    queue: Mutex<VecDeque<Queued>>,
    capacity: usize,
    policy: OverflowPolicy,
    emit_timeout: Duration,
    recv_notify: Notify,
    space_notify: Notify,
    closed: AtomicBool,
    emitted: AtomicU64,
    dropped: AtomicU64,
    last_drop_reason: Mutex<Option<String>>,
    created: Instant,
    ttfb: Mutex<Option<Duration>>,
}

/// Point-in-time emitter metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitterSnapshot {
    pub emitted_count: u64,
    pub dropped_count: u64,
    pub last_drop_reason: Option<String>,
    /// Time from emitter creation to the first emitted event.
    pub ttfb: Option<Duration>,
}

/// Bounded async event queue. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct StreamingEmitter {
    inner: Arc<EmitterInner>,
}

impl std::fmt::Debug for StreamingEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingEmitter")
            .field("capacity", &self.inner.capacity)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl StreamingEmitter {
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                queue: Mutex::new(VecDeque::with_capacity(config.queue_size)),
                capacity: config.queue_size.max(1),
                policy: config.overflow_policy,
                emit_timeout: Duration::from_secs(config.emit_timeout_secs),
                recv_notify: Notify::new(),
                space_notify: Notify::new(),
                closed: AtomicBool::new(false),
                emitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                last_drop_reason: Mutex::new(None),
                created: Instant::now(),
                ttfb: Mutex::new(None),
            }),
        }
    }

    /// Emit one event at the given priority.
    pub async fn emit(&self, envelope: Envelope, priority: EventPriority) -> MagiResult<()> {
        let deadline = Instant::now() + self.inner.emit_timeout;

        loop {
            enum Verdict {
                Enqueued,
                Wait,
            }

            let verdict = {
                let mut queue = self.inner.queue.lock();
                if queue.len() < self.inner.capacity {
                    self.push(&mut queue, envelope.clone(), priority);
                    Verdict::Enqueued
                } else {
                    let evictable = queue
                        .iter()
                        .position(|q| q.priority == EventPriority::Normal);
                    let evict_allowed = priority == EventPriority::Critical
                        || self.inner.policy == OverflowPolicy::Drop;
                    match evictable {
                        Some(index) if evict_allowed => {
                            if let Some(victim) = queue.remove(index) {
                                self.record_drop(victim, "queue full");
                            }
                            self.push(&mut queue, envelope.clone(), priority);
                            Verdict::Enqueued
                        }
                        // Either backpressure policy, or nothing evictable:
                        // a queue of critical events applies backpressure to
                        // everyone.
                        _ => Verdict::Wait,
                    }
                }
            };

            match verdict {
                Verdict::Enqueued => return Ok(()),
                Verdict::Wait => match priority {
                    EventPriority::Critical => {
                        self.inner.space_notify.notified().await;
                    }
                    EventPriority::Normal => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Err(MagiError::StreamingTimeout(self.inner.emit_timeout));
                        }
                        if tokio::time::timeout(remaining, self.inner.space_notify.notified())
                            .await
                            .is_err()
                        {
                            return Err(MagiError::StreamingTimeout(self.inner.emit_timeout));
                        }
                    }
                },
            }
        }
    }

    /// Receive the next event. `None` once closed and drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            let notified = self.inner.recv_notify.notified();
            {
                let mut queue = self.inner.queue.lock();
                if let Some(item) = queue.pop_front() {
                    self.inner.space_notify.notify_one();
                    return Some(item.envelope);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the producer side; pending events remain receivable.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.recv_notify.notify_waiters();
        self.inner.recv_notify.notify_one();
    }

    pub fn metrics(&self) -> EmitterSnapshot {
        EmitterSnapshot {
            emitted_count: self.inner.emitted.load(Ordering::Relaxed),
            dropped_count: self.inner.dropped.load(Ordering::Relaxed),
            last_drop_reason: self.inner.last_drop_reason.lock().clone(),
            ttfb: *self.inner.ttfb.lock(),
        }
    }

    fn push(&self, queue: &mut VecDeque<Queued>, envelope: Envelope, priority: EventPriority) {
        queue.push_back(Queued { envelope, priority });
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        let mut ttfb = self.inner.ttfb.lock();
        if ttfb.is_none() {
            *ttfb = Some(self.inner.created.elapsed());
        }
        self.inner.recv_notify.notify_one();
    }

    fn record_drop(&self, victim: Queued, reason: &str) {
        let count = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        *self.inner.last_drop_reason.lock() = Some(reason.to_string());
        tracing::warn!(
            count,
            reason,
            dropped_type = ?victim.envelope.event,
            "streaming.drop"
        );
    }
}
