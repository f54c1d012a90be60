//! Change bus: fans out store mutation events to active watchers (spec §4.4).
//!
//! Built on the same non-blocking-bounded-channel idiom used for rate-limit
//! admission elsewhere in this crate (`try_send`-shaped, never blocking the
//! publisher), using `tokio::sync::mpsc` rather than a hand-rolled queue.
//! The wildcard matcher is shared with the ACL engine via `crate::pattern`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::event::ChangeEvent;
use crate::pattern;

/// A watcher is force-closed after this many consecutive dropped events.
const DEFAULT_LAGGING_CLOSE_THRESHOLD: u64 = 50;

pub type WatcherId = u64;

type CanRead = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct WatcherState {
    pattern: String,
    sender: mpsc::Sender<ChangeEvent>,
    can_read: CanRead,
    dropped_count: AtomicU64,
    consecutive_drops: AtomicU64,
}

pub struct ChangeBus {
    watchers: DashMap<WatcherId, Arc<WatcherState>>,
    next_id: AtomicU64,
    buffer_size: usize,
    lagging_close_threshold: u64,
    denials: AtomicU64,
}

/// Per-watcher liveness/backpressure counters, readable without touching
/// the send path — used by admin/diagnostic surfaces and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatcherStats {
    pub dropped_count: u64,
    pub lagging: bool,
}

impl ChangeBus {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_lagging_threshold(buffer_size, DEFAULT_LAGGING_CLOSE_THRESHOLD)
    }

    pub fn with_lagging_threshold(buffer_size: usize, lagging_close_threshold: u64) -> Self {
        Self {
            watchers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer_size,
            lagging_close_threshold,
            denials: AtomicU64::new(0),
        }
    }

    /// Registers a new watcher on `pattern`, returning its id and the
    /// receiving half of its bounded channel. `can_read` is the watcher's
    /// own token/policy predicate (spec §4.4): it is evaluated once per
    /// candidate event, never shared across watchers, so two watchers on
    /// the same pattern but different credentials see different subsets.
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        can_read: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> (WatcherId, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(
            id,
            Arc::new(WatcherState {
                pattern: pattern.into(),
                sender: tx,
                can_read: Box::new(can_read),
                dropped_count: AtomicU64::new(0),
                consecutive_drops: AtomicU64::new(0),
            }),
        );
        (id, rx)
    }

    /// Convenience for callers with no ACL restriction (ACL disabled, or
    /// internal/test subscribers).
    pub fn subscribe_unrestricted(&self, pattern: impl Into<String>) -> (WatcherId, mpsc::Receiver<ChangeEvent>) {
        self.subscribe(pattern, |_| true)
    }

    pub fn unsubscribe(&self, id: WatcherId) {
        self.watchers.remove(&id);
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn stats(&self, id: WatcherId) -> Option<WatcherStats> {
        self.watchers.get(&id).map(|w| WatcherStats {
            dropped_count: w.dropped_count.load(Ordering::Relaxed),
            lagging: w.consecutive_drops.load(Ordering::Relaxed) > 0,
        })
    }

    /// Fans `event` out to every watcher whose pattern matches its key and
    /// whose own ACL predicate allows reading it.
    pub fn publish(&self, event: ChangeEvent) {
        let mut to_close = Vec::new();
        for entry in self.watchers.iter() {
            let watcher = entry.value();
            if !pattern::matches(&watcher.pattern, event.key()) {
                continue;
            }
            if !(watcher.can_read)(event.key()) {
                self.denials.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match watcher.sender.try_send(event.clone()) {
                Ok(()) => {
                    watcher.consecutive_drops.store(0, Ordering::Relaxed);
                }
                Err(_) => {
                    watcher.dropped_count.fetch_add(1, Ordering::Relaxed);
                    let consecutive = watcher.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                    if consecutive >= self.lagging_close_threshold {
                        to_close.push(*entry.key());
                    }
                }
            }
        }
        for id in to_close {
            self.watchers.remove(&id);
        }
    }

    pub fn denial_count(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }
}
