//! Polls the outbox for due rows and drains them one at a time.
//!
//! Each row id enters an in-flight set when it is queued and leaves it when
//! the worker is done with it, on every path. A row already in flight is
//! never queued twice, so overlapping polls cannot double-send.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::OutboxProcessor;
use crate::store::{OutboxMessage, OutboxRepository};

/// Capacity of the work queue between the poll loop and the worker.
const WORK_QUEUE_CAPACITY: usize = 64;

/// Shortest accepted poll period; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct PollerShared {
    channel: String,
    repo: Arc<dyn OutboxRepository>,
    processor: Arc<OutboxProcessor>,
    interval: Duration,
    in_flight: Mutex<HashSet<i64>>,
    flush: Notify,
    work_tx: mpsc::Sender<OutboxMessage>,
    work_rx: Mutex<Option<mpsc::Receiver<OutboxMessage>>>,
}

/// Drives an [`OutboxProcessor`] for one channel.
///
/// Cheap to clone; clones share the in-flight set and work queue.
#[derive(Clone)]
pub struct OutboxPoller {
    shared: Arc<PollerShared>,
}

impl std::fmt::Debug for OutboxPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxPoller")
            .field("channel", &self.shared.channel)
            .field("interval", &self.shared.interval)
            .finish_non_exhaustive()
    }
}

/// Removes an id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<i64>>,
    id: i64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl OutboxPoller {
    /// Create a poller for `channel`, polling every `interval` (at least
    /// 100 ms).
    pub fn new(
        channel: impl Into<String>,
        repo: Arc<dyn OutboxRepository>,
        processor: Arc<OutboxProcessor>,
        interval: Duration,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_CAPACITY);
        Self {
            shared: Arc::new(PollerShared {
                channel: channel.into(),
                repo,
                processor,
                interval: interval.max(MIN_POLL_INTERVAL),
                in_flight: Mutex::new(HashSet::new()),
                flush: Notify::new(),
                work_tx,
                work_rx: Mutex::new(Some(work_rx)),
            }),
        }
    }

    /// Ask the running loop to poll now. A request made before the loop
    /// starts is kept and served on start.
    pub fn flush(&self) {
        self.shared.flush.notify_one();
    }

    /// Ids currently queued or being processed.
    pub fn in_flight(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// List due rows and queue those not already in flight.
    ///
    /// Skipped entirely while the sender is not ready. Returns how many rows
    /// were queued.
    pub async fn poll_once(&self) -> usize {
        let shared = &self.shared;
        if !shared.processor.sender().is_ready() {
            debug!(channel = %shared.channel, "sender not ready, skipping outbox poll");
            return 0;
        }

        let pending = match shared.repo.list_pending(&shared.channel).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(channel = %shared.channel, error = %e, "failed to list pending outbox messages");
                return 0;
            }
        };

        let mut queued: usize = 0;
        for item in pending {
            let id = item.id;
            let fresh = shared
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id);
            if !fresh {
                continue;
            }
            if let Err(e) = shared.work_tx.try_send(item) {
                shared
                    .in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                debug!(id, error = %e, "outbox work queue full, deferring");
                break;
            }
            queued = queued.saturating_add(1);
        }
        if queued > 0 {
            debug!(channel = %shared.channel, queued, "outbox messages queued");
        }
        queued
    }

    /// Spawn the worker and the poll loop. Returns the loop's handle; the
    /// loop ends when `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let rx = self
            .shared
            .work_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(rx) = rx else {
            warn!(channel = %self.shared.channel, "outbox poller already running");
            return;
        };
        let worker = tokio::spawn(work(Arc::clone(&self.shared), rx));

        let mut interval = tokio::time::interval(self.shared.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            channel = %self.shared.channel,
            interval_secs = self.shared.interval.as_secs(),
            "outbox poller started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once().await;
                }
                () = self.shared.flush.notified() => {
                    self.poll_once().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        worker.abort();
        info!(channel = %self.shared.channel, "outbox poller stopped");
    }
}

/// Single worker: one row at a time.
async fn work(shared: Arc<PollerShared>, mut rx: mpsc::Receiver<OutboxMessage>) {
    while let Some(item) = rx.recv().await {
        let _guard = InFlightGuard {
            in_flight: &shared.in_flight,
            id: item.id,
        };
        let outcome = shared.processor.process(&item).await;
        debug!(id = item.id, ?outcome, "outbox row processed");
    }
}
