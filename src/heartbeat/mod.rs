//! Heartbeat: a periodic task runner with failure escalation.
//!
//! Runs as a background Tokio task on a fixed interval. Each tick hands the
//! configured task list to a [`TaskRunner`]. Failures are counted; the tick
//! that brings the consecutive-failure count to `notify_after_failures`
//! enqueues one message for the last user who talked to the assistant. The
//! cadence never changes with failures.

pub mod runner;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HeartbeatConfig;
use crate::store::{ChannelRepository, OutboxRepository};

/// Summary a runner returns when there is nothing worth telling the user.
pub const NO_REPLY_MARKER: &str = "[NO_REPLY]";

/// Executes one heartbeat's worth of tasks.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run `tasks` and return a summary for the user, or
    /// [`NO_REPLY_MARKER`] when there is nothing to report.
    ///
    /// # Errors
    ///
    /// Any error counts as a failed heartbeat.
    async fn run(&self, tasks: &[String]) -> anyhow::Result<String>;
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRun {
    /// Whether the runner succeeded.
    pub success: bool,
    /// Consecutive failures after this tick.
    pub consecutive_failures: u32,
}

/// Tick cadence and escalation threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Time between ticks.
    pub interval: Duration,
    /// Consecutive failures that trigger one notification.
    pub notify_after_failures: u32,
    /// Tasks handed to the runner.
    pub tasks: Vec<String>,
}

impl From<&HeartbeatConfig> for HeartbeatSettings {
    fn from(config: &HeartbeatConfig) -> Self {
        Self {
            interval: config.interval(),
            notify_after_failures: config.notify_after_failures,
            tasks: config.tasks.clone(),
        }
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct HeartbeatShared {
    runner: Arc<dyn TaskRunner>,
    outbox: Arc<dyn OutboxRepository>,
    channels: Arc<dyn ChannelRepository>,
    settings: HeartbeatSettings,
    consecutive_failures: AtomicU32,
    running: Mutex<Option<Running>>,
}

/// Periodic heartbeat. Cheap to clone; clones share one timer and counter.
#[derive(Clone)]
pub struct HeartbeatScheduler {
    shared: Arc<HeartbeatShared>,
}

impl std::fmt::Debug for HeartbeatScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatScheduler")
            .field("settings", &self.shared.settings)
            .field("consecutive_failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}

impl HeartbeatScheduler {
    /// Create a stopped scheduler.
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        outbox: Arc<dyn OutboxRepository>,
        channels: Arc<dyn ChannelRepository>,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            shared: Arc::new(HeartbeatShared {
                runner,
                outbox,
                channels,
                settings,
                consecutive_failures: AtomicU32::new(0),
                running: Mutex::new(None),
            }),
        }
    }

    /// Current consecutive-failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        self.shared
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Arm the repeating timer and run the first tick immediately.
    /// A second call while running is a no-op.
    pub fn start(&self) {
        let mut running = self.shared.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            debug!("heartbeat already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop(shutdown_rx).await });
        *running = Some(Running {
            shutdown_tx,
            handle,
        });
    }

    /// Cancel the timer. Idempotent; fine to call without `start()`.
    pub fn stop(&self) {
        let running = self
            .shared
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(running) = running {
            let _ = running.shutdown_tx.send(true);
            running.handle.abort();
            info!("heartbeat stopped");
        }
    }

    async fn run_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.shared.settings.interval;
        info!(interval_secs = period.as_secs(), "heartbeat started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    self.run_tick().await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Execute one tick: run the tasks, update the failure counter, and
    /// enqueue whatever the user should hear about.
    pub async fn run_tick(&self) -> HeartbeatRun {
        let shared = &self.shared;
        match shared.runner.run(&shared.settings.tasks).await {
            Ok(summary) => {
                let previous = shared.consecutive_failures.swap(0, Ordering::Relaxed);
                if previous > 0 {
                    info!(previous_failures = previous, "heartbeat recovered");
                }
                let summary = summary.trim();
                if !summary.is_empty() && summary != NO_REPLY_MARKER {
                    self.notify_last_user(summary).await;
                } else {
                    debug!("heartbeat finished with nothing to report");
                }
                HeartbeatRun {
                    success: true,
                    consecutive_failures: 0,
                }
            }
            Err(e) => {
                let count = shared
                    .consecutive_failures
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                warn!(consecutive_failures = count, error = %e, "heartbeat failed");
                if count == shared.settings.notify_after_failures {
                    let text = format!(
                        "Heads up: my scheduled checks have failed {count} times in a row. \
                         Last error: {e}"
                    );
                    self.notify_last_user(&text).await;
                }
                HeartbeatRun {
                    success: false,
                    consecutive_failures: count,
                }
            }
        }
    }

    async fn notify_last_user(&self, text: &str) {
        let last = match self.shared.channels.last_channel().await {
            Ok(Some(last)) => last,
            Ok(None) => {
                debug!("no last channel recorded, skipping heartbeat notification");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to load last channel");
                return;
            }
        };
        match self
            .shared
            .outbox
            .enqueue(&last.channel, &last.user_id, text)
            .await
        {
            Ok(id) => info!(id, channel = %last.channel, "heartbeat notification enqueued"),
            Err(e) => error!(error = %e, "failed to enqueue heartbeat notification"),
        }
    }
}
