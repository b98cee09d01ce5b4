//! Background scheduling of sync cycles.
//!
//! One task owns the loop; timer ticks, connectivity restores and forced
//! syncs all funnel into it, so cycles never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::orchestrator::{SyncOrchestrator, SyncReport};
use super::remote::ConnectivityReceiver;
use crate::config::SyncConfig;

/// Timing rules for the background loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Interval while operations are queued
    pub short_interval: Duration,
    /// Interval while the queue is empty
    pub long_interval: Duration,
    /// Minimum gap between connectivity-triggered cycles
    pub min_connectivity_spacing: Duration,
}

impl From<&SyncConfig> for SchedulePolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            short_interval: config.short_interval(),
            long_interval: config.long_interval(),
            min_connectivity_spacing: config.min_connectivity_spacing(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Force(oneshot::Sender<SyncReport>),
    ConnectivityRestored,
}

/// Handle to a running scheduler
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Run a cycle now, bypassing the interval; `None` once stopped
    pub async fn force_sync(&self) -> Option<SyncReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(Command::Force(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    /// Tell the scheduler the network came back
    pub async fn notify_connectivity(&self) {
        if self.commands.send(Command::ConnectivityRestored).await.is_err() {
            tracing::debug!("Scheduler stopped; ignoring connectivity notice");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop the loop, cancelling any cycle in flight, and wait for it to exit
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Sync scheduler task failed: {e}");
            }
        }
    }
}

/// Owner of the background loop
pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    policy: SchedulePolicy,
    connectivity: ConnectivityReceiver,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    last_connectivity_sync: Option<Instant>,
}

impl SyncScheduler {
    /// Spawn the loop; the first cycle runs immediately
    pub fn start(
        orchestrator: Arc<SyncOrchestrator>,
        policy: SchedulePolicy,
        connectivity: ConnectivityReceiver,
    ) -> SyncHandle {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            orchestrator,
            policy,
            connectivity,
            commands: commands_rx,
            shutdown: shutdown.clone(),
            last_connectivity_sync: None,
        };
        let task = tokio::spawn(scheduler.run());

        SyncHandle {
            commands: commands_tx,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(mut self) {
        tracing::info!(
            "Sync scheduler started (short {:?}, long {:?})",
            self.policy.short_interval,
            self.policy.long_interval
        );
        let mut next_tick = Instant::now();
        let mut watching = true;

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Force(reply)) => {
                        tracing::debug!("Forced sync requested");
                        let report = self.cycle().await;
                        let _ = reply.send(report);
                        next_tick = self.next_tick().await;
                    }
                    Some(Command::ConnectivityRestored) => {
                        if self.on_connectivity_restored().await {
                            next_tick = self.next_tick().await;
                        }
                    }
                    None => break,
                },
                changed = self.connectivity.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if *self.connectivity.borrow_and_update()
                        && self.on_connectivity_restored().await
                    {
                        next_tick = self.next_tick().await;
                    }
                }
                () = tokio::time::sleep_until(next_tick) => {
                    tracing::debug!("Periodic sync tick");
                    self.cycle().await;
                    next_tick = self.next_tick().await;
                }
            }
        }

        tracing::info!("Sync scheduler stopped");
    }

    async fn cycle(&self) -> SyncReport {
        self.orchestrator
            .run_cycle(&self.shutdown.child_token())
            .await
    }

    /// Short interval while work is queued, long otherwise
    async fn next_tick(&self) -> Instant {
        let interval = if self.orchestrator.pending_operations().await > 0 {
            self.policy.short_interval
        } else {
            self.policy.long_interval
        };
        Instant::now() + interval
    }

    /// Run an out-of-band cycle unless one ran too recently; returns whether
    /// a cycle ran
    async fn on_connectivity_restored(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_connectivity_sync {
            if now.duration_since(last) < self.policy.min_connectivity_spacing {
                tracing::debug!("Connectivity restored; too soon since last sync");
                return false;
            }
        }

        tracing::info!("Connectivity restored; syncing");
        self.last_connectivity_sync = Some(now);
        self.cycle().await;
        true
    }
}
