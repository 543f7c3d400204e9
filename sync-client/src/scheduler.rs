//! Background sync scheduler.
//!
//! Runs a cycle on every tick of a timer and on demand. Requests arriving
//! while a cycle runs are coalesced by the engine.

use crate::engine::{CycleOutcome, SyncEngine};
use std::sync::Arc;
use std::time::Duration;
use sync_core::SyncTrigger;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Commands accepted by the scheduler task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Run a cycle now.
    SyncNow(SyncTrigger),
    /// Stop the task after the running cycle.
    Stop,
}

/// Handle to a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Request a cycle. Returns `false` if the scheduler is gone.
    pub async fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.command_tx
            .send(SchedulerCommand::SyncNow(trigger))
            .await
            .is_ok()
    }

    /// Stop the scheduler.
    pub async fn stop(&self) {
        let _ = self.command_tx.send(SchedulerCommand::Stop).await;
    }
}

/// Spawn a task running a timer cycle every `period`.
pub fn spawn_scheduler(
    engine: Arc<SyncEngine>,
    period: Duration,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (command_tx, mut command_rx) = mpsc::channel(16);

    let task = tokio::spawn(async move {
        tracing::info!(period_secs = period.as_secs(), "sync scheduler started");
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        timer.tick().await;

        loop {
            let trigger = tokio::select! {
                _ = timer.tick() => SyncTrigger::Timer,
                command = command_rx.recv() => match command {
                    Some(SchedulerCommand::SyncNow(trigger)) => trigger,
                    Some(SchedulerCommand::Stop) | None => break,
                },
            };
            run(&engine, trigger).await;
        }
        tracing::info!("sync scheduler stopped");
    });

    (SchedulerHandle { command_tx }, task)
}

async fn run(engine: &SyncEngine, trigger: SyncTrigger) {
    match engine.sync(trigger).await {
        Ok(CycleOutcome::Completed(report)) => {
            tracing::debug!(?trigger, pushed = report.pushed, pulled = report.pulled, "scheduled cycle done");
        }
        Ok(outcome) => tracing::debug!(?trigger, ?outcome, "scheduled cycle did not run"),
        Err(e) => tracing::error!(?trigger, error = %e, "scheduled cycle failed"),
    }
}
