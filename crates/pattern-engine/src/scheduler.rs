//! Periodic triggers for the batch passes

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Batch passes run on their own cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJob {
    Correlation,
    Scenes,
}

impl fmt::Display for BatchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Correlation => write!(f, "correlation"),
            Self::Scenes => write!(f, "scenes"),
        }
    }
}

/// Emitted when a job is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTick {
    pub job: BatchJob,
}

/// Interval timers for batch jobs
pub struct BatchScheduler {
    /// Active timer handles (keyed by job)
    timers: Arc<DashMap<BatchJob, JoinHandle<()>>>,
    tick_tx: broadcast::Sender<BatchTick>,
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchScheduler {
    #[must_use]
    pub fn new() -> Self {
        let (tick_tx, _) = broadcast::channel(16);
        Self {
            timers: Arc::new(DashMap::new()),
            tick_tx,
        }
    }

    /// Subscribe to job ticks
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BatchTick> {
        self.tick_tx.subscribe()
    }

    /// Run `job` every `every`, replacing any previous timer for it.
    /// A zero interval disables the job.
    pub fn register(&self, job: BatchJob, every: Duration) {
        self.remove(job);
        if every.is_zero() {
            tracing::info!("Batch job {} disabled", job);
            return;
        }

        let tick_tx = self.tick_tx.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;
                tracing::debug!("Batch job {} due", job);
                let _ = tick_tx.send(BatchTick { job });
            }
        });

        self.timers.insert(job, handle);
        tracing::info!("Scheduled batch job {} every {:?}", job, every);
    }

    /// Stop a job's timer
    pub fn remove(&self, job: BatchJob) {
        if let Some((_, handle)) = self.timers.remove(&job) {
            handle.abort();
            tracing::debug!("Removed timer for batch job {}", job);
        }
    }

    /// Get the number of active timers
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}
