// src/core/scheduler/mod.rs

//! The periodic scheduler: a fixed-size worker pool for ad-hoc task
//! execution plus cron- and interval-triggered recurring jobs.
//!
//! Ad-hoc jobs submitted through [`WorkerPool::submit`] start as soon as a
//! worker slot frees up. Recurring jobs fire on their trigger with
//! `max_instances = 1`: a still-running instance suppresses the next firing
//! rather than queueing behind it.

pub mod timeparse;

use crate::core::errors::AceError;
use chrono::Utc;
use cron::Schedule;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Parses a crontab expression. Five-field crontab lines are accepted by
/// pinning the seconds column to zero.
pub fn parse_crontab(spec: &str) -> Result<Schedule, AceError> {
    let fields = spec.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {spec}")
    } else {
        spec.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| AceError::Validation(format!("invalid crontab '{spec}': {e}")))
}

/// Handle for enqueueing work onto the pool. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<JobFuture>,
}

impl WorkerPool {
    /// Creates the pool handle and the driver task that must be spawned
    /// into the server's background task set.
    pub fn new(size: usize) -> (Self, WorkerPoolDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            WorkerPoolDriver {
                rx,
                permits: Arc::new(Semaphore::new(size)),
            },
        )
    }

    /// Enqueues a job. Admission never blocks on worker availability.
    pub fn submit(
        &self,
        job: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), AceError> {
        self.tx
            .send(Box::pin(job))
            .map_err(|_| AceError::Internal("worker pool is shut down".to_string()))
    }
}

/// Drives the pool: receives queued jobs and runs each on its own tokio
/// task, bounded by the semaphore.
pub struct WorkerPoolDriver {
    rx: mpsc::UnboundedReceiver<JobFuture>,
    permits: Arc<Semaphore>,
}

impl WorkerPoolDriver {
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut inflight = JoinSet::new();
        loop {
            tokio::select! {
                Some(job) = self.rx.recv() => {
                    let permit = match self.permits.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    inflight.spawn(async move {
                        job.await;
                        drop(permit);
                    });
                }
                Some(res) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = res
                        && e.is_panic()
                    {
                        warn!("A task worker panicked: {e:?}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("Worker pool shutting down; waiting for in-flight tasks.");
        while let Some(res) = inflight.join_next().await {
            if let Err(e) = res
                && e.is_panic()
            {
                warn!("A task worker panicked during shutdown: {e:?}");
            }
        }
    }
}

/// When a recurring job fires.
pub enum Trigger {
    Cron(Schedule),
    Interval(Duration),
}

impl Trigger {
    /// Time until the next firing, from now.
    fn next_delay(&self) -> Duration {
        match self {
            Trigger::Interval(d) => *d,
            Trigger::Cron(schedule) => schedule
                .upcoming(Utc)
                .next()
                .and_then(|next| (next - Utc::now()).to_std().ok())
                // An exhausted schedule never fires again; park the loop.
                .unwrap_or(Duration::from_secs(3_600 * 24 * 365)),
        }
    }
}

type JobFactory = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// One recurring job: a trigger plus a factory producing the job future for
/// each firing.
pub struct RecurringJob {
    pub name: String,
    pub trigger: Trigger,
    factory: JobFactory,
    running: Arc<AtomicBool>,
}

impl RecurringJob {
    pub fn new(
        name: impl Into<String>,
        trigger: Trigger,
        factory: impl Fn() -> JobFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            trigger,
            factory: Arc::new(factory),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs the trigger loop, dispatching firings onto the worker pool.
    /// A firing is skipped while the previous instance is still running.
    pub async fn run(self, pool: WorkerPool, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Recurring job '{}' armed.", self.name);
        loop {
            let delay = self.trigger.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if self.running.swap(true, Ordering::AcqRel) {
                        debug!(
                            "Recurring job '{}' still running; skipping this firing.",
                            self.name
                        );
                        continue;
                    }
                    let fut = (self.factory)();
                    let flag = self.running.clone();
                    let name = self.name.clone();
                    if pool
                        .submit(async move {
                            fut.await;
                            flag.store(false, Ordering::Release);
                            debug!("Recurring job '{name}' instance finished.");
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Recurring job '{}' shutting down.", self.name);
                    return;
                }
            }
        }
    }
}
