//! Periodic job scheduler
//!
//! Each registered job gets its own tick loop. A tick only starts a run when
//! the job's in-flight guard is free; otherwise the tick is dropped, so a
//! slow run never overlaps the next one. Different jobs tick independently.
//!
//! A run executes in its own task. Errors and panics are caught at that task
//! boundary and logged, and the loop keeps ticking. `stop` cancels the loops,
//! waits for in-flight runs up to a grace period and aborts whatever is left.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::store::BoxFuture;

/// A unit of background work.
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Run once. Returns the number of rows affected.
    fn run(&self) -> BoxFuture<'_, Result<u64>>;
}

/// What happened to a requested run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { count: u64 },
    Failed { error: String },
    /// A run of the same job was already in flight, or the scheduler stopped.
    Skipped,
}

/// Runs that were still in flight when `stop` was called.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Finished within the grace period.
    pub completed: Vec<String>,
    /// Aborted when the grace period ran out.
    pub aborted: Vec<String>,
}

struct Slot {
    job: Arc<dyn Job>,
    interval: Duration,
    in_flight: AtomicBool,
    current: Mutex<Option<AbortHandle>>,
    idle: Notify,
}

impl Slot {
    fn name(&self) -> &str {
        self.job.name()
    }

    async fn wait_idle(&self) {
        loop {
            // Registered before the check so a release in between is not missed
            let notified = self.idle.notified();
            if !self.in_flight.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn abort_current(&self) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = current.as_ref() {
            handle.abort();
        }
    }
}

/// Holds a job's in-flight flag for the lifetime of one run.
struct InFlight(Arc<Slot>);

impl InFlight {
    fn acquire(slot: &Arc<Slot>) -> Option<Self> {
        slot.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(slot.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Scheduler {
    slots: BTreeMap<String, Arc<Slot>>,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register a job to run every `interval`. Must be called before `start`.
    ///
    /// A zero interval is rejected.
    pub fn add_job(&mut self, job: Arc<dyn Job>, interval: Duration) -> Result<()> {
        let name = job.name().to_string();
        if interval.is_zero() {
            return Err(Error::validation(
                "interval",
                format!("job {name} needs a non-zero interval"),
            ));
        }
        debug!(job = %name, interval_secs = interval.as_secs(), "job registered");
        self.slots.insert(
            name,
            Arc::new(Slot {
                job,
                interval,
                in_flight: AtomicBool::new(false),
                current: Mutex::new(None),
                idle: Notify::new(),
            }),
        );
        Ok(())
    }

    pub fn job_names(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Spawn one tick loop per job. The first run of each job happens one
    /// interval after start. Calling `start` twice has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("scheduler already started");
            return;
        }

        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        for slot in self.slots.values() {
            loops.push(tokio::spawn(tick_loop(slot.clone(), self.cancel.clone())));
        }
        info!(jobs = self.slots.len(), "scheduler started");
    }

    /// Run a registered job now, under the same in-flight guard as its timer.
    pub async fn run_now(&self, name: &str) -> Result<RunOutcome> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("job {name}")))?;

        match dispatch(slot, &self.cancel) {
            Some(handle) => Ok(handle.await.unwrap_or_else(|_| RunOutcome::Failed {
                error: "run cancelled".into(),
            })),
            None => Ok(RunOutcome::Skipped),
        }
    }

    /// Stop ticking and wait up to `grace` for in-flight runs.
    ///
    /// Runs still going when the grace period ends are aborted. Always
    /// returns once the grace period has elapsed.
    pub async fn stop(&self, grace: Duration) -> ShutdownReport {
        self.cancel.cancel();

        let loops: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "tick loop ended abnormally");
            }
        }

        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();
        for slot in self.slots.values() {
            if !slot.in_flight.load(Ordering::Acquire) {
                continue;
            }
            match tokio::time::timeout_at(deadline, slot.wait_idle()).await {
                Ok(()) => report.completed.push(slot.name().to_string()),
                Err(_) => {
                    warn!(job = slot.name(), "job still running after grace period, aborting");
                    slot.abort_current();
                    report.aborted.push(slot.name().to_string());
                }
            }
        }

        info!(
            completed = report.completed.len(),
            aborted = report.aborted.len(),
            "scheduler stopped"
        );
        report
    }
}

async fn tick_loop(slot: Arc<Slot>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(slot.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Detached; the slot tracks the run for shutdown
                let _ = dispatch(&slot, &cancel);
            }
        }
    }
    debug!(job = slot.name(), "tick loop stopped");
}

/// Start a run if the job is idle. `None` when the tick is skipped.
fn dispatch(slot: &Arc<Slot>, cancel: &CancellationToken) -> Option<JoinHandle<RunOutcome>> {
    if cancel.is_cancelled() {
        debug!(job = slot.name(), "scheduler stopped, not starting run");
        return None;
    }

    let Some(guard) = InFlight::acquire(slot) else {
        warn!(job = slot.name(), "previous run still in flight, skipping tick");
        metrics::counter!("scheduler_ticks_skipped_total", "job" => slot.name().to_string())
            .increment(1);
        return None;
    };

    let handle = tokio::spawn(execute(guard));
    *slot.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.abort_handle());
    Some(handle)
}

async fn execute(guard: InFlight) -> RunOutcome {
    let slot = guard.0.clone();
    let name = slot.name().to_string();
    let job = slot.job.clone();
    let started = Instant::now();

    let mut inner = AbortOnDrop(tokio::spawn(async move { job.run().await }));
    let outcome = match (&mut inner.0).await {
        Ok(Ok(count)) => {
            debug!(
                job = %name,
                count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job run finished"
            );
            RunOutcome::Completed { count }
        }
        Ok(Err(e)) => {
            error!(job = %name, error = %e, "job run failed");
            metrics::counter!("scheduler_job_failures_total", "job" => name.clone()).increment(1);
            RunOutcome::Failed {
                error: e.to_string(),
            }
        }
        Err(e) => {
            let reason = if e.is_panic() { "panicked" } else { "cancelled" };
            error!(job = %name, reason, "job run did not complete");
            metrics::counter!("scheduler_job_failures_total", "job" => name.clone()).increment(1);
            RunOutcome::Failed {
                error: format!("run {reason}"),
            }
        }
    };

    drop(guard);
    outcome
}
