//! Timer core: the job table that turns triggers into callback firings.
//!
//! A job binds a [`Trigger`] to an async callback under an opaque id. One
//! loop scans for due jobs on a fixed tick, applies the misfire grace window
//! and the per-job instance ceiling, and dispatches callbacks onto the tokio
//! runtime. One-shot jobs remove themselves after their final fire, so a
//! lookup for a job id that has already fired can legitimately miss.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::triggers::Trigger;

/// Future produced by one job firing.
pub(super) type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked at each fire instant.
pub(super) type JobCallback = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    trigger: Trigger,
    next_fire: DateTime<Utc>,
    callback: JobCallback,
    /// Live instance count for this job's in-flight callbacks
    running: Arc<AtomicUsize>,
}

/// The timer-driven job engine.
pub(super) struct JobRunner {
    jobs: RwLock<HashMap<Uuid, Job>>,
    misfire_grace: Duration,
    max_instances: usize,
    tick: std::time::Duration,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub(super) fn new(
        misfire_grace: Duration,
        max_instances: usize,
        tick: std::time::Duration,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            misfire_grace,
            max_instances,
            tick,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a job. The id must be fresh; replacing an existing
    /// registration is the caller's responsibility (remove, then add).
    pub(super) async fn add_job(
        &self,
        id: Uuid,
        trigger: Trigger,
        next_fire: DateTime<Utc>,
        callback: JobCallback,
    ) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(
            id,
            Job {
                trigger,
                next_fire,
                callback,
                running: Arc::new(AtomicUsize::new(0)),
            },
        );
        debug!(job_id = %id, next_fire = %next_fire, "job registered");
    }

    /// Remove a job. Returns false if the id is unknown, which is expected
    /// for one-shot jobs that already fired and removed themselves.
    pub(super) async fn remove_job(&self, id: &Uuid) -> bool {
        let removed = self.jobs.write().await.remove(id).is_some();
        if removed {
            debug!(job_id = %id, "job removed");
        }
        removed
    }

    /// Live view of a job: its next fire instant and trigger.
    pub(super) async fn job_info(&self, id: &Uuid) -> Option<(DateTime<Utc>, Trigger)> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|job| (job.next_fire, job.trigger.clone()))
    }

    /// Number of currently registered jobs.
    #[cfg(test)]
    pub(super) async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Start the tick loop. Runs until [`JobRunner::stop`] is called.
    pub(super) fn start(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runner.tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        runner.dispatch_due(Utc::now()).await;
                    }
                    _ = runner.shutdown.cancelled() => {
                        debug!("timer core stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the tick loop. In-flight callbacks are not cancelled.
    pub(super) fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Dispatch every job due at `now`, advancing triggers and dropping
    /// registrations that will never fire again.
    ///
    /// The job table lock is held only while scanning; callbacks run on
    /// their own spawned tasks.
    pub(super) async fn dispatch_due(&self, now: DateTime<Utc>) {
        let mut due: Vec<(Uuid, JobCallback, Arc<AtomicUsize>)> = Vec::new();
        {
            let mut jobs = self.jobs.write().await;
            let mut exhausted = Vec::new();

            for (id, job) in jobs.iter_mut() {
                if job.next_fire > now {
                    continue;
                }

                let late = now - job.next_fire;
                if late > self.misfire_grace {
                    warn!(
                        job_id = %id,
                        late_secs = late.num_seconds(),
                        "fire missed beyond grace period, dropping"
                    );
                } else if job.running.load(Ordering::SeqCst) >= self.max_instances {
                    warn!(job_id = %id, max = self.max_instances, "instance ceiling reached, skipping fire");
                } else {
                    due.push((*id, Arc::clone(&job.callback), Arc::clone(&job.running)));
                }

                // Missed or skipped fires are coalesced: the next fire is
                // computed from now, not from the missed instant.
                match job.trigger.next_fire(now) {
                    Some(next) => job.next_fire = next,
                    None => exhausted.push(*id),
                }
            }

            for id in exhausted {
                jobs.remove(&id);
                debug!(job_id = %id, "one-shot job exhausted, removed");
            }
        }

        for (id, callback, running) in due {
            running.fetch_add(1, Ordering::SeqCst);
            let fut = callback();
            tokio::spawn(async move {
                fut.await;
                running.fetch_sub(1, Ordering::SeqCst);
                debug!(job_id = %id, "job callback finished");
            });
        }
    }
}

#[cfg(test)]
mod tests;
