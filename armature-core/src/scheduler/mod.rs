//! Cron scheduler
//!
//! Jobs run on six-field cron specs (seconds included) with bounded retry.
//! When a Redis handle is available the scheduler joins the `scheduler`
//! cluster and takes a cluster-wide lock named after the task before every
//! firing, so a job scheduled on every node still runs exactly once per
//! tick. Without a cluster the job runs locally.

use crate::cache::RedisCache;
use crate::cluster::Cluster;
use anyhow::{Context as _, Result};
use chrono::Utc;
use cron::Schedule;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Name of the cluster scheduler instances coordinate through.
const SCHEDULER_CLUSTER: &str = "scheduler";

/// The callback a task runs.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A scheduled job.
#[derive(Clone)]
pub struct Task {
    /// Unique name; doubles as the cluster lock name.
    pub name: String,
    /// Six-field cron spec (seconds first) or an `@hourly`-style shortcut.
    pub spec: String,
    /// Total attempts per firing (1 = no retry).
    pub max_retry: u32,
    /// The job body.
    pub job: JobFn,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        spec: impl Into<String>,
        max_retry: u32,
        job: JobFn,
    ) -> Self {
        Self { name: name.into(), spec: spec.into(), max_retry, job }
    }
}

/// Owns the per-job timer tasks and the lazily-joined scheduler cluster.
pub struct Scheduler {
    cache: Option<Arc<RedisCache>>,
    cluster: Arc<AsyncMutex<Option<Arc<Cluster>>>>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    /// A scheduler without cluster coordination; jobs always run locally.
    pub fn local() -> Self {
        Self::new(None)
    }

    /// `cache` enables cluster-exclusive firing.
    pub fn new(cache: Option<Arc<RedisCache>>) -> Self {
        Self { cache, cluster: Arc::new(AsyncMutex::new(None)), jobs: Mutex::new(HashMap::new()) }
    }

    /// Register a job and start its timer.
    pub fn register_job(&self, task: Task) -> Result<()> {
        let timing = parse_spec(&task.name, &task.spec)?;

        let cache = self.cache.clone();
        let cluster = self.cluster.clone();
        let name = task.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let wait = match &timing {
                    Timing::Cron(schedule) => {
                        let Some(next) = schedule.upcoming(Utc).next() else {
                            log::warn!("job {} has no future firings, stopping", task.name);
                            return;
                        };
                        (next - Utc::now()).to_std().unwrap_or_default()
                    }
                    Timing::Every(interval) => *interval,
                };
                tokio::time::sleep(wait).await;

                match run_job(&task, cache.clone(), &cluster).await {
                    Ok(()) => log::info!("job success {}", task.name),
                    Err(err) => log::error!("job {} failed: {}", task.name, err),
                }
            }
        });

        let previous = self.jobs.lock().expect("job table lock poisoned").insert(name, handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Remove a job and stop its timer.
    pub fn unregister_job(&self, name: &str) {
        if let Some(handle) = self.jobs.lock().expect("job table lock poisoned").remove(name) {
            handle.abort();
        }
    }

    /// Stop every timer.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().expect("job table lock poisoned");
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Timing {
    Cron(Box<Schedule>),
    Every(std::time::Duration),
}

/// Parse a cron spec or the `@every <duration>` shortcut.
fn parse_spec(name: &str, spec: &str) -> Result<Timing> {
    if let Some(literal) = spec.strip_prefix("@every ") {
        let interval = crate::settings::parse_duration(literal)
            .ok_or_else(|| anyhow::anyhow!("invalid @every interval for {}: {}", name, literal))?;
        return Ok(Timing::Every(interval));
    }
    let schedule = Schedule::from_str(spec)
        .with_context(|| format!("invalid cron spec for {}: {}", name, spec))?;
    Ok(Timing::Cron(Box::new(schedule)))
}

async fn run_job(
    task: &Task,
    cache: Option<Arc<RedisCache>>,
    cluster_slot: &AsyncMutex<Option<Arc<Cluster>>>,
) -> Result<()> {
    let cluster = cluster_slot.lock().await.clone();
    let cluster = match cluster {
        Some(cluster) => Some(cluster),
        None => match cache {
            Some(cache) => match Cluster::join(SCHEDULER_CLUSTER, cache).await {
                Ok(joined) => {
                    *cluster_slot.lock().await = Some(joined.clone());
                    Some(joined)
                }
                Err(err) => {
                    log::warn!("scheduler cluster unavailable, running locally: {}", err);
                    None
                }
            },
            None => None,
        },
    };

    match cluster {
        Some(cluster) => run_on_cluster(task, &cluster).await,
        None => run_with_retry(task).await,
    }
}

async fn run_on_cluster(task: &Task, cluster: &Cluster) -> Result<()> {
    // lock refused means another node owns this firing
    if cluster.lock(&task.name).await.is_err() {
        return Ok(());
    }
    let res = run_with_retry(task).await;
    let _ = cluster.unlock(&task.name).await;
    res
}

async fn run_with_retry(task: &Task) -> Result<()> {
    let mut attempts = task.max_retry.max(1);
    loop {
        match (task.job)().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempts -= 1;
                if attempts == 0 {
                    return Err(err);
                }
                log::warn!("job {} retrying after error: {}", task.name, err);
            }
        }
    }
}
