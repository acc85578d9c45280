//! Routine scheduler for managing background loop lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::collector::{CollectorError, Routine, TickStatus};

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata about a registered job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// Job UUID.
    pub id: uuid::Uuid,
    /// Routine name.
    pub name: String,
    /// Schedule description.
    pub schedule: String,
}

/// Self-metrics shared by every routine.
#[derive(Clone)]
struct TickMetrics {
    ticks: IntCounterVec,
    durations: HistogramVec,
}

impl TickMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let ticks = IntCounterVec::new(
            Opts::new("exporter_routine_ticks_total", "Routine ticks by outcome"),
            &["routine", "status"],
        )?;
        let durations = HistogramVec::new(
            HistogramOpts::new(
                "exporter_routine_tick_duration_seconds",
                "Routine tick duration in seconds",
            ),
            &["routine"],
        )?;
        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(durations.clone()))?;
        Ok(Self { ticks, durations })
    }
}

/// Everything one job needs to run a tick of its routine.
struct TickRunner<R> {
    routine: Arc<R>,
    name: String,
    /// Held for the duration of a tick.
    running: Arc<Mutex<()>>,
    metrics: TickMetrics,
}

impl<R> Clone for TickRunner<R> {
    fn clone(&self) -> Self {
        Self {
            routine: Arc::clone(&self.routine),
            name: self.name.clone(),
            running: Arc::clone(&self.running),
            metrics: self.metrics.clone(),
        }
    }
}

impl<R: Routine> TickRunner<R> {
    /// Run one tick unless the previous one is still in flight.
    async fn run(&self) -> TickStatus {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::warn!(routine = %self.name, "Previous tick still running, skipping");
            self.record(TickStatus::Skipped);
            return TickStatus::Skipped;
        };

        let start = Instant::now();
        tracing::debug!(routine = %self.name, "Running tick");
        let result = self.routine.tick().await;
        let elapsed = start.elapsed();
        self.metrics
            .durations
            .with_label_values(&[self.name.as_str()])
            .observe(elapsed.as_secs_f64());

        let status = match result {
            Ok(()) => {
                tracing::debug!(routine = %self.name, duration_ms = elapsed.as_millis(), "Tick succeeded");
                TickStatus::Success
            }
            Err(e) => {
                tracing::error!(routine = %self.name, error = %e, "Tick failed");
                TickStatus::Failed
            }
        };
        self.record(status);
        status
    }

    fn record(&self, status: TickStatus) {
        self.metrics
            .ticks
            .with_label_values(&[self.name.as_str(), status.as_ref()])
            .inc();
    }
}

/// Scheduler for the background routines.
///
/// Uses `tokio-cron-scheduler` for job scheduling. Each routine becomes a
/// repeated job; ticks of the same routine never overlap.
pub struct RoutineScheduler {
    scheduler: JobScheduler,
    jobs: Arc<RwLock<HashMap<uuid::Uuid, JobInfo>>>,
    metrics: TickMetrics,
}

impl RoutineScheduler {
    /// Create a new scheduler that records self-metrics into `registry`.
    pub async fn new(registry: &Registry) -> Result<Self, CollectorError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            metrics: TickMetrics::register(registry)?,
        })
    }
}

impl std::fmt::Debug for RoutineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineScheduler")
            .field(
                "job_count",
                &self.jobs.try_read().map(|j| j.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl RoutineScheduler {
    /// Register a routine as a repeated job.
    pub async fn spawn<R: Routine>(&self, routine: R) -> Result<uuid::Uuid, CollectorError> {
        let name = routine.name().to_string();
        let schedule = routine.schedule();

        let runner = self.runner(routine);
        let job = Self::create_job(runner, schedule.period())?;

        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;

        self.jobs.write().await.insert(
            job_id,
            JobInfo {
                id: job_id,
                name: name.clone(),
                schedule: schedule.to_string(),
            },
        );

        tracing::info!(routine = %name, job_id = %job_id, schedule = %schedule, "Routine registered");
        Ok(job_id)
    }

    /// Start the scheduler.
    pub async fn start(&self) -> Result<(), CollectorError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;
        tracing::info!("Routine scheduler started");
        Ok(())
    }

    /// List all registered jobs.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Get the number of registered jobs.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Remove a routine job by ID.
    pub async fn remove(&self, job_id: &uuid::Uuid) -> Result<(), CollectorError> {
        self.scheduler
            .remove(job_id)
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;

        if let Some(job) = self.jobs.write().await.remove(job_id) {
            tracing::info!(routine = %job.name, job_id = %job_id, "Routine removed");
        }
        Ok(())
    }

    /// Gracefully shutdown the scheduler with default timeout.
    pub async fn shutdown(self) -> Result<(), CollectorError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown with custom timeout.
    pub async fn shutdown_with_timeout(mut self, timeout: Duration) -> Result<(), CollectorError> {
        let job_count = self.jobs.read().await.len();
        let result = tokio::time::timeout(timeout, self.scheduler.shutdown()).await;

        match result {
            Ok(Ok(())) => {
                tracing::info!(job_count, "Routine scheduler shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(job_count, error = %e, "Routine scheduler shutdown failed");
                Err(CollectorError::Scheduler(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(job_count, "Routine scheduler shutdown timed out");
                Ok(())
            }
        }
    }

    // --- Private helpers ---

    fn runner<R: Routine>(&self, routine: R) -> TickRunner<R> {
        TickRunner {
            name: routine.name().to_string(),
            routine: Arc::new(routine),
            running: Arc::new(Mutex::new(())),
            metrics: self.metrics.clone(),
        }
    }

    fn create_job<R: Routine>(runner: TickRunner<R>, period: Duration) -> Result<Job, CollectorError> {
        Job::new_repeated_async(period, move |_: uuid::Uuid, _: JobScheduler| {
            let runner = runner.clone();
            Box::pin(async move {
                runner.run().await;
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        })
        .map_err(|e| CollectorError::Scheduler(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Schedule;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// A routine that counts ticks and optionally fails or blocks.
    struct MockRoutine {
        name: String,
        ticks: Arc<AtomicUsize>,
        fail: bool,
        release: Option<Arc<Notify>>,
    }

    impl MockRoutine {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ticks: Arc::new(AtomicUsize::new(0)),
                fail: false,
                release: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl Routine for MockRoutine {
        fn name(&self) -> &str {
            &self.name
        }

        fn schedule(&self) -> Schedule {
            Schedule::interval(Duration::from_secs(60))
        }

        async fn tick(&self) -> Result<(), CollectorError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if let Some(release) = &self.release {
                release.notified().await;
            }
            if self.fail {
                return Err(CollectorError::Config("boom".into()));
            }
            Ok(())
        }
    }

    fn tick_count(registry: &Registry, routine: &str, status: &str) -> u64 {
        registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "exporter_routine_ticks_total")
            .and_then(|f| {
                f.get_metric()
                    .iter()
                    .find(|m| {
                        let labels = m.get_label();
                        labels.iter().any(|l| l.get_name() == "routine" && l.get_value() == routine)
                            && labels.iter().any(|l| l.get_name() == "status" && l.get_value() == status)
                    })
                    .map(|m| m.get_counter().get_value() as u64)
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_scheduler_lifecycle() {
        let registry = Registry::new();
        let scheduler = RoutineScheduler::new(&registry).await.unwrap();

        let job_id = scheduler.spawn(MockRoutine::new("scrape")).await.unwrap();
        assert_eq!(scheduler.job_count().await, 1);

        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "scrape");
        assert!(jobs[0].schedule.contains("1m"));

        scheduler.remove(&job_id).await.unwrap();
        assert_eq!(scheduler.job_count().await, 0);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_outcomes_are_counted() {
        let registry = Registry::new();
        let scheduler = RoutineScheduler::new(&registry).await.unwrap();

        let ok = scheduler.runner(MockRoutine::new("ok"));
        assert_eq!(ok.run().await, TickStatus::Success);
        assert_eq!(ok.run().await, TickStatus::Success);

        let failing = scheduler.runner(MockRoutine {
            fail: true,
            ..MockRoutine::new("failing")
        });
        assert_eq!(failing.run().await, TickStatus::Failed);

        assert_eq!(tick_count(&registry, "ok", "success"), 2);
        assert_eq!(tick_count(&registry, "failing", "failed"), 1);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let registry = Registry::new();
        let scheduler = RoutineScheduler::new(&registry).await.unwrap();

        let release = Arc::new(Notify::new());
        let routine = MockRoutine {
            release: Some(Arc::clone(&release)),
            ..MockRoutine::new("slow")
        };
        let ticks = Arc::clone(&routine.ticks);
        let runner = scheduler.runner(routine);

        let first = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run().await }
        });
        while ticks.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(runner.run().await, TickStatus::Skipped);
        release.notify_one();
        assert_eq!(first.await.unwrap(), TickStatus::Success);

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert_eq!(tick_count(&registry, "slow", "skipped"), 1);
        assert_eq!(tick_count(&registry, "slow", "success"), 1);
    }

    #[tokio::test]
    async fn test_new_rejects_double_registration() {
        let registry = Registry::new();
        let _first = RoutineScheduler::new(&registry).await.unwrap();
        let err = RoutineScheduler::new(&registry).await.unwrap_err();
        assert!(matches!(err, CollectorError::Metrics(_)));
    }
}
