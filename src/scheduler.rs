//! Periodic background jobs: migration cycles and health runs.
//!
//! The store and monitor stay synchronous; each tick runs the job on the
//! blocking pool with a child of the scheduler's cancellation token, so
//! [`Scheduler::shutdown`] interrupts a cycle in flight and the cycle returns
//! its partial report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::health::{HealthMonitor, HealthReport};
use crate::memory::tiered::{MigrationReport, TieredStore};

type Latest<T> = Arc<Mutex<Option<T>>>;

pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    latest_migration: Latest<MigrationReport>,
    latest_health: Latest<HealthReport>,
}

impl Scheduler {
    /// Spawn both jobs at the configured intervals. Must be called inside a
    /// Tokio runtime. A disabled scheduler spawns nothing.
    pub fn start(
        store: Arc<TieredStore>,
        monitor: Arc<HealthMonitor>,
        config: &SchedulerConfig,
    ) -> Self {
        if !config.enabled {
            tracing::info!("scheduler disabled");
            return Self::idle();
        }
        Self::start_with(
            store,
            monitor,
            Duration::from_secs(config.migration_interval_secs.max(1)),
            Duration::from_secs(config.health_interval_secs.max(1)),
        )
    }

    /// Spawn both jobs with explicit intervals. Each job runs once immediately.
    pub fn start_with(
        store: Arc<TieredStore>,
        monitor: Arc<HealthMonitor>,
        migration_every: Duration,
        health_every: Duration,
    ) -> Self {
        let mut scheduler = Self::idle();

        scheduler.tasks.push(spawn_job(
            "migration",
            migration_every,
            scheduler.cancel.clone(),
            Arc::clone(&scheduler.latest_migration),
            move |cancel| store.migrate(cancel),
        ));
        scheduler.tasks.push(spawn_job(
            "health",
            health_every,
            scheduler.cancel.clone(),
            Arc::clone(&scheduler.latest_health),
            move |cancel| monitor.run(cancel),
        ));

        tracing::info!(
            migration_every_secs = migration_every.as_secs_f64(),
            health_every_secs = health_every.as_secs_f64(),
            "scheduler started"
        );
        scheduler
    }

    fn idle() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            latest_migration: Arc::new(Mutex::new(None)),
            latest_health: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && !self.cancel.is_cancelled()
    }

    pub fn latest_migration(&self) -> Option<MigrationReport> {
        self.latest_migration.lock().ok().and_then(|r| r.clone())
    }

    pub fn latest_health(&self) -> Option<HealthReport> {
        self.latest_health.lock().ok().and_then(|r| r.clone())
    }

    /// Cancel every job and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "scheduled task ended abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_job<T, F>(
    name: &'static str,
    every: Duration,
    cancel: CancellationToken,
    latest: Latest<T>,
    job: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(&CancellationToken) -> T + Send + Sync + 'static,
{
    let job = Arc::new(job);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let child = cancel.child_token();
            let job = Arc::clone(&job);
            match tokio::task::spawn_blocking(move || job(&child)).await {
                Ok(report) => {
                    if let Ok(mut slot) = latest.lock() {
                        *slot = Some(report);
                    }
                    tracing::debug!(job = name, "scheduled job finished");
                }
                Err(e) => tracing::error!(job = name, error = %e, "scheduled job panicked"),
            }
        }
        tracing::debug!(job = name, "scheduled job stopped");
    })
}
