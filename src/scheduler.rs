//! Background vulnerability scanning.
//!
//! A ticker looks for due scan policies once a minute and fans their images out
//! onto a bounded job queue. A fixed pool of workers drains the queue, runs the
//! scanner and records results. Enqueueing waits at most `enqueue_timeout`; a
//! job that still does not fit is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::models::{ScanPolicy, ScanStatus, VulnerabilityScan};
use crate::registry::RegistryConnector;
use crate::retention::compile_pattern;
use crate::scanner::{error_payload, has_other_results, merge_scan_data, Scanner};
use crate::store::PolicyStore;

const FAILED_SUMMARY: &str = r#"{"Unknown":0}"#;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub tick: Duration,
    pub enqueue_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 100,
            tick: Duration::from_secs(60),
            enqueue_timeout: Duration::from_secs(2),
        }
    }
}

/// One image to scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub registry_url: String,
    pub registry_id: i64,
    pub repo: String,
    pub tag: String,
    /// Manifest digest, when it was resolved before queueing
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// The queue stayed full for the whole enqueue timeout
    Dropped,
    /// The scheduler has been stopped
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Draining,
}

struct Shared {
    store: Arc<dyn PolicyStore>,
    connector: Arc<dyn RegistryConnector>,
    scanner: Arc<dyn Scanner>,
    config: SchedulerConfig,
    jobs: mpsc::Sender<ScanJob>,
    queue: Mutex<mpsc::Receiver<ScanJob>>,
    closing: CancellationToken,
    queued_total: AtomicUsize,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    ticker_shutdown: CancellationToken,
    state: SchedulerState,
    started: bool,
    ticker: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        connector: Arc<dyn RegistryConnector>,
        scanner: Arc<dyn Scanner>,
        config: SchedulerConfig,
    ) -> Self {
        let (jobs, queue) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                store,
                connector,
                scanner,
                config,
                jobs,
                queue: Mutex::new(queue),
                closing: CancellationToken::new(),
                queued_total: AtomicUsize::new(0),
            }),
            ticker_shutdown: CancellationToken::new(),
            state: SchedulerState::Stopped,
            started: false,
            ticker: None,
            workers: Vec::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Jobs accepted onto the queue since construction
    pub fn queued_total(&self) -> usize {
        self.shared.queued_total.load(Ordering::SeqCst)
    }

    /// Spawn the worker pool and the policy ticker. A scheduler runs once.
    pub fn start(&mut self) -> Result<()> {
        self.start_workers()?;
        self.ticker = Some(tokio::spawn(run_ticker(
            self.shared.clone(),
            self.ticker_shutdown.clone(),
        )));
        info!(
            "Scan scheduler started with {} workers",
            self.shared.config.workers.max(1)
        );
        Ok(())
    }

    /// Spawn only the worker pool. Jobs then arrive through [`Scheduler::submit`]
    /// and [`Scheduler::dispatch`].
    pub fn start_workers(&mut self) -> Result<()> {
        if self.started {
            let state = match self.state {
                SchedulerState::Stopped => "stopped",
                SchedulerState::Running => "running",
                SchedulerState::Draining => "draining",
            };
            return Err(AppError::SchedulerState(state.to_string()).into());
        }
        self.started = true;

        for id in 0..self.shared.config.workers.max(1) {
            self.workers
                .push(tokio::spawn(worker(self.shared.clone(), id)));
        }
        self.state = SchedulerState::Running;
        Ok(())
    }

    /// Stop the ticker, close the queue and wait for workers to drain it.
    /// Scans already running are allowed to finish.
    pub async fn stop(&mut self) {
        self.state = SchedulerState::Draining;
        self.ticker_shutdown.cancel();
        self.shared.closing.cancel();
        self.shared.queue.lock().await.close();

        if let Some(ticker) = self.ticker.take() {
            if let Err(e) = ticker.await {
                warn!("Scheduler ticker ended abnormally: {}", e);
            }
        }
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!("Scan worker ended abnormally: {}", e);
            }
        }

        self.state = SchedulerState::Stopped;
        info!("Scan scheduler stopped");
    }

    /// Queue a single image, e.g. for an on-demand rescan
    pub async fn submit(&self, job: ScanJob) -> Enqueued {
        self.shared.enqueue(job).await
    }

    /// Trigger every due policy; returns the ids of the triggered policies.
    pub async fn check_schedules(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        self.shared.check_schedules(now).await
    }

    /// Enumerate and queue the images selected by `policy`; returns the number queued.
    pub async fn dispatch(&self, policy: &ScanPolicy) -> Result<usize> {
        self.shared.dispatch(policy).await
    }
}

impl Shared {
    async fn enqueue(&self, job: ScanJob) -> Enqueued {
        match self
            .jobs
            .send_timeout(job, self.config.enqueue_timeout)
            .await
        {
            Ok(()) => {
                self.queued_total.fetch_add(1, Ordering::SeqCst);
                Enqueued::Queued
            }
            Err(SendTimeoutError::Timeout(job)) => {
                warn!(
                    "Scan job queue full, skipping {}:{}",
                    job.repo, job.tag
                );
                Enqueued::Dropped
            }
            Err(SendTimeoutError::Closed(_)) => Enqueued::Closed,
        }
    }

    async fn check_schedules(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let policies = self
            .store
            .list_enabled_scan_policies()
            .await
            .context("Failed to load scan policies")?;

        let mut triggered = Vec::new();

        for policy in policies.into_iter().filter(|p| p.is_due(now)) {
            info!("Triggering scheduled scan for registry {}", policy.registry_id);

            // Record the next run before enumerating so the next tick skips it
            let next = now + policy.interval();
            if let Err(e) = self.store.update_policy_run_time(policy.id, now, next).await {
                error!(
                    "Failed to record run time for scan policy {}: {:#}",
                    policy.id, e
                );
                continue;
            }
            triggered.push(policy.id);

            let shared = self.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.dispatch(&policy).await {
                    error!(
                        "Scheduled scan for registry {} failed: {:#}",
                        policy.registry_id, e
                    );
                }
            });
        }

        Ok(triggered)
    }

    async fn dispatch(&self, policy: &ScanPolicy) -> Result<usize> {
        let registry = self.store.get_registry(policy.registry_id).await?;
        let access = self.connector.connect(&registry)?;

        let filter_repos = match compile_pattern("filter_repos", policy.filter_repos.as_deref(), true)
        {
            Ok(re) => re,
            Err(e) => {
                warn!("Scan policy {}: {}", policy.id, e);
                return Ok(0);
            }
        };
        let filter_tags = match compile_pattern("filter_tags", policy.filter_tags.as_deref(), true) {
            Ok(re) => re,
            Err(e) => {
                warn!("Scan policy {}: {}", policy.id, e);
                return Ok(0);
            }
        };

        let repos = access
            .list_repositories()
            .await
            .with_context(|| format!("Failed to list repositories of registry {}", registry.id))?;

        let mut count = 0;

        'repos: for repo in repos {
            if filter_repos.as_ref().is_some_and(|re| !re.is_match(&repo)) {
                continue;
            }

            let tags = match access.list_tags(&repo).await {
                Ok(tags) => tags,
                Err(e) => {
                    warn!("Failed to list tags for {}: {:#}", repo, e);
                    continue;
                }
            };

            for tag in tags {
                if filter_tags.as_ref().is_some_and(|re| !re.is_match(&tag)) {
                    continue;
                }

                let digest = match access.get_digest_for_tag(&repo, &tag).await {
                    Ok(digest) => Some(digest),
                    Err(e) => {
                        debug!("No digest for {}:{}: {:#}", repo, tag, e);
                        None
                    }
                };
                let job = ScanJob {
                    registry_url: registry.url.clone(),
                    registry_id: registry.id,
                    repo: repo.clone(),
                    tag,
                    digest,
                };
                match self.enqueue(job).await {
                    Enqueued::Queued => count += 1,
                    Enqueued::Dropped => {}
                    Enqueued::Closed => {
                        warn!("Scheduler stopped while queueing registry {}", registry.id);
                        break 'repos;
                    }
                }
            }
        }

        info!("Queued {} images for registry {}", count, registry.id);
        Ok(count)
    }

    async fn next_job(&self) -> Option<ScanJob> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            job = queue.recv() => job,
            _ = self.closing.cancelled() => {
                queue.close();
                queue.recv().await
            }
        }
    }
}

async fn run_ticker(shared: Arc<Shared>, shutdown: CancellationToken) {
    let tick = shared.config.tick;
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = shared.check_schedules(Utc::now()).await {
                    error!("Scheduler store error: {:#}", e);
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn worker(shared: Arc<Shared>, id: usize) {
    debug!("Scan worker {} started", id);
    while let Some(job) = shared.next_job().await {
        if let Err(e) = execute_job(shared.store.as_ref(), shared.scanner.as_ref(), &job).await {
            error!(
                "Scan worker {}: {}:{} not recorded: {:#}",
                id, job.repo, job.tag, e
            );
        }
    }
    debug!("Scan worker {} exiting", id);
}

/// Scan one image and record the outcome, merging it with results other
/// scanners already stored for the same image.
pub async fn execute_job(
    store: &dyn PolicyStore,
    scanner: &dyn Scanner,
    job: &ScanJob,
) -> Result<VulnerabilityScan> {
    let mut scan = VulnerabilityScan::start(job.registry_id, &job.repo, &job.tag);
    match store.get_scan(job.registry_id, &job.repo, &job.tag).await {
        Ok(Some(previous)) => {
            scan.digest = previous.digest;
            scan.report = previous.report;
            scan.summary = previous.summary;
        }
        Ok(None) => {}
        Err(e) => warn!(
            "Could not load previous scan of {}:{}: {:#}",
            job.repo, job.tag, e
        ),
    }
    if let Some(digest) = &job.digest {
        scan.digest = digest.clone();
    }

    scan.id = store
        .upsert_scan(&scan)
        .await
        .context("Failed to record scan start")?;

    let name = scanner.name();
    match scanner.scan(&job.registry_url, &job.repo, &job.tag).await {
        Ok(output) => {
            scan.status = ScanStatus::Completed;
            scan.report = merge_scan_data(&scan.report, name, &output.report);
            scan.summary = merge_scan_data(&scan.summary, name, &output.summary);
        }
        Err(e) => {
            warn!("Scan of {}:{} with {} failed: {:#}", job.repo, job.tag, name, e);
            scan.status = if has_other_results(&scan.report, name) {
                ScanStatus::Completed
            } else {
                ScanStatus::Failed
            };
            scan.report = merge_scan_data(&scan.report, name, &error_payload(&e));
            scan.summary = merge_scan_data(&scan.summary, name, FAILED_SUMMARY);
        }
    }
    scan.scanned_at = Utc::now();

    store
        .upsert_scan(&scan)
        .await
        .context("Failed to record scan result")?;
    Ok(scan)
}
