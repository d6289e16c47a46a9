//! Job scheduler.
//!
//! One [`Worker`] runs one job at a time: the oldest pending sync job, or if
//! there is none the oldest pending embed job, or nothing until the next
//! poll tick. Several worker processes may share a database; ownership of a
//! job comes from the atomic claim in [`crate::jobs`], not from any lock
//! held here. While a job runs, a background task refreshes its heartbeat
//! every third of the lease so other workers never mistake it for orphaned.
//!
//! The worker is the only place that moves a job into a terminal state.
//! Components below it report per-unit failures as values and only
//! job-fatal errors come back as `Err`, which end in `FAILED` plus an
//! observer notification.

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embed::{find_unembedded, EmbeddingBatcher};
use crate::embedding::EmbeddingProvider;
use crate::jobs::{self, EmbedCounters, Recovery, SyncCounters};
use crate::materialize::{FileMaterializer, FileOutcome};
use crate::models::{EmbedJob, EmbedStatus, JobKind, Repository, SyncJob, SyncStatus};
use crate::policy::FilePolicy;
use crate::progress::{JobEvent, JobObserver, JobProgress};
use crate::rate::RateTracker;
use crate::remote::RemoteHost;
use crate::repos;
use crate::segment::{files_needing_segments, Segmenter};
use crate::tree::{ChangeSet, TreeResolver};

pub struct Worker {
    pool: SqlitePool,
    worker_id: String,
    lease_secs: u64,
    poll_interval: Duration,
    auto_embed: bool,
    resolver: TreeResolver,
    materializer: FileMaterializer,
    segmenter: Segmenter,
    provider: Arc<dyn EmbeddingProvider>,
    batcher: EmbeddingBatcher,
    observer: Arc<dyn JobObserver>,
}

impl Worker {
    pub fn new(
        pool: SqlitePool,
        config: &Config,
        remote: Arc<dyn RemoteHost>,
        provider: Arc<dyn EmbeddingProvider>,
        observer: Arc<dyn JobObserver>,
    ) -> Result<Self> {
        let rate = Arc::new(RateTracker::new(pool.clone(), &config.rate_limit));
        let policy = Arc::new(FilePolicy::from_config(&config.sync)?);

        Ok(Self {
            resolver: TreeResolver::new(remote.clone(), rate.clone(), policy.clone()),
            materializer: FileMaterializer::new(pool.clone(), remote, rate, policy),
            segmenter: Segmenter::new(config.chunking.chunk_size, config.chunking.overlap),
            batcher: EmbeddingBatcher::from_config(provider.clone(), &config.embedding),
            provider,
            observer,
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            auto_embed: config.worker.auto_embed,
            worker_id: config
                .worker
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            lease_secs: config.worker.lease_secs,
            pool,
        })
    }

    /// Id written to the jobs this worker claims.
    pub fn id(&self) -> &str {
        &self.worker_id
    }

    /// Fail jobs left active by an earlier instance of this worker, plus any
    /// job whose lease has expired. Run once at startup.
    pub async fn recover(&self) -> Result<Recovery> {
        self.recover_with(Some(&self.worker_id)).await
    }

    /// Fail only jobs whose lease has expired, whoever claimed them.
    pub async fn recover_stale(&self) -> Result<Recovery> {
        self.recover_with(None).await
    }

    async fn recover_with(&self, own_worker_id: Option<&str>) -> Result<Recovery> {
        let recovery = jobs::recover_orphans(&self.pool, self.lease_secs, own_worker_id).await?;
        if recovery.total() > 0 {
            warn!(
                sync_jobs = recovery.sync_jobs.len(),
                embed_jobs = recovery.embed_jobs.len(),
                "failed jobs orphaned by a stopped worker"
            );
        }
        for id in &recovery.sync_jobs {
            self.notify_recovered(JobKind::Sync, id).await;
        }
        for id in &recovery.embed_jobs {
            self.notify_recovered(JobKind::Embed, id).await;
        }
        Ok(recovery)
    }

    async fn notify_recovered(&self, kind: JobKind, id: &str) {
        let (repository_id, error) = match kind {
            JobKind::Sync => match jobs::get_sync_job(&self.pool, id).await {
                Ok(Some(job)) => (job.repository_id, job.error),
                _ => return,
            },
            JobKind::Embed => match jobs::get_embed_job(&self.pool, id).await {
                Ok(Some(job)) => (job.repository_id, job.error),
                _ => return,
            },
        };
        self.observer.notify(&JobEvent::Failed {
            job_id: id.to_string(),
            kind,
            repository: self.repository_label(&repository_id).await,
            error: error.unwrap_or_default(),
        });
    }

    /// Claim and run at most one job. Returns what was run.
    pub async fn tick(&self) -> Result<Option<(JobKind, String)>> {
        if let Some(job) = jobs::claim_next_sync(&self.pool, &self.worker_id).await? {
            let id = job.id.clone();
            self.run_sync_job(job).await?;
            return Ok(Some((JobKind::Sync, id)));
        }
        if let Some(job) = jobs::claim_next_embed(&self.pool, &self.worker_id).await? {
            let id = job.id.clone();
            self.run_embed_job(job).await?;
            return Ok(Some((JobKind::Embed, id)));
        }
        Ok(None)
    }

    /// Run jobs until both queues are empty. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut ran = 0;
        while self.tick().await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Recover, then poll until `shutdown` turns true. A job in flight when
    /// the signal arrives runs to completion first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;
        info!(
            worker_id = %self.worker_id,
            poll_ms = self.poll_interval.as_millis() as u64,
            lease_secs = self.lease_secs,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %format!("{:#}", e), "worker tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("worker stopped");
        Ok(())
    }

    // ============ Sync jobs ============

    /// Run a claimed sync job to a terminal state. Only an error writing
    /// that terminal state is returned.
    pub async fn run_sync_job(&self, job: SyncJob) -> Result<()> {
        let repo = match repos::get_repository(&self.pool, &job.repository_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                let err = anyhow!("repository {} no longer exists", job.repository_id);
                return self
                    .fail_job(JobKind::Sync, &job.id, &job.repository_id, &err)
                    .await;
            }
            Err(e) => {
                return self
                    .fail_job(JobKind::Sync, &job.id, &job.repository_id, &e)
                    .await
            }
        };
        let name = repo.full_name();
        info!(job_id = %job.id, repo = %name, "sync job started");

        let heartbeat = self.start_heartbeat(JobKind::Sync, &job.id);
        let result = self.execute_sync(&job, &repo).await;
        drop(heartbeat);
        match result {
            Ok(summary) => {
                if jobs::complete(&self.pool, JobKind::Sync, &job.id).await? {
                    self.observer.notify(&JobEvent::Completed {
                        job_id: job.id.clone(),
                        kind: JobKind::Sync,
                        repository: name,
                        summary,
                    });
                }
                if self.auto_embed {
                    self.enqueue_follow_up_embed(&repo).await;
                }
                Ok(())
            }
            Err(e) => self.fail_job(JobKind::Sync, &job.id, &name, &e).await,
        }
    }

    async fn execute_sync(&self, job: &SyncJob, repo: &Repository) -> Result<String> {
        let changes = self
            .resolver
            .resolve(repo, job.options.full_sync())
            .await?;

        let listed = changes.files();
        let limit = job
            .options
            .max_files
            .map(|n| (n as usize).min(listed.len()))
            .unwrap_or(listed.len());
        let limited = limit < listed.len();
        let work = &listed[..limit];
        if limited {
            info!(job_id = %job.id, listed = listed.len(), limit, "max_files limits this sync");
        }

        jobs::set_sync_total(&self.pool, &job.id, work.len() as i64).await?;
        jobs::set_sync_status(&self.pool, &job.id, SyncStatus::ProcessingFiles).await?;

        let name = repo.full_name();
        let mut counters = SyncCounters::default();
        let mut fetched = 0;
        self.sync_progress(job, &name, &counters, work.len(), None);

        for file in work {
            let outcome = self
                .materializer
                .sync_file(repo, job, changes.head_commit(), file)
                .await;
            counters.processed += 1;
            match outcome {
                FileOutcome::Fetched => fetched += 1,
                FileOutcome::Unchanged | FileOutcome::Skipped(_) => counters.skipped += 1,
                FileOutcome::Failed(_) => counters.failed += 1,
            }
            jobs::update_sync_progress(&self.pool, &job.id, &counters, Some(&file.path)).await?;
            self.sync_progress(job, &name, &counters, work.len(), Some(&file.path));
        }

        let (removed, complete_listing) = match &changes {
            ChangeSet::Full(listing) if listing.truncated => {
                warn!(repo = %name, "partial tree listing, skipping deletion of missing files");
                (0, false)
            }
            ChangeSet::Full(listing) => (
                self.materializer
                    .delete_missing(&repo.id, &listing.files)
                    .await?,
                true,
            ),
            ChangeSet::Incremental(plan) => (
                self.materializer
                    .delete_paths(&repo.id, &plan.removals)
                    .await?,
                true,
            ),
        };

        // Only a complete pass with content may move the base for the next
        // incremental diff; a metadata-only pass still owes every fetch.
        if complete_listing && !limited && counters.failed == 0 && !job.options.skip_content() {
            repos::mark_synced(&self.pool, &repo.id, changes.head_commit()).await?;
        } else {
            debug!(repo = %name, "sync incomplete, keeping previous base commit");
        }

        Ok(format!(
            "{} files: {} fetched, {} skipped, {} failed, {} removed",
            counters.processed, fetched, counters.skipped, counters.failed, removed
        ))
    }

    fn sync_progress(
        &self,
        job: &SyncJob,
        repository: &str,
        counters: &SyncCounters,
        total: usize,
        current: Option<&str>,
    ) {
        self.observer.notify(&JobEvent::Progress(JobProgress {
            job_id: job.id.clone(),
            kind: JobKind::Sync,
            repository: repository.to_string(),
            status: SyncStatus::ProcessingFiles.as_str().to_string(),
            processed: counters.processed as u64,
            total: total as u64,
            current: current.map(str::to_string),
            error: None,
        }));
    }

    /// Enqueue an embed job when the sync left anything to segment or embed.
    async fn enqueue_follow_up_embed(&self, repo: &Repository) {
        let result = async {
            let stale = !files_needing_segments(&self.pool, &repo.id).await?.is_empty();
            let unembedded = self.provider.is_enabled()
                && !find_unembedded(&self.pool, &repo.id, self.provider.model_name())
                    .await?
                    .is_empty();
            if stale || unembedded {
                let id = jobs::create_embed_job(&self.pool, &repo.id).await?;
                debug!(repo = %repo.full_name(), job_id = %id, "embed job enqueued after sync");
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(repo = %repo.full_name(), error = %e, "could not enqueue embed job");
        }
    }

    // ============ Embed jobs ============

    /// Run a claimed embed job to a terminal state.
    pub async fn run_embed_job(&self, job: EmbedJob) -> Result<()> {
        let repo = match repos::get_repository(&self.pool, &job.repository_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                let err = anyhow!("repository {} no longer exists", job.repository_id);
                return self
                    .fail_job(JobKind::Embed, &job.id, &job.repository_id, &err)
                    .await;
            }
            Err(e) => {
                return self
                    .fail_job(JobKind::Embed, &job.id, &job.repository_id, &e)
                    .await
            }
        };
        let name = repo.full_name();
        info!(job_id = %job.id, repo = %name, "embed job started");

        let heartbeat = self.start_heartbeat(JobKind::Embed, &job.id);
        let result = self.execute_embed(&job, &repo).await;
        drop(heartbeat);
        match result {
            Ok(summary) => {
                if jobs::complete(&self.pool, JobKind::Embed, &job.id).await? {
                    self.observer.notify(&JobEvent::Completed {
                        job_id: job.id.clone(),
                        kind: JobKind::Embed,
                        repository: name,
                        summary,
                    });
                }
                Ok(())
            }
            Err(e) => self.fail_job(JobKind::Embed, &job.id, &name, &e).await,
        }
    }

    async fn execute_embed(&self, job: &EmbedJob, repo: &Repository) -> Result<String> {
        let name = repo.full_name();
        let mut counters = EmbedCounters {
            files_processed: job.files_processed,
            chunks_created: job.chunks_created,
            embeddings_generated: job.embeddings_generated,
            failed_count: job.failed_count,
        };

        let stale = files_needing_segments(&self.pool, &repo.id).await?;
        for (i, file) in stale.iter().enumerate() {
            let written = self.segmenter.refresh(&self.pool, file).await?;
            counters.files_processed += 1;
            counters.chunks_created += written as i64;
            jobs::update_embed_progress(&self.pool, &job.id, &counters).await?;
            self.observer.notify(&JobEvent::Progress(JobProgress {
                job_id: job.id.clone(),
                kind: JobKind::Embed,
                repository: name.clone(),
                status: EmbedStatus::Chunking.as_str().to_string(),
                processed: (i + 1) as u64,
                total: stale.len() as u64,
                current: Some(file.path.clone()),
                error: None,
            }));
        }

        if !self.provider.is_enabled() {
            info!(job_id = %job.id, "embedding provider disabled, finishing after chunking");
            return Ok(format!(
                "{} files segmented into {} chunks, embedding disabled",
                counters.files_processed, counters.chunks_created
            ));
        }

        jobs::set_embed_status(&self.pool, &job.id, EmbedStatus::Embedding).await?;
        let pending = find_unembedded(&self.pool, &repo.id, self.provider.model_name()).await?;
        let report = self
            .batcher
            .embed(
                &self.pool,
                job,
                &name,
                &pending,
                &mut counters,
                self.observer.as_ref(),
            )
            .await?;

        Ok(format!(
            "{} files segmented into {} chunks, {} embeddings generated, {} failed in {} of {} batches",
            counters.files_processed,
            counters.chunks_created,
            report.embedded,
            report.failed_segments,
            report.failed_batches,
            report.batches
        ))
    }

    // ============ Lease ============

    /// Keep the lease on `job_id` fresh until the returned guard is dropped.
    fn start_heartbeat(&self, kind: JobKind, job_id: &str) -> Heartbeat {
        let pool = self.pool.clone();
        let worker_id = self.worker_id.clone();
        let job_id = job_id.to_string();
        let every = Duration::from_secs((self.lease_secs / 3).max(1));

        Heartbeat(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match jobs::heartbeat(&pool, kind, &job_id, &worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(%kind, job_id = %job_id, "job no longer held, heartbeat stopped");
                        break;
                    }
                    Err(e) => warn!(%kind, job_id = %job_id, error = %e, "heartbeat failed"),
                }
            }
        }))
    }

    // ============ Failure ============

    /// Record `err` as the job's terminal error and notify observers.
    async fn fail_job(
        &self,
        kind: JobKind,
        job_id: &str,
        repository: &str,
        err: &anyhow::Error,
    ) -> Result<()> {
        let message = format!("{:#}", err);
        error!(%kind, job_id, repository, error = %message, "job failed");

        if jobs::fail(&self.pool, kind, job_id, &message).await? {
            self.observer.notify(&JobEvent::Failed {
                job_id: job_id.to_string(),
                kind,
                repository: repository.to_string(),
                error: message,
            });
        }
        Ok(())
    }

    async fn repository_label(&self, repository_id: &str) -> String {
        match repos::get_repository(&self.pool, repository_id).await {
            Ok(Some(repo)) => repo.full_name(),
            _ => repository_id.to_string(),
        }
    }
}

/// Aborts the heartbeat task on drop.
struct Heartbeat(JoinHandle<()>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}
