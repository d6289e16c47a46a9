//! Durable job queue.
//!
//! Sync and embed jobs live in SQLite and move through their state machines
//! only through the functions here:
//!
//! - **Creation** is idempotent per repository: if a non-terminal job
//!   exists its id is returned instead of inserting a new row. A partial
//!   unique index backs this up across processes; losing the insert race
//!   falls back to reading the winner's id.
//! - **Claiming** moves the oldest `PENDING` job to its first active state
//!   with a conditional `UPDATE`. Only the worker whose update touched the
//!   row owns the job; its id and a heartbeat timestamp are stored on the
//!   row. Status and progress updates refresh the heartbeat, and
//!   [`heartbeat`] refreshes it between them.
//! - **Every** later transition is guarded with
//!   `status NOT IN ('COMPLETED','FAILED')`, so terminal jobs are never
//!   mutated again.
//! - **Recovery** fails active jobs whose lease lapsed (no heartbeat for
//!   `lease_secs`), or that were claimed under the recovering worker's own
//!   id by an earlier instance. Jobs held by live workers are left alone.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{EmbedJob, EmbedStatus, JobKind, SyncJob, SyncOptions, SyncStatus};

const TERMINAL: &str = "('COMPLETED', 'FAILED')";

fn table(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Sync => "sync_jobs",
        JobKind::Embed => "embed_jobs",
    }
}

/// Per-file counters of a sync job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub processed: i64,
    pub skipped: i64,
    pub failed: i64,
}

/// Counters of an embed job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedCounters {
    pub files_processed: i64,
    pub chunks_created: i64,
    pub embeddings_generated: i64,
    pub failed_count: i64,
}

/// Jobs failed by [`recover_orphans`].
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    pub sync_jobs: Vec<String>,
    pub embed_jobs: Vec<String>,
}

impl Recovery {
    pub fn total(&self) -> usize {
        self.sync_jobs.len() + self.embed_jobs.len()
    }
}

fn row_to_sync_job(row: &SqliteRow) -> Result<SyncJob> {
    let status: String = row.get("status");
    let max_files: Option<i64> = row.get("max_files");
    Ok(SyncJob {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        status: status.parse()?,
        total_files: row.get("total_files"),
        processed_files: row.get("processed_files"),
        skipped_files: row.get("skipped_files"),
        failed_files: row.get("failed_files"),
        current_file: row.get("current_file"),
        options: SyncOptions {
            max_files: max_files.map(|n| n.clamp(0, u32::MAX as i64) as u32),
            skip_content: row.get("skip_content"),
            full_sync: row.get("full_sync"),
        },
        worker_id: row.get("worker_id"),
        heartbeat_at: row.get("heartbeat_at"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: row.get("error"),
    })
}

fn row_to_embed_job(row: &SqliteRow) -> Result<EmbedJob> {
    let status: String = row.get("status");
    Ok(EmbedJob {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        status: status.parse()?,
        files_processed: row.get("files_processed"),
        chunks_created: row.get("chunks_created"),
        embeddings_generated: row.get("embeddings_generated"),
        failed_count: row.get("failed_count"),
        worker_id: row.get("worker_id"),
        heartbeat_at: row.get("heartbeat_at"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: row.get("error"),
    })
}

async fn active_job_id(
    pool: &SqlitePool,
    kind: JobKind,
    repository_id: &str,
) -> Result<Option<String>> {
    let sql = format!(
        "SELECT id FROM {} WHERE repository_id = ? AND status NOT IN {} LIMIT 1",
        table(kind),
        TERMINAL
    );
    Ok(sqlx::query_scalar(&sql)
        .bind(repository_id)
        .fetch_optional(pool)
        .await?)
}

/// Resolve an insert that lost the race against another creator.
async fn existing_after_conflict(
    pool: &SqlitePool,
    kind: JobKind,
    repository_id: &str,
    err: sqlx::Error,
) -> Result<String> {
    let is_unique = matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation());
    if !is_unique {
        return Err(err.into());
    }
    match active_job_id(pool, kind, repository_id).await? {
        Some(id) => Ok(id),
        None => bail!(
            "{} job for repository {} conflicted but no active job exists",
            kind,
            repository_id
        ),
    }
}

/// Enqueue a sync job, or return the id of the repository's active one.
pub async fn create_sync_job(
    pool: &SqlitePool,
    repository_id: &str,
    options: &SyncOptions,
) -> Result<String> {
    if let Some(id) = active_job_id(pool, JobKind::Sync, repository_id).await? {
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        r#"
        INSERT INTO sync_jobs (id, repository_id, status, max_files, skip_content, full_sync, created_at)
        VALUES (?, ?, 'PENDING', ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(repository_id)
    .bind(options.max_files.map(i64::from))
    .bind(options.skip_content)
    .bind(options.full_sync)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => Ok(id),
        Err(e) => existing_after_conflict(pool, JobKind::Sync, repository_id, e).await,
    }
}

/// Enqueue an embed job, or return the id of the repository's active one.
pub async fn create_embed_job(pool: &SqlitePool, repository_id: &str) -> Result<String> {
    if let Some(id) = active_job_id(pool, JobKind::Embed, repository_id).await? {
        return Ok(id);
    }

    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO embed_jobs (id, repository_id, status, created_at) VALUES (?, ?, 'PENDING', ?)",
    )
    .bind(&id)
    .bind(repository_id)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => Ok(id),
        Err(e) => existing_after_conflict(pool, JobKind::Embed, repository_id, e).await,
    }
}

/// Atomically move the oldest pending job of `kind` to `first_status` on
/// behalf of `worker_id`. Returns its id, or `None` when the queue is empty.
async fn claim_next(
    pool: &SqlitePool,
    kind: JobKind,
    first_status: &str,
    worker_id: &str,
) -> Result<Option<String>> {
    let select = format!(
        "SELECT id FROM {} WHERE status = 'PENDING' ORDER BY created_at, rowid LIMIT 1",
        table(kind)
    );
    let update = format!(
        r#"
        UPDATE {} SET status = ?, started_at = ?, worker_id = ?, heartbeat_at = ?
        WHERE id = ? AND status = 'PENDING'
        "#,
        table(kind)
    );

    loop {
        let candidate: Option<String> = sqlx::query_scalar(&select).fetch_optional(pool).await?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let now = Utc::now().timestamp();
        let claimed = sqlx::query(&update)
            .bind(first_status)
            .bind(now)
            .bind(worker_id)
            .bind(now)
            .bind(&id)
            .execute(pool)
            .await?
            .rows_affected();

        if claimed == 1 {
            return Ok(Some(id));
        }
        // Another worker claimed it first; look again.
    }
}

/// Claim the oldest pending sync job (now `FETCHING_TREE`).
pub async fn claim_next_sync(pool: &SqlitePool, worker_id: &str) -> Result<Option<SyncJob>> {
    let first = SyncStatus::FetchingTree.as_str();
    match claim_next(pool, JobKind::Sync, first, worker_id).await? {
        Some(id) => get_sync_job(pool, &id).await,
        None => Ok(None),
    }
}

/// Claim the oldest pending embed job (now `CHUNKING`).
pub async fn claim_next_embed(pool: &SqlitePool, worker_id: &str) -> Result<Option<EmbedJob>> {
    let first = EmbedStatus::Chunking.as_str();
    match claim_next(pool, JobKind::Embed, first, worker_id).await? {
        Some(id) => get_embed_job(pool, &id).await,
        None => Ok(None),
    }
}

async fn set_status(pool: &SqlitePool, kind: JobKind, id: &str, status: &str) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET status = ?, heartbeat_at = ? WHERE id = ? AND status NOT IN {}",
        table(kind),
        TERMINAL
    );
    let updated = sqlx::query(&sql)
        .bind(status)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if updated != 1 {
        bail!("{} job {} is terminal or missing, cannot move to {}", kind, id, status);
    }
    Ok(())
}

pub async fn set_sync_status(pool: &SqlitePool, id: &str, status: SyncStatus) -> Result<()> {
    set_status(pool, JobKind::Sync, id, status.as_str()).await
}

pub async fn set_embed_status(pool: &SqlitePool, id: &str, status: EmbedStatus) -> Result<()> {
    set_status(pool, JobKind::Embed, id, status.as_str()).await
}

pub async fn set_sync_total(pool: &SqlitePool, id: &str, total: i64) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE sync_jobs SET total_files = ? WHERE id = ? AND status NOT IN {}",
        TERMINAL
    ))
    .bind(total)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_sync_progress(
    pool: &SqlitePool,
    id: &str,
    counters: &SyncCounters,
    current_file: Option<&str>,
) -> Result<()> {
    sqlx::query(&format!(
        r#"
        UPDATE sync_jobs
        SET processed_files = ?, skipped_files = ?, failed_files = ?, current_file = ?,
            heartbeat_at = ?
        WHERE id = ? AND status NOT IN {}
        "#,
        TERMINAL
    ))
    .bind(counters.processed)
    .bind(counters.skipped)
    .bind(counters.failed)
    .bind(current_file)
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_embed_progress(
    pool: &SqlitePool,
    id: &str,
    counters: &EmbedCounters,
) -> Result<()> {
    sqlx::query(&format!(
        r#"
        UPDATE embed_jobs
        SET files_processed = ?, chunks_created = ?, embeddings_generated = ?, failed_count = ?,
            heartbeat_at = ?
        WHERE id = ? AND status NOT IN {}
        "#,
        TERMINAL
    ))
    .bind(counters.files_processed)
    .bind(counters.chunks_created)
    .bind(counters.embeddings_generated)
    .bind(counters.failed_count)
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Refresh the lease of a job `worker_id` still holds. Returns `false` once
/// the job is terminal or owned by someone else.
pub async fn heartbeat(
    pool: &SqlitePool,
    kind: JobKind,
    id: &str,
    worker_id: &str,
) -> Result<bool> {
    let sql = format!(
        "UPDATE {} SET heartbeat_at = ? WHERE id = ? AND worker_id = ? AND status NOT IN {}",
        table(kind),
        TERMINAL
    );
    let updated = sqlx::query(&sql)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(worker_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(updated == 1)
}

/// Mark a job `COMPLETED`. Returns `false` if it was already terminal.
pub async fn complete(pool: &SqlitePool, kind: JobKind, id: &str) -> Result<bool> {
    let clear_current = match kind {
        JobKind::Sync => ", current_file = NULL",
        JobKind::Embed => "",
    };
    let sql = format!(
        "UPDATE {} SET status = 'COMPLETED', completed_at = ?{} WHERE id = ? AND status NOT IN {}",
        table(kind),
        clear_current,
        TERMINAL
    );
    let updated = sqlx::query(&sql)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        warn!(%kind, job_id = id, "job already terminal, not completing");
    }
    Ok(updated == 1)
}

/// Mark a job `FAILED` with `error`. Returns `false` if it was already
/// terminal.
pub async fn fail(pool: &SqlitePool, kind: JobKind, id: &str, error: &str) -> Result<bool> {
    let sql = format!(
        "UPDATE {} SET status = 'FAILED', completed_at = ?, error = ? WHERE id = ? AND status NOT IN {}",
        table(kind),
        TERMINAL
    );
    let updated = sqlx::query(&sql)
        .bind(Utc::now().timestamp())
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(updated == 1)
}

/// Fail active jobs whose worker is gone: the heartbeat is older than
/// `lease_secs` (or missing), or the job was claimed under `own_worker_id`,
/// meaning an earlier instance of the recovering worker died holding it.
pub async fn recover_orphans(
    pool: &SqlitePool,
    lease_secs: u64,
    own_worker_id: Option<&str>,
) -> Result<Recovery> {
    let mut recovery = Recovery::default();
    let now = Utc::now().timestamp();
    let expired_before = now.saturating_sub(i64::try_from(lease_secs).unwrap_or(i64::MAX));
    let orphaned = "(heartbeat_at IS NULL OR heartbeat_at < ? OR worker_id = ?)";

    for (kind, active) in [
        (
            JobKind::Sync,
            [SyncStatus::FetchingTree.as_str(), SyncStatus::ProcessingFiles.as_str()],
        ),
        (
            JobKind::Embed,
            [EmbedStatus::Chunking.as_str(), EmbedStatus::Embedding.as_str()],
        ),
    ] {
        let select = format!(
            "SELECT id, status, worker_id FROM {} WHERE status IN (?, ?) AND {}",
            table(kind),
            orphaned
        );
        let rows = sqlx::query(&select)
            .bind(active[0])
            .bind(active[1])
            .bind(expired_before)
            .bind(own_worker_id)
            .fetch_all(pool)
            .await?;

        // Re-checked on update so a heartbeat landing in between wins.
        let update = format!(
            r#"
            UPDATE {} SET status = 'FAILED', completed_at = ?, error = ?
            WHERE id = ? AND status = ? AND {}
            "#,
            table(kind),
            orphaned
        );
        for row in rows {
            let id: String = row.get("id");
            let status: String = row.get("status");
            let owner: Option<String> = row.get("worker_id");
            let message = format!(
                "worker {} stopped while {}; enqueue the job again to retry",
                owner.as_deref().unwrap_or("(unknown)"),
                status
            );
            let updated = sqlx::query(&update)
                .bind(now)
                .bind(&message)
                .bind(&id)
                .bind(&status)
                .bind(expired_before)
                .bind(own_worker_id)
                .execute(pool)
                .await?
                .rows_affected();
            if updated == 1 {
                info!(%kind, job_id = %id, %status, owner = ?owner, "recovered orphaned job");
                match kind {
                    JobKind::Sync => recovery.sync_jobs.push(id),
                    JobKind::Embed => recovery.embed_jobs.push(id),
                }
            }
        }
    }

    Ok(recovery)
}

pub async fn get_sync_job(pool: &SqlitePool, id: &str) -> Result<Option<SyncJob>> {
    let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_sync_job).transpose()
}

pub async fn get_embed_job(pool: &SqlitePool, id: &str) -> Result<Option<EmbedJob>> {
    let row = sqlx::query("SELECT * FROM embed_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_embed_job).transpose()
}

pub async fn latest_sync_job(pool: &SqlitePool, repository_id: &str) -> Result<Option<SyncJob>> {
    let row = sqlx::query(
        "SELECT * FROM sync_jobs WHERE repository_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
    )
    .bind(repository_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_sync_job).transpose()
}

pub async fn latest_embed_job(pool: &SqlitePool, repository_id: &str) -> Result<Option<EmbedJob>> {
    let row = sqlx::query(
        "SELECT * FROM embed_jobs WHERE repository_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
    )
    .bind(repository_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_embed_job).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::repos;

    async fn setup() -> (tempfile::TempDir, SqlitePool, String) {
        let (tmp, pool) = test_pool().await;
        let repo = repos::add_repository(&pool, "acme", "widgets", "main", "default")
            .await
            .unwrap();
        (tmp, pool, repo.id)
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creation_is_idempotent_while_active() {
        let (_tmp, pool, repo) = setup().await;
        let first = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        let second = create_sync_job(
            &pool,
            &repo,
            &SyncOptions {
                max_files: Some(5),
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(first, second);
        assert_eq!(count(&pool, "sync_jobs").await, 1);

        let e1 = create_embed_job(&pool, &repo).await.unwrap();
        let e2 = create_embed_job(&pool, &repo).await.unwrap();
        assert_eq!(e1, e2);
        assert_eq!(count(&pool, "embed_jobs").await, 1);
    }

    #[tokio::test]
    async fn terminal_job_allows_a_new_one() {
        let (_tmp, pool, repo) = setup().await;
        let first = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        assert!(fail(&pool, JobKind::Sync, &first, "boom").await.unwrap());
        let second = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn unique_index_rejects_second_active_row() {
        let (_tmp, pool, repo) = setup().await;
        create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        let raw = sqlx::query(
            "INSERT INTO sync_jobs (id, repository_id, status, created_at) VALUES ('x', ?, 'PENDING', 0)",
        )
        .bind(&repo)
        .execute(&pool)
        .await;
        let err = raw.unwrap_err();
        let id = existing_after_conflict(&pool, JobKind::Sync, &repo, err)
            .await
            .unwrap();
        assert_ne!(id, "x");
    }

    #[tokio::test]
    async fn options_roundtrip_through_the_row() {
        let (_tmp, pool, repo) = setup().await;
        let options = SyncOptions {
            max_files: Some(10),
            skip_content: Some(true),
            full_sync: None,
        };
        let id = create_sync_job(&pool, &repo, &options).await.unwrap();
        let job = get_sync_job(&pool, &id).await.unwrap().unwrap();
        assert_eq!(job.options, options);
        assert_eq!(job.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn claim_is_single_owner() {
        let (_tmp, pool, repo) = setup().await;
        let id = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();

        let claimed = claim_next_sync(&pool, "w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, SyncStatus::FetchingTree);
        assert!(claimed.started_at.is_some());
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(claimed.heartbeat_at.is_some());
        assert!(claim_next_sync(&pool, "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_takes_oldest_first() {
        let (_tmp, pool, repo_a) = setup().await;
        let repo_b = repos::add_repository(&pool, "acme", "gadgets", "main", "default")
            .await
            .unwrap()
            .id;
        let a = create_embed_job(&pool, &repo_a).await.unwrap();
        let b = create_embed_job(&pool, &repo_b).await.unwrap();
        sqlx::query("UPDATE embed_jobs SET created_at = 100 WHERE id = ?")
            .bind(&a)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE embed_jobs SET created_at = 50 WHERE id = ?")
            .bind(&b)
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(claim_next_embed(&pool, "w1").await.unwrap().unwrap().id, b);
        assert_eq!(claim_next_embed(&pool, "w1").await.unwrap().unwrap().id, a);
    }

    #[tokio::test]
    async fn terminal_jobs_are_frozen() {
        let (_tmp, pool, repo) = setup().await;
        let id = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        claim_next_sync(&pool, "w1").await.unwrap();
        assert!(complete(&pool, JobKind::Sync, &id).await.unwrap());

        assert!(!complete(&pool, JobKind::Sync, &id).await.unwrap());
        assert!(!fail(&pool, JobKind::Sync, &id, "late").await.unwrap());
        assert!(set_sync_status(&pool, &id, SyncStatus::ProcessingFiles)
            .await
            .is_err());
        update_sync_progress(
            &pool,
            &id,
            &SyncCounters {
                processed: 99,
                ..SyncCounters::default()
            },
            None,
        )
        .await
        .unwrap();

        let job = get_sync_job(&pool, &id).await.unwrap().unwrap();
        assert_eq!(job.status, SyncStatus::Completed);
        assert_eq!(job.processed_files, 0);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn recovery_fails_active_jobs_only() {
        let (_tmp, pool, repo) = setup().await;
        let other = repos::add_repository(&pool, "acme", "gadgets", "main", "default")
            .await
            .unwrap()
            .id;

        let running = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        claim_next_sync(&pool, "w1").await.unwrap();
        set_sync_status(&pool, &running, SyncStatus::ProcessingFiles)
            .await
            .unwrap();
        let pending = create_sync_job(&pool, &other, &SyncOptions::default())
            .await
            .unwrap();
        let embedding = create_embed_job(&pool, &repo).await.unwrap();
        claim_next_embed(&pool, "w1").await.unwrap();
        set_embed_status(&pool, &embedding, EmbedStatus::Embedding)
            .await
            .unwrap();

        let recovery = recover_orphans(&pool, 60, Some("w1")).await.unwrap();
        assert_eq!(recovery.sync_jobs, vec![running.clone()]);
        assert_eq!(recovery.embed_jobs, vec![embedding.clone()]);
        assert_eq!(recovery.total(), 2);

        let job = get_sync_job(&pool, &running).await.unwrap().unwrap();
        assert_eq!(job.status, SyncStatus::Failed);
        let error = job.error.unwrap();
        assert!(error.contains("PROCESSING_FILES"));
        assert!(error.contains("w1"));
        let job = get_embed_job(&pool, &embedding).await.unwrap().unwrap();
        assert_eq!(job.status, EmbedStatus::Failed);
        assert!(job.error.is_some());
        let job = get_sync_job(&pool, &pending).await.unwrap().unwrap();
        assert_eq!(job.status, SyncStatus::Pending);

        assert_eq!(recover_orphans(&pool, 60, Some("w1")).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn recovery_spares_jobs_with_a_live_lease() {
        let (_tmp, pool, repo) = setup().await;
        let id = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        claim_next_sync(&pool, "worker-a").await.unwrap();

        let recovery = recover_orphans(&pool, 60, Some("worker-b")).await.unwrap();
        assert_eq!(recovery.total(), 0);
        let job = get_sync_job(&pool, &id).await.unwrap().unwrap();
        assert_eq!(job.status, SyncStatus::FetchingTree);
        assert!(job.error.is_none());
        assert_eq!(recover_orphans(&pool, 60, None).await.unwrap().total(), 0);

        sqlx::query("UPDATE sync_jobs SET heartbeat_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp() - 120)
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();
        let recovery = recover_orphans(&pool, 60, Some("worker-b")).await.unwrap();
        assert_eq!(recovery.sync_jobs, vec![id.clone()]);
        let job = get_sync_job(&pool, &id).await.unwrap().unwrap();
        assert_eq!(job.status, SyncStatus::Failed);
        assert!(job.error.unwrap().contains("worker-a"));
    }

    #[tokio::test]
    async fn heartbeat_only_touches_owned_active_jobs() {
        let (_tmp, pool, repo) = setup().await;
        let id = create_embed_job(&pool, &repo).await.unwrap();
        assert!(!heartbeat(&pool, JobKind::Embed, &id, "w1").await.unwrap());

        claim_next_embed(&pool, "w1").await.unwrap();
        sqlx::query("UPDATE embed_jobs SET heartbeat_at = 0 WHERE id = ?")
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(!heartbeat(&pool, JobKind::Embed, &id, "w2").await.unwrap());
        assert_eq!(
            get_embed_job(&pool, &id).await.unwrap().unwrap().heartbeat_at,
            Some(0)
        );

        assert!(heartbeat(&pool, JobKind::Embed, &id, "w1").await.unwrap());
        let beat = get_embed_job(&pool, &id).await.unwrap().unwrap().heartbeat_at;
        assert!(beat.unwrap() > 0);

        complete(&pool, JobKind::Embed, &id).await.unwrap();
        assert!(!heartbeat(&pool, JobKind::Embed, &id, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn latest_job_for_repo() {
        let (_tmp, pool, repo) = setup().await;
        assert!(latest_sync_job(&pool, &repo).await.unwrap().is_none());
        let first = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        fail(&pool, JobKind::Sync, &first, "x").await.unwrap();
        let second = create_sync_job(&pool, &repo, &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(
            latest_sync_job(&pool, &repo).await.unwrap().unwrap().id,
            second
        );
        assert!(latest_embed_job(&pool, &repo).await.unwrap().is_none());
    }
}
