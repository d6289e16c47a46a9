//! File materialization: bring one mirrored file up to date.
//!
//! [`FileMaterializer::sync_file`] compares the stored fingerprint with the
//! listed one and only talks to the remote host when they differ. Files the
//! policy excludes from content fetch (oversized, minified/generated, binary)
//! are still tracked, with `content = NULL` and a skip reason.
//!
//! Outcomes are reported as a [`FileOutcome`] rather than an error so the
//! caller can count them uniformly and carry on with the next file.
//!
//! Deletions are computed as a set difference against the stored paths and
//! applied in a single transaction.

use anyhow::{bail, Result};
use base64::Engine;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::models::{FileRecord, Repository, SyncJob};
use crate::policy::{detect_language, FilePolicy};
use crate::rate::RateTracker;
use crate::remote::{FileContent, RemoteHost};
use crate::tree::TrackedFile;

/// Paths per `IN (...)` list when deleting in bulk.
const DELETE_BATCH: usize = 500;

/// Why a file was tracked without fetching (or storing) its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The host no longer has the file.
    NotFound,
    /// The host refused to serve the content inline.
    TooLarge,
    /// Larger than `sync.max_file_size`.
    Oversized,
    /// Matches a metadata-only glob.
    MetadataOnlyPath,
    /// The job was enqueued with `skip_content`.
    ContentDisabled,
    /// Content is not valid UTF-8 text.
    Binary,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotFound => "not_found",
            SkipReason::TooLarge => "too_large",
            SkipReason::Oversized => "oversized",
            SkipReason::MetadataOnlyPath => "metadata_only",
            SkipReason::ContentDisabled => "content_disabled",
            SkipReason::Binary => "binary",
        }
    }
}

/// Result of [`FileMaterializer::sync_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Stored fingerprint already matches; nothing was fetched.
    Unchanged,
    /// Content fetched and stored.
    Fetched,
    Skipped(SkipReason),
    Failed(String),
}

impl FileOutcome {
    pub fn is_skip(&self) -> bool {
        matches!(self, FileOutcome::Unchanged | FileOutcome::Skipped(_))
    }
}

struct FileWrite<'a> {
    repository_id: &'a str,
    path: &'a str,
    content: Option<&'a str>,
    sha: &'a str,
    size: i64,
    skip_reason: Option<SkipReason>,
}

pub struct FileMaterializer {
    pool: SqlitePool,
    remote: Arc<dyn RemoteHost>,
    rate: Arc<RateTracker>,
    policy: Arc<FilePolicy>,
}

impl FileMaterializer {
    pub fn new(
        pool: SqlitePool,
        remote: Arc<dyn RemoteHost>,
        rate: Arc<RateTracker>,
        policy: Arc<FilePolicy>,
    ) -> Self {
        Self {
            pool,
            remote,
            rate,
            policy,
        }
    }

    /// Bring `file` up to date at commit `reference`. Never fails; errors
    /// come back as [`FileOutcome::Failed`].
    pub async fn sync_file(
        &self,
        repo: &Repository,
        job: &SyncJob,
        reference: &str,
        file: &TrackedFile,
    ) -> FileOutcome {
        match self.try_sync_file(repo, job, reference, file).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(repo = %repo.full_name(), path = %file.path, error = %e, "file sync failed");
                FileOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn try_sync_file(
        &self,
        repo: &Repository,
        job: &SyncJob,
        reference: &str,
        file: &TrackedFile,
    ) -> Result<FileOutcome> {
        if let Some(existing) = get_file(&self.pool, &repo.id, &file.path).await? {
            // A metadata-only sync deferred the content; the next normal
            // sync still owes the fetch even when the fingerprint is equal.
            let deferred =
                existing.skip_reason.as_deref() == Some(SkipReason::ContentDisabled.as_str());
            if existing.sha == file.sha && (!deferred || job.options.skip_content()) {
                return Ok(FileOutcome::Unchanged);
            }
        }

        let listed_size = file.size.unwrap_or(0) as i64;
        let pre_fetch_skip = if job.options.skip_content() {
            Some(SkipReason::ContentDisabled)
        } else if self.policy.is_metadata_only_path(&file.path) {
            Some(SkipReason::MetadataOnlyPath)
        } else if file.size.is_some_and(|s| self.policy.is_oversized(s)) {
            Some(SkipReason::Oversized)
        } else {
            None
        };
        if let Some(reason) = pre_fetch_skip {
            self.store_metadata_only(repo, file, listed_size, reason)
                .await?;
            return Ok(FileOutcome::Skipped(reason));
        }

        self.rate.acquire(&repo.credential_id).await;
        let reply = self
            .remote
            .fetch_content(repo, &file.path, reference)
            .await;
        self.rate.observe(&repo.credential_id, reply.quota).await;

        let payload = match reply.result {
            Ok(p) => p,
            Err(RemoteError::NotFound(_)) => {
                debug!(path = %file.path, "file vanished from remote");
                return Ok(FileOutcome::Skipped(SkipReason::NotFound));
            }
            Err(RemoteError::TooLarge(_)) => {
                debug!(path = %file.path, "file too large to fetch, keeping metadata only");
                self.store_metadata_only(repo, file, listed_size, SkipReason::TooLarge)
                    .await?;
                return Ok(FileOutcome::Skipped(SkipReason::TooLarge));
            }
            Err(e) => return Err(e.into()),
        };

        // Diff entries carry no size, so the cap is checked again here.
        if self.policy.is_oversized(payload.size) {
            self.store_metadata_only(repo, file, payload.size as i64, SkipReason::Oversized)
                .await?;
            return Ok(FileOutcome::Skipped(SkipReason::Oversized));
        }

        let Some(text) = decode_content(&payload)? else {
            self.store_metadata_only(repo, file, payload.size as i64, SkipReason::Binary)
                .await?;
            return Ok(FileOutcome::Skipped(SkipReason::Binary));
        };

        upsert_file(
            &self.pool,
            FileWrite {
                repository_id: &repo.id,
                path: &file.path,
                content: Some(&text),
                sha: &file.sha,
                size: text.len() as i64,
                skip_reason: None,
            },
        )
        .await?;

        Ok(FileOutcome::Fetched)
    }

    async fn store_metadata_only(
        &self,
        repo: &Repository,
        file: &TrackedFile,
        size: i64,
        reason: SkipReason,
    ) -> Result<()> {
        upsert_file(
            &self.pool,
            FileWrite {
                repository_id: &repo.id,
                path: &file.path,
                content: None,
                sha: &file.sha,
                size,
                skip_reason: Some(reason),
            },
        )
        .await
    }

    /// Delete every stored file of the repository whose path is not in
    /// `present`. Returns the number of files removed.
    pub async fn delete_missing(
        &self,
        repository_id: &str,
        present: &[TrackedFile],
    ) -> Result<u64> {
        let keep: HashSet<&str> = present.iter().map(|f| f.path.as_str()).collect();
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT path FROM files WHERE repository_id = ?")
                .bind(repository_id)
                .fetch_all(&self.pool)
                .await?;

        let missing: Vec<String> = stored
            .into_iter()
            .filter(|p| !keep.contains(p.as_str()))
            .collect();

        self.delete_paths(repository_id, &missing).await
    }

    /// Delete the given paths (and their segments) in one transaction.
    pub async fn delete_paths(&self, repository_id: &str, paths: &[String]) -> Result<u64> {
        if paths.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;

        for batch in paths.chunks(DELETE_BATCH) {
            let mut segments = QueryBuilder::<Sqlite>::new(
                "DELETE FROM segments WHERE file_id IN (SELECT id FROM files WHERE repository_id = ",
            );
            segments.push_bind(repository_id);
            segments.push(" AND path IN (");
            let mut list = segments.separated(", ");
            for path in batch {
                list.push_bind(path.as_str());
            }
            list.push_unseparated("))");
            segments.build().execute(&mut *tx).await?;

            let mut files =
                QueryBuilder::<Sqlite>::new("DELETE FROM files WHERE repository_id = ");
            files.push_bind(repository_id);
            files.push(" AND path IN (");
            let mut list = files.separated(", ");
            for path in batch {
                list.push_bind(path.as_str());
            }
            list.push_unseparated(")");
            deleted += files.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(repository_id, deleted, "deleted files missing from remote");
        Ok(deleted)
    }
}

/// Decode the host's transport encoding. `Ok(None)` for binary content.
pub fn decode_content(payload: &FileContent) -> Result<Option<String>> {
    let bytes = match payload.encoding.as_str() {
        "base64" => {
            let compact: String = payload
                .content
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            base64::engine::general_purpose::STANDARD.decode(compact)?
        }
        "" | "utf-8" | "utf8" => payload.content.clone().into_bytes(),
        other => bail!("unsupported content encoding '{}'", other),
    };

    if bytes.contains(&0) {
        return Ok(None);
    }
    Ok(String::from_utf8(bytes).ok())
}

async fn upsert_file(pool: &SqlitePool, write: FileWrite<'_>) -> Result<()> {
    let language = detect_language(write.path);
    let line_count = write.content.map(|c| c.lines().count() as i64);

    sqlx::query(
        r#"
        INSERT INTO files (id, repository_id, path, content, sha, size, encoding, skip_reason, language, line_count, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 'utf-8', ?, ?, ?, ?)
        ON CONFLICT(repository_id, path) DO UPDATE SET
            content = excluded.content,
            sha = excluded.sha,
            size = excluded.size,
            skip_reason = excluded.skip_reason,
            language = excluded.language,
            line_count = excluded.line_count,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(write.repository_id)
    .bind(write.path)
    .bind(write.content)
    .bind(write.sha)
    .bind(write.size)
    .bind(write.skip_reason.map(|r| r.as_str()))
    .bind(language)
    .bind(line_count)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) fn row_to_file(row: &SqliteRow) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        repository_id: row.get("repository_id"),
        path: row.get("path"),
        content: row.get("content"),
        sha: row.get("sha"),
        size: row.get("size"),
        encoding: row.get("encoding"),
        skip_reason: row.get("skip_reason"),
        language: row.get("language"),
        line_count: row.get("line_count"),
        last_chunked_sha: row.get("last_chunked_sha"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn get_file(
    pool: &SqlitePool,
    repository_id: &str,
    path: &str,
) -> Result<Option<FileRecord>> {
    let row = sqlx::query("SELECT * FROM files WHERE repository_id = ? AND path = ?")
        .bind(repository_id)
        .bind(path)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_file))
}

pub async fn list_files(pool: &SqlitePool, repository_id: &str) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query("SELECT * FROM files WHERE repository_id = ? ORDER BY path")
        .bind(repository_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_file).collect())
}
