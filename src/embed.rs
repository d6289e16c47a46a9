//! Embedding batcher.
//!
//! Works through the segments of a repository that have no embedding from
//! the current model yet, one provider call per batch. Each stored vector
//! records the model and dimension count that produced it; a vector whose
//! length disagrees with the provider's declared dimensions is rejected.
//! A failed batch A failed batch is logged and counted and
//! the batcher moves on, so a later run picks up exactly the segments that
//! are still missing a vector. The job's counters are persisted after every
//! batch so progress survives a crash mid-job.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::embedding::{vec_to_blob, EmbeddingProvider};
use crate::jobs::{self, EmbedCounters};
use crate::models::{EmbedJob, EmbedStatus, JobKind};
use crate::progress::{JobEvent, JobObserver, JobProgress};

/// A segment still waiting for its vector.
#[derive(Debug, Clone)]
pub struct PendingSegment {
    pub id: String,
    pub content: String,
}

/// Segments of `repository_id` with no embedding from `model`, in
/// file/ordinal order. Vectors left by another model count as missing.
pub async fn find_unembedded(
    pool: &SqlitePool,
    repository_id: &str,
    model: &str,
) -> Result<Vec<PendingSegment>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT s.id, s.content
        FROM segments s
        JOIN files f ON f.id = s.file_id
        WHERE f.repository_id = ? AND (s.embedding IS NULL OR s.embedding_model IS NOT ?)
        ORDER BY f.path, s.chunk_index
        "#,
    )
    .bind(repository_id)
    .bind(model)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, content)| PendingSegment { id, content })
        .collect())
}

/// Outcome of one [`EmbeddingBatcher::embed`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batches: usize,
    pub failed_batches: usize,
    pub embedded: usize,
    pub failed_segments: usize,
}

pub struct EmbeddingBatcher {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    delay: Duration,
}

impl EmbeddingBatcher {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, delay: Duration) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            delay,
        }
    }

    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self::new(
            provider,
            config.batch_size,
            Duration::from_millis(config.batch_delay_ms),
        )
    }

    /// Embed `segments` batch by batch for `job`, starting from the job's
    /// current `counters`. Only storage errors are returned; provider
    /// failures are counted in the report.
    pub async fn embed(
        &self,
        pool: &SqlitePool,
        job: &EmbedJob,
        repository: &str,
        segments: &[PendingSegment],
        counters: &mut EmbedCounters,
        observer: &dyn JobObserver,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let batch_count = segments.len().div_ceil(self.batch_size);

        for (index, batch) in segments.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            let texts: Vec<String> = batch.iter().map(|s| s.content.clone()).collect();

            match self.provider.embed(&texts).await {
                Ok(vectors) => {
                    let (stored, rejected) = store_embeddings(
                        pool,
                        batch,
                        &vectors,
                        self.provider.model_name(),
                        self.provider.dims(),
                    )
                    .await?;
                    report.embedded += stored;
                    counters.embeddings_generated += stored as i64;
                    if rejected > 0 {
                        warn!(
                            job_id = %job.id,
                            batch = index + 1,
                            rejected,
                            dims = self.provider.dims(),
                            "provider returned vectors of the wrong size"
                        );
                        report.failed_segments += rejected;
                        counters.failed_count += rejected as i64;
                    }
                    debug!(job_id = %job.id, batch = index + 1, stored, "embedded batch");
                }
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        batch = index + 1,
                        size = batch.len(),
                        error = %e,
                        "embedding batch failed, continuing"
                    );
                    report.failed_batches += 1;
                    report.failed_segments += batch.len();
                    counters.failed_count += batch.len() as i64;
                }
            }

            jobs::update_embed_progress(pool, &job.id, counters).await?;
            observer.notify(&JobEvent::Progress(JobProgress {
                job_id: job.id.clone(),
                kind: JobKind::Embed,
                repository: repository.to_string(),
                status: EmbedStatus::Embedding.as_str().to_string(),
                processed: (report.embedded + report.failed_segments) as u64,
                total: segments.len() as u64,
                current: Some(format!("batch {}/{}", index + 1, batch_count)),
                error: None,
            }));

            if index + 1 < batch_count && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        Ok(report)
    }
}

/// Write one batch of vectors tagged with `model`. Vectors that are missing
/// or not `dims` long are rejected, and segments another run already
/// embedded with `model` are left untouched. Returns `(stored, rejected)`.
async fn store_embeddings(
    pool: &SqlitePool,
    batch: &[PendingSegment],
    vectors: &[Vec<f32>],
    model: &str,
    dims: usize,
) -> Result<(usize, usize)> {
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    let mut stored = 0;
    let mut rejected = 0;

    for (i, segment) in batch.iter().enumerate() {
        let vector = match vectors.get(i) {
            Some(v) if v.len() == dims => v,
            _ => {
                rejected += 1;
                continue;
            }
        };
        stored += sqlx::query(
            r#"
            UPDATE segments
            SET embedding = ?, embedding_model = ?, embedding_dims = ?, embedded_at = ?
            WHERE id = ? AND (embedding IS NULL OR embedding_model IS NOT ?)
            "#,
        )
        .bind(vec_to_blob(vector))
        .bind(model)
        .bind(dims as i64)
        .bind(now)
        .bind(&segment.id)
        .bind(model)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;
    }

    tx.commit().await?;
    Ok((stored, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::progress::NoProgress;
    use crate::repos;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Declares two dimensions; fails on the listed 1-based calls and pads
    /// its vectors with `extra` zeros.
    struct FlakyProvider {
        model: &'static str,
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        extra: usize,
    }

    fn flaky(fail_on: Vec<usize>) -> FlakyProvider {
        FlakyProvider {
            model: "flaky",
            calls: AtomicUsize::new(0),
            fail_on,
            extra: 0,
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model_name(&self) -> &str {
            self.model
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&call) {
                anyhow::bail!("provider unavailable");
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![t.len() as f32, 1.0];
                    v.resize(2 + self.extra, 0.0);
                    v
                })
                .collect())
        }
    }

    async fn seed(pool: &SqlitePool, segments: usize) -> (String, EmbedJob) {
        let repo = repos::add_repository(pool, "acme", "widgets", "main", "default")
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO files (id, repository_id, path, content, sha, size, updated_at) VALUES ('f1', ?, 'a.rs', 'x', 's', 1, 0)",
        )
        .bind(&repo.id)
        .execute(pool)
        .await
        .unwrap();
        for i in 0..segments {
            sqlx::query(
                "INSERT INTO segments (id, file_id, chunk_index, content, start_char, end_char, token_count, hash) VALUES (?, 'f1', ?, ?, 0, 1, 1, 'h')",
            )
            .bind(format!("seg-{:03}", i))
            .bind(i as i64)
            .bind(format!("segment {}", i))
            .execute(pool)
            .await
            .unwrap();
        }
        let job_id = jobs::create_embed_job(pool, &repo.id).await.unwrap();
        let job = jobs::claim_next_embed(pool, "w1").await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        (repo.id, job)
    }

    #[tokio::test]
    async fn failed_batch_is_skipped_and_resumable() {
        let (_tmp, pool) = test_pool().await;
        let (repo_id, job) = seed(&pool, 50).await;
        let flaky = Arc::new(flaky(vec![2]));
        let batcher = EmbeddingBatcher::new(flaky.clone(), 17, Duration::ZERO);

        let pending = find_unembedded(&pool, &repo_id, "flaky").await.unwrap();
        assert_eq!(pending.len(), 50);
        let mut counters = EmbedCounters::default();
        let report = batcher
            .embed(&pool, &job, "acme/widgets", &pending, &mut counters, &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.embedded, 33);
        assert_eq!(report.failed_segments, 17);
        let stored = jobs::get_embed_job(&pool, &job.id).await.unwrap().unwrap();
        assert_eq!(stored.embeddings_generated, 33);
        assert_eq!(stored.failed_count, 17);

        let left = find_unembedded(&pool, &repo_id, "flaky").await.unwrap();
        assert_eq!(left.len(), 17);
        assert_eq!(left[0].id, "seg-017");
        assert_eq!(left[16].id, "seg-033");

        let mut counters = EmbedCounters::default();
        let report = batcher
            .embed(&pool, &job, "acme/widgets", &left, &mut counters, &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.embedded, 17);
        assert!(find_unembedded(&pool, &repo_id, "flaky").await.unwrap().is_empty());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn vectors_are_stored_as_blobs() {
        let (_tmp, pool) = test_pool().await;
        let (repo_id, job) = seed(&pool, 2).await;
        let provider = Arc::new(flaky(vec![]));
        let batcher = EmbeddingBatcher::new(provider, 50, Duration::from_millis(100));
        let pending = find_unembedded(&pool, &repo_id, "flaky").await.unwrap();
        let mut counters = EmbedCounters::default();
        batcher
            .embed(&pool, &job, "acme/widgets", &pending, &mut counters, &NoProgress)
            .await
            .unwrap();

        let segments = crate::segment::list_segments(&pool, "f1").await.unwrap();
        assert_eq!(segments[0].embedding, Some(vec![9.0, 1.0]));
        assert_eq!(segments[0].embedding_model.as_deref(), Some("flaky"));
        assert!(segments[1].embedded_at.is_some());
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_not_stored() {
        let (_tmp, pool) = test_pool().await;
        let (repo_id, job) = seed(&pool, 3).await;
        let provider = Arc::new(FlakyProvider {
            extra: 1,
            ..flaky(vec![])
        });
        let batcher = EmbeddingBatcher::new(provider, 50, Duration::ZERO);
        let pending = find_unembedded(&pool, &repo_id, "flaky").await.unwrap();
        let mut counters = EmbedCounters::default();
        let report = batcher
            .embed(&pool, &job, "acme/widgets", &pending, &mut counters, &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.embedded, 0);
        assert_eq!(report.failed_segments, 3);
        assert_eq!(counters.failed_count, 3);
        assert_eq!(find_unembedded(&pool, &repo_id, "flaky").await.unwrap().len(), 3);
        let segments = crate::segment::list_segments(&pool, "f1").await.unwrap();
        assert!(segments.iter().all(|s| s.embedding.is_none()));
    }

    #[tokio::test]
    async fn model_change_reembeds_segments() {
        let (_tmp, pool) = test_pool().await;
        let (repo_id, job) = seed(&pool, 2).await;
        let old = EmbeddingBatcher::new(Arc::new(flaky(vec![])), 50, Duration::ZERO);
        let pending = find_unembedded(&pool, &repo_id, "flaky").await.unwrap();
        let mut counters = EmbedCounters::default();
        old.embed(&pool, &job, "acme/widgets", &pending, &mut counters, &NoProgress)
            .await
            .unwrap();
        assert!(find_unembedded(&pool, &repo_id, "flaky").await.unwrap().is_empty());

        let pending = find_unembedded(&pool, &repo_id, "flaky-v2").await.unwrap();
        assert_eq!(pending.len(), 2);
        let new = EmbeddingBatcher::new(
            Arc::new(FlakyProvider {
                model: "flaky-v2",
                ..flaky(vec![])
            }),
            50,
            Duration::ZERO,
        );
        let report = new
            .embed(&pool, &job, "acme/widgets", &pending, &mut counters, &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.embedded, 2);

        assert!(find_unembedded(&pool, &repo_id, "flaky-v2").await.unwrap().is_empty());
        let segments = crate::segment::list_segments(&pool, "f1").await.unwrap();
        assert!(segments
            .iter()
            .all(|s| s.embedding_model.as_deref() == Some("flaky-v2")));
    }
}
