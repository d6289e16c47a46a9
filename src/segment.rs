//! Sliding-window segmenter.
//!
//! Splits a file's text into overlapping [`SegmentSpan`]s measured in
//! characters (not bytes), so offsets stay meaningful for any UTF-8 input.
//! Each window is `chunk_size` characters long and the next one starts
//! `overlap` characters before the previous end.
//!
//! Segments are only regenerated when a file's fingerprint differs from the
//! one recorded at its last segmentation (`last_chunked_sha`). Replacing a
//! file's segments deletes the old rows, embeddings included, and inserts the
//! new ones in a single transaction.

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::embedding::blob_to_vec;
use crate::materialize::row_to_file;
use crate::models::{FileRecord, Segment};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// One window over a text, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpan {
    pub content: String,
    /// Character offset of the first character.
    pub start_char: usize,
    /// Character offset one past the last character.
    pub end_char: usize,
    pub ordinal: usize,
    pub token_estimate: usize,
}

/// Rough token count: characters / 4, rounded up.
pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Split `text` into windows of `chunk_size` characters overlapping by
/// `overlap` characters.
///
/// Empty text yields no segments; text no longer than `chunk_size` yields a
/// single segment with the whole input. Stops as soon as a window would not
/// advance past the previous start.
pub fn segment(text: &str, chunk_size: usize, overlap: usize) -> Vec<SegmentSpan> {
    if text.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    // Byte offset of every char boundary, including the end of the text.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = bounds.len() - 1;

    let span = |start: usize, end: usize, ordinal: usize| SegmentSpan {
        content: text[bounds[start]..bounds[end]].to_string(),
        start_char: start,
        end_char: end,
        ordinal,
        token_estimate: estimate_tokens(end - start),
    };

    if total <= chunk_size {
        return vec![span(0, total, 0)];
    }

    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(total);
        spans.push(span(start, end, spans.len()));
        if end == total {
            break;
        }
        let next = end.saturating_sub(overlap);
        if next <= start {
            warn!(chunk_size, overlap, "segment window does not advance, stopping");
            break;
        }
        start = next;
    }
    spans
}

/// Content hash stored alongside each segment.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Applies the configured window to stored files.
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Segmenter {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
        }
    }

    /// Spans for a stored file. Metadata-only files have none.
    pub fn spans_for(&self, file: &FileRecord) -> Vec<SegmentSpan> {
        match file.content.as_deref() {
            Some(text) => segment(text, self.chunk_size, self.overlap),
            None => Vec::new(),
        }
    }

    /// Re-segment `file` if its fingerprint moved since the last run.
    /// Returns the number of segments written (0 when already current).
    pub async fn refresh(&self, pool: &SqlitePool, file: &FileRecord) -> Result<usize> {
        if !file.needs_segmenting() {
            return Ok(0);
        }
        let spans = self.spans_for(file);
        replace_segments(pool, file, &spans).await
    }
}

/// Files of a repository whose segments are missing or stale.
pub async fn files_needing_segments(
    pool: &SqlitePool,
    repository_id: &str,
) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM files
        WHERE repository_id = ?
          AND (last_chunked_sha IS NULL OR last_chunked_sha != sha)
        ORDER BY path
        "#,
    )
    .bind(repository_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_file).collect())
}

/// Swap a file's segments for `spans` and record the fingerprint they came
/// from.
pub async fn replace_segments(
    pool: &SqlitePool,
    file: &FileRecord,
    spans: &[SegmentSpan],
) -> Result<usize> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM segments WHERE file_id = ?")
        .bind(&file.id)
        .execute(&mut *tx)
        .await?;

    for span in spans {
        sqlx::query(
            r#"
            INSERT INTO segments (id, file_id, chunk_index, content, start_char, end_char, token_count, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&file.id)
        .bind(span.ordinal as i64)
        .bind(&span.content)
        .bind(span.start_char as i64)
        .bind(span.end_char as i64)
        .bind(span.token_estimate as i64)
        .bind(content_hash(&span.content))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE files SET last_chunked_sha = ?, updated_at = ? WHERE id = ?")
        .bind(&file.sha)
        .bind(Utc::now().timestamp())
        .bind(&file.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(spans.len())
}

pub(crate) fn row_to_segment(row: &SqliteRow) -> Segment {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Segment {
        id: row.get("id"),
        file_id: row.get("file_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        start_char: row.get("start_char"),
        end_char: row.get("end_char"),
        token_count: row.get("token_count"),
        hash: row.get("hash"),
        embedding: embedding.as_deref().map(blob_to_vec),
        embedding_model: row.get("embedding_model"),
        embedded_at: row.get("embedded_at"),
    }
}

pub async fn list_segments(pool: &SqlitePool, file_id: &str) -> Result<Vec<Segment>> {
    let rows = sqlx::query("SELECT * FROM segments WHERE file_id = ? ORDER BY chunk_index")
        .bind(file_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_segment).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::repos;

    fn assert_covers(text: &str, spans: &[SegmentSpan]) {
        let total = text.chars().count();
        assert_eq!(spans.first().map(|s| s.start_char), Some(0));
        assert_eq!(spans.last().map(|s| s.end_char), Some(total));
        for pair in spans.windows(2) {
            assert!(pair[1].start_char >= pair[0].start_char);
            // No gap between consecutive windows.
            assert!(pair[1].start_char <= pair[0].end_char);
        }
    }

    #[test]
    fn empty_text_has_no_segments() {
        assert!(segment("", 100, 10).is_empty());
    }

    #[test]
    fn short_text_is_one_segment() {
        let spans = segment("fn main() {}", 100, 10);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].content, "fn main() {}");
        assert_eq!((spans[0].start_char, spans[0].end_char), (0, 12));
        assert_eq!(spans[0].token_estimate, 3);

        let exact = "a".repeat(100);
        assert_eq!(segment(&exact, 100, 10).len(), 1);
    }

    #[test]
    fn windows_overlap_and_cover() {
        let text: String = (0..1000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let spans = segment(&text, 300, 50);
        assert_eq!(
            spans
                .iter()
                .map(|s| (s.start_char, s.end_char))
                .collect::<Vec<_>>(),
            vec![(0, 300), (250, 550), (500, 800), (750, 1000)]
        );
        for (i, s) in spans.iter().enumerate() {
            assert_eq!(s.ordinal, i);
            assert!(s.end_char - s.start_char <= 300);
        }
        assert_covers(&text, &spans);
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let text = "é".repeat(25);
        let spans = segment(&text, 10, 2);
        assert_covers(&text, &spans);
        assert_eq!(spans[0].content.chars().count(), 10);
        assert_eq!(spans[1].start_char, 8);
    }

    #[test]
    fn non_advancing_window_terminates() {
        let text = "x".repeat(50);
        let spans = segment(&text, 10, 10);
        assert_eq!(spans.len(), 1);
        let spans = segment(&text, 10, 25);
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn terminates_and_covers_for_many_shapes() {
        let text = "line of code\n".repeat(97);
        for size in [1usize, 2, 7, 64, 500, 1500] {
            for overlap in [0usize, 1, size / 2, size.saturating_sub(1)] {
                if overlap >= size {
                    continue;
                }
                let spans = segment(&text, size, overlap);
                assert!(!spans.is_empty());
                assert_covers(&text, &spans);
            }
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
    }

    async fn insert_file(
        pool: &SqlitePool,
        repo_id: &str,
        path: &str,
        content: Option<&str>,
        sha: &str,
    ) -> FileRecord {
        sqlx::query(
            "INSERT INTO files (id, repository_id, path, content, sha, size, updated_at) VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(format!("file-{}", path))
        .bind(repo_id)
        .bind(path)
        .bind(content)
        .bind(sha)
        .bind(content.map(|c| c.len() as i64).unwrap_or(0))
        .execute(pool)
        .await
        .unwrap();
        crate::materialize::get_file(pool, repo_id, path)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn refresh_only_when_fingerprint_moves() {
        let (_tmp, pool) = test_pool().await;
        let repo = repos::add_repository(&pool, "acme", "widgets", "main", "default")
            .await
            .unwrap();
        let text = "z".repeat(40);
        let file = insert_file(&pool, &repo.id, "src/a.rs", Some(&text), "s1").await;
        let segmenter = Segmenter::new(16, 4);

        assert_eq!(files_needing_segments(&pool, &repo.id).await.unwrap().len(), 1);
        let written = segmenter.refresh(&pool, &file).await.unwrap();
        assert_eq!(written, 3);
        let first = list_segments(&pool, &file.id).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].hash, content_hash(&first[0].content));

        let file = crate::materialize::get_file(&pool, &repo.id, "src/a.rs")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.last_chunked_sha.as_deref(), Some("s1"));
        assert!(files_needing_segments(&pool, &repo.id).await.unwrap().is_empty());

        // Current fingerprint: rows are left alone.
        assert_eq!(segmenter.refresh(&pool, &file).await.unwrap(), 0);
        let again = list_segments(&pool, &file.id).await.unwrap();
        let ids = |s: &[Segment]| s.iter().map(|x| x.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&again));
    }

    #[tokio::test]
    async fn metadata_only_file_is_marked_without_segments() {
        let (_tmp, pool) = test_pool().await;
        let repo = repos::add_repository(&pool, "acme", "widgets", "main", "default")
            .await
            .unwrap();
        let file = insert_file(&pool, &repo.id, "dist/app.min.js", None, "s9").await;

        let written = Segmenter::new(100, 10).refresh(&pool, &file).await.unwrap();
        assert_eq!(written, 0);
        assert!(list_segments(&pool, &file.id).await.unwrap().is_empty());
        assert!(files_needing_segments(&pool, &repo.id).await.unwrap().is_empty());
    }
}
