//! Core data models used throughout the indexer.
//!
//! Jobs, repositories, mirrored files and their segments. Job status values
//! are stored as their upper-case names (`PENDING`, `FETCHING_TREE`, ...).

use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;

/// Which queue a job lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Sync,
    Embed,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Embed => "embed",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `PENDING → FETCHING_TREE → PROCESSING_FILES → COMPLETED`, or `FAILED`
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    FetchingTree,
    ProcessingFiles,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::FetchingTree => "FETCHING_TREE",
            SyncStatus::ProcessingFiles => "PROCESSING_FILES",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Failed)
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "PENDING" => SyncStatus::Pending,
            "FETCHING_TREE" => SyncStatus::FetchingTree,
            "PROCESSING_FILES" => SyncStatus::ProcessingFiles,
            "COMPLETED" => SyncStatus::Completed,
            "FAILED" => SyncStatus::Failed,
            other => bail!("unknown sync job status '{}'", other),
        })
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `PENDING → CHUNKING → EMBEDDING → COMPLETED`, or `FAILED` from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedStatus {
    Pending,
    Chunking,
    Embedding,
    Completed,
    Failed,
}

impl EmbedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedStatus::Pending => "PENDING",
            EmbedStatus::Chunking => "CHUNKING",
            EmbedStatus::Embedding => "EMBEDDING",
            EmbedStatus::Completed => "COMPLETED",
            EmbedStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EmbedStatus::Completed | EmbedStatus::Failed)
    }
}

impl FromStr for EmbedStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "PENDING" => EmbedStatus::Pending,
            "CHUNKING" => EmbedStatus::Chunking,
            "EMBEDDING" => EmbedStatus::Embedding,
            "COMPLETED" => EmbedStatus::Completed,
            "FAILED" => EmbedStatus::Failed,
            other => bail!("unknown embed job status '{}'", other),
        })
    }
}

impl fmt::Display for EmbedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job overrides supplied when the job is enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Process at most this many files from the listing.
    pub max_files: Option<u32>,
    /// Track every file as metadata only.
    pub skip_content: Option<bool>,
    /// Ignore the last synced commit and list the whole tree.
    pub full_sync: Option<bool>,
}

impl SyncOptions {
    pub fn skip_content(&self) -> bool {
        self.skip_content.unwrap_or(false)
    }

    pub fn full_sync(&self) -> bool {
        self.full_sync.unwrap_or(false)
    }
}

/// One sync attempt for one repository.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub id: String,
    pub repository_id: String,
    pub status: SyncStatus,
    pub total_files: i64,
    pub processed_files: i64,
    pub skipped_files: i64,
    pub failed_files: i64,
    pub current_file: Option<String>,
    pub options: SyncOptions,
    /// Worker that claimed the job.
    pub worker_id: Option<String>,
    /// Last sign of life from that worker, unix seconds.
    pub heartbeat_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

/// One chunk-and-embed pass over a repository's mirrored files.
#[derive(Debug, Clone)]
pub struct EmbedJob {
    pub id: String,
    pub repository_id: String,
    pub status: EmbedStatus,
    pub files_processed: i64,
    pub chunks_created: i64,
    pub embeddings_generated: i64,
    pub failed_count: i64,
    pub worker_id: Option<String>,
    pub heartbeat_at: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

/// A tracked remote repository.
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    /// Identity used for remote requests and rate accounting.
    pub credential_id: String,
    /// Head commit of the last successful sync.
    pub last_commit_sha: Option<String>,
    pub last_synced_at: Option<i64>,
    pub created_at: i64,
}

impl Repository {
    /// `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Local mirror of one remote file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: String,
    pub repository_id: String,
    pub path: String,
    /// `None` when the content was not fetched (see `skip_reason`).
    pub content: Option<String>,
    pub sha: String,
    pub size: i64,
    pub encoding: String,
    pub skip_reason: Option<String>,
    pub language: Option<String>,
    pub line_count: Option<i64>,
    /// Fingerprint the current segments were generated from.
    pub last_chunked_sha: Option<String>,
    pub updated_at: i64,
}

impl FileRecord {
    /// True when the stored segments were not built from the current fingerprint.
    pub fn needs_segmenting(&self) -> bool {
        self.last_chunked_sha.as_deref() != Some(self.sha.as_str())
    }
}

/// A retrieval unit cut from a file's content.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub start_char: i64,
    pub end_char: i64,
    pub token_count: i64,
    pub hash: String,
    pub embedding: Option<Vec<f32>>,
    /// Model that produced `embedding`.
    pub embedding_model: Option<String>,
    pub embedded_at: Option<i64>,
}
