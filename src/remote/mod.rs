//! Remote version-control host abstraction.
//!
//! The pipeline only needs four operations from a host: resolve a branch,
//! list a tree, diff two commits and fetch one file. [`RemoteHost`] captures
//! them; [`github::GitHubHost`] implements them over the GitHub REST API and
//! `memory::InMemoryHost` serves a scripted tree to tests. The memory host is
//! compiled only for unit tests and under the `test-util` feature.
//!
//! Every operation returns a [`HostReply`] carrying both the outcome and the
//! quota snapshot parsed from the response, so callers can record the quota
//! whether the call succeeded or not.

pub mod github;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::models::Repository;
use crate::rate::RateSnapshot;

/// Outcome of one remote call plus the quota headers it carried.
#[derive(Debug)]
pub struct HostReply<T> {
    pub quota: Option<RateSnapshot>,
    pub result: Result<T, RemoteError>,
}

impl<T> HostReply<T> {
    pub fn new(quota: Option<RateSnapshot>, result: Result<T, RemoteError>) -> Self {
        Self { quota, result }
    }
}

/// A branch resolved to its head commit and root tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchHead {
    pub commit_sha: String,
    pub tree_sha: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Blob,
    Tree,
    /// Submodule pointer.
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    /// Content fingerprint (blob SHA).
    pub sha: String,
    pub size: Option<u64>,
    pub kind: EntryKind,
}

/// Recursive tree listing. `truncated` is set when the host returned only
/// part of the tree.
#[derive(Debug, Clone, Default)]
pub struct TreeListing {
    pub entries: Vec<TreeEntry>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
    Renamed { previous_path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    /// Fingerprint of the new content; absent for removals.
    pub sha: Option<String>,
    pub size: Option<u64>,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone)]
pub struct CommitDiff {
    pub entries: Vec<DiffEntry>,
    pub head_commit_sha: String,
}

/// File payload in the host's transport encoding (e.g. `base64`).
#[derive(Debug, Clone)]
pub struct FileContent {
    pub content: String,
    pub encoding: String,
    pub size: u64,
}

#[async_trait]
pub trait RemoteHost: Send + Sync {
    async fn resolve_branch(&self, repo: &Repository, branch: &str) -> HostReply<BranchHead>;

    async fn list_tree(&self, repo: &Repository, tree_sha: &str) -> HostReply<TreeListing>;

    /// File-level diff between `base` and `head`. Fails with
    /// [`RemoteError::BaseUnresolvable`] when the host no longer knows `base`.
    async fn diff(&self, repo: &Repository, base: &str, head: &str) -> HostReply<CommitDiff>;

    /// Fetch one file at `reference`. Fails with [`RemoteError::NotFound`]
    /// or [`RemoteError::TooLarge`] for the expected negative outcomes.
    async fn fetch_content(
        &self,
        repo: &Repository,
        path: &str,
        reference: &str,
    ) -> HostReply<FileContent>;
}
