//! In-memory [`RemoteHost`] for tests and local dry runs.
//!
//! Holds a single branch universe (the repository argument is ignored) behind
//! `std::sync::RwLock`. Content is served base64-encoded, the same transport
//! encoding the GitHub host uses, and every call is counted so tests can
//! assert how many remote round-trips a sync made.

use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{
    BranchHead, CommitDiff, EntryKind, FileContent, HostReply, RemoteHost, TreeEntry, TreeListing,
};
use crate::error::RemoteError;
use crate::models::Repository;
use crate::rate::RateSnapshot;

/// Hex SHA-256 of `content`, used as the fake blob fingerprint.
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Default)]
struct HostState {
    heads: HashMap<String, BranchHead>,
    trees: HashMap<String, TreeListing>,
    files: HashMap<String, String>,
    diffs: HashMap<(String, String), CommitDiff>,
    failing: HashSet<String>,
    too_large: HashSet<String>,
    fail_listing: bool,
    quota: Option<RateSnapshot>,
}

#[derive(Default)]
pub struct InMemoryHost {
    state: RwLock<HostState>,
    branch_calls: AtomicUsize,
    tree_calls: AtomicUsize,
    diff_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the branch head with a tree holding exactly `files`
    /// (`(path, content)` pairs). Tree and commit ids are derived from `commit`.
    pub fn publish(&self, branch: &str, commit: &str, files: &[(&str, &str)]) {
        let tree_sha = format!("tree-{}", commit);
        let entries = files
            .iter()
            .map(|(path, content)| TreeEntry {
                path: path.to_string(),
                sha: fingerprint(content),
                size: Some(content.len() as u64),
                kind: EntryKind::Blob,
            })
            .collect();

        let mut state = self.state.write().unwrap();
        state.heads.insert(
            branch.to_string(),
            BranchHead {
                commit_sha: commit.to_string(),
                tree_sha: tree_sha.clone(),
            },
        );
        state.trees.insert(
            tree_sha,
            TreeListing {
                entries,
                truncated: false,
            },
        );
        for (path, content) in files {
            state.files.insert(path.to_string(), content.to_string());
        }
    }

    /// Register the diff returned for `base...head`. Unregistered pairs
    /// answer [`RemoteError::BaseUnresolvable`].
    pub fn set_diff(&self, base: &str, head: &str, diff: CommitDiff) {
        self.state
            .write()
            .unwrap()
            .diffs
            .insert((base.to_string(), head.to_string()), diff);
    }

    pub fn set_truncated(&self, branch: &str, truncated: bool) {
        let mut state = self.state.write().unwrap();
        if let Some(tree) = state.heads.get(branch).map(|h| h.tree_sha.clone()) {
            if let Some(listing) = state.trees.get_mut(&tree) {
                listing.truncated = truncated;
            }
        }
    }

    /// Make fetches of `path` fail with an HTTP 500.
    pub fn fail_fetch(&self, path: &str) {
        self.state.write().unwrap().failing.insert(path.to_string());
    }

    /// Make fetches of `path` answer "too large".
    pub fn mark_too_large(&self, path: &str) {
        self.state
            .write()
            .unwrap()
            .too_large
            .insert(path.to_string());
    }

    /// Remove a file's content while leaving it in the tree listing.
    pub fn forget_content(&self, path: &str) {
        self.state.write().unwrap().files.remove(path);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.write().unwrap().fail_listing = fail;
    }

    /// Quota snapshot attached to every reply.
    pub fn set_quota(&self, quota: Option<RateSnapshot>) {
        self.state.write().unwrap().quota = quota;
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn tree_calls(&self) -> usize {
        self.tree_calls.load(Ordering::SeqCst)
    }

    pub fn diff_calls(&self) -> usize {
        self.diff_calls.load(Ordering::SeqCst)
    }

    pub fn branch_calls(&self) -> usize {
        self.branch_calls.load(Ordering::SeqCst)
    }

    fn quota(&self) -> Option<RateSnapshot> {
        self.state.read().unwrap().quota
    }
}

#[async_trait]
impl RemoteHost for InMemoryHost {
    async fn resolve_branch(&self, _repo: &Repository, branch: &str) -> HostReply<BranchHead> {
        self.branch_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .state
            .read()
            .unwrap()
            .heads
            .get(branch)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("branch {}", branch)));
        HostReply::new(self.quota(), result)
    }

    async fn list_tree(&self, _repo: &Repository, tree_sha: &str) -> HostReply<TreeListing> {
        self.tree_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().unwrap();
        let result = if state.fail_listing {
            Err(RemoteError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            })
        } else {
            state
                .trees
                .get(tree_sha)
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(format!("tree {}", tree_sha)))
        };
        drop(state);
        HostReply::new(self.quota(), result)
    }

    async fn diff(&self, _repo: &Repository, base: &str, head: &str) -> HostReply<CommitDiff> {
        self.diff_calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .state
            .read()
            .unwrap()
            .diffs
            .get(&(base.to_string(), head.to_string()))
            .cloned()
            .ok_or_else(|| RemoteError::BaseUnresolvable(base.to_string()));
        HostReply::new(self.quota(), result)
    }

    async fn fetch_content(
        &self,
        _repo: &Repository,
        path: &str,
        _reference: &str,
    ) -> HostReply<FileContent> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().unwrap();
        let result = if state.failing.contains(path) {
            Err(RemoteError::Status {
                status: 500,
                body: "internal error".to_string(),
            })
        } else if state.too_large.contains(path) {
            Err(RemoteError::TooLarge(path.to_string()))
        } else {
            match state.files.get(path) {
                Some(content) => Ok(FileContent {
                    content: base64::engine::general_purpose::STANDARD.encode(content),
                    encoding: "base64".to_string(),
                    size: content.len() as u64,
                }),
                None => Err(RemoteError::NotFound(path.to_string())),
            }
        };
        drop(state);
        HostReply::new(self.quota(), result)
    }
}
