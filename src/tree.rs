//! Tree resolution: which files changed since the last successful sync.
//!
//! Two modes:
//!
//! - **Full listing**: resolve the branch head, list the whole tree
//!   recursively and keep the blob entries that pass the [`FilePolicy`].
//! - **Incremental diff**: ask the host for the file-level diff between the
//!   last synced commit and the current head. Renames become a removal of the
//!   old path plus an upsert of the new one.
//!
//! When the host can no longer resolve the base commit the resolver falls
//! back to a full listing. Any other diff failure is returned to the caller.

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::RemoteError;
use crate::models::Repository;
use crate::policy::FilePolicy;
use crate::rate::RateTracker;
use crate::remote::{BranchHead, ChangeKind, EntryKind, RemoteHost};

/// A file the sync should bring up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: String,
    pub sha: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FullListing {
    pub commit_sha: String,
    pub files: Vec<TrackedFile>,
    /// The host returned only part of the tree.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct IncrementalPlan {
    pub base_commit: String,
    pub head_commit_sha: String,
    /// Added, modified, and the new side of renames.
    pub upserts: Vec<TrackedFile>,
    /// Removed, and the old side of renames.
    pub removals: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ChangeSet {
    Full(FullListing),
    Incremental(IncrementalPlan),
}

impl ChangeSet {
    pub fn head_commit(&self) -> &str {
        match self {
            ChangeSet::Full(l) => &l.commit_sha,
            ChangeSet::Incremental(p) => &p.head_commit_sha,
        }
    }

    /// Files to run through the materializer, in listing order.
    pub fn files(&self) -> &[TrackedFile] {
        match self {
            ChangeSet::Full(l) => &l.files,
            ChangeSet::Incremental(p) => &p.upserts,
        }
    }
}

pub struct TreeResolver {
    remote: Arc<dyn RemoteHost>,
    rate: Arc<RateTracker>,
    policy: Arc<FilePolicy>,
}

impl TreeResolver {
    pub fn new(
        remote: Arc<dyn RemoteHost>,
        rate: Arc<RateTracker>,
        policy: Arc<FilePolicy>,
    ) -> Self {
        Self {
            remote,
            rate,
            policy,
        }
    }

    /// Incremental when the repository has a synced commit and `force_full`
    /// is off, otherwise (or on an unresolvable base) a full listing.
    pub async fn resolve(&self, repo: &Repository, force_full: bool) -> Result<ChangeSet> {
        let head = self.resolve_head(repo).await?;

        if let (false, Some(base)) = (force_full, repo.last_commit_sha.as_deref()) {
            if base == head.commit_sha {
                info!(repo = %repo.full_name(), commit = base, "already at head");
                return Ok(ChangeSet::Incremental(IncrementalPlan {
                    base_commit: base.to_string(),
                    head_commit_sha: head.commit_sha,
                    upserts: Vec::new(),
                    removals: Vec::new(),
                }));
            }
            match self.incremental(repo, base, &head).await? {
                Some(plan) => return Ok(ChangeSet::Incremental(plan)),
                None => {
                    info!(
                        repo = %repo.full_name(),
                        base,
                        "base commit no longer resolvable, falling back to full listing"
                    );
                }
            }
        }

        Ok(ChangeSet::Full(self.full_listing(repo, &head).await?))
    }

    pub async fn resolve_head(&self, repo: &Repository) -> Result<BranchHead> {
        self.rate.acquire(&repo.credential_id).await;
        let reply = self
            .remote
            .resolve_branch(repo, &repo.default_branch)
            .await;
        self.rate.observe(&repo.credential_id, reply.quota).await;
        reply.result.map_err(|e| {
            anyhow!(
                "failed to resolve branch '{}' of {}: {}",
                repo.default_branch,
                repo.full_name(),
                e
            )
        })
    }

    pub async fn full_listing(&self, repo: &Repository, head: &BranchHead) -> Result<FullListing> {
        self.rate.acquire(&repo.credential_id).await;
        let reply = self.remote.list_tree(repo, &head.tree_sha).await;
        self.rate.observe(&repo.credential_id, reply.quota).await;
        let listing = reply
            .result
            .map_err(|e| anyhow!("failed to list tree of {}: {}", repo.full_name(), e))?;

        if listing.truncated {
            warn!(
                repo = %repo.full_name(),
                entries = listing.entries.len(),
                "tree listing truncated by host, processing partial result"
            );
        }

        let files: Vec<TrackedFile> = listing
            .entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::Blob && self.policy.is_tracked(&e.path))
            .map(|e| TrackedFile {
                path: e.path,
                sha: e.sha,
                size: e.size,
            })
            .collect();

        Ok(FullListing {
            commit_sha: head.commit_sha.clone(),
            files,
            truncated: listing.truncated,
        })
    }

    /// `Ok(None)` when the base commit is gone and the caller should list
    /// the full tree instead.
    pub async fn incremental(
        &self,
        repo: &Repository,
        base: &str,
        head: &BranchHead,
    ) -> Result<Option<IncrementalPlan>> {
        self.rate.acquire(&repo.credential_id).await;
        let reply = self.remote.diff(repo, base, &head.commit_sha).await;
        self.rate.observe(&repo.credential_id, reply.quota).await;

        let diff = match reply.result {
            Ok(d) => d,
            Err(RemoteError::BaseUnresolvable(_)) => return Ok(None),
            Err(e) => {
                return Err(anyhow!(
                    "failed to diff {}..{} of {}: {}",
                    base,
                    head.commit_sha,
                    repo.full_name(),
                    e
                ))
            }
        };

        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        let mut seen_removals = HashSet::new();

        for entry in diff.entries {
            let new_side = match entry.kind {
                ChangeKind::Removed => {
                    if seen_removals.insert(entry.path.clone()) {
                        removals.push(entry.path);
                    }
                    continue;
                }
                ChangeKind::Renamed { previous_path } => {
                    if seen_removals.insert(previous_path.clone()) {
                        removals.push(previous_path);
                    }
                    entry.path
                }
                ChangeKind::Added | ChangeKind::Modified => entry.path,
            };

            if !self.policy.is_tracked(&new_side) {
                continue;
            }
            let Some(sha) = entry.sha else {
                warn!(path = %new_side, "diff entry without fingerprint, skipping");
                continue;
            };
            upserts.push(TrackedFile {
                path: new_side,
                sha,
                size: entry.size,
            });
        }

        Ok(Some(IncrementalPlan {
            base_commit: base.to_string(),
            // The resolved branch head is authoritative over the compare payload.
            head_commit_sha: head.commit_sha.clone(),
            upserts,
            removals,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, SyncConfig};
    use crate::db::test_pool;
    use crate::remote::memory::{fingerprint, InMemoryHost};
    use crate::remote::{CommitDiff, DiffEntry};

    fn repo(last_commit: Option<&str>) -> Repository {
        Repository {
            id: "r1".to_string(),
            owner: "acme".to_string(),
            name: "widgets".to_string(),
            default_branch: "main".to_string(),
            credential_id: "default".to_string(),
            last_commit_sha: last_commit.map(str::to_string),
            last_synced_at: None,
            created_at: 0,
        }
    }

    async fn resolver(host: Arc<InMemoryHost>) -> (tempfile::TempDir, TreeResolver) {
        let (tmp, pool) = test_pool().await;
        let rate = Arc::new(RateTracker::new(pool, &RateLimitConfig::default()));
        let policy = Arc::new(FilePolicy::from_config(&SyncConfig::default()).unwrap());
        (tmp, TreeResolver::new(host, rate, policy))
    }

    #[tokio::test]
    async fn full_listing_filters_ignored_paths() {
        let host = Arc::new(InMemoryHost::new());
        host.publish(
            "main",
            "c1",
            &[
                ("src/lib.rs", "pub fn a() {}"),
                ("node_modules/x/index.js", "module.exports = 1"),
                ("logo.png", "binary"),
                ("README.md", "# hi"),
            ],
        );
        let (_tmp, resolver) = resolver(host.clone()).await;

        let changes = resolver.resolve(&repo(None), false).await.unwrap();
        let ChangeSet::Full(listing) = changes else {
            panic!("expected full listing");
        };
        assert_eq!(listing.commit_sha, "c1");
        let paths: Vec<&str> = listing.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs", "README.md"]);
        assert!(!listing.truncated);
        assert_eq!(host.diff_calls(), 0);
    }

    #[tokio::test]
    async fn incremental_expands_renames() {
        let host = Arc::new(InMemoryHost::new());
        host.publish("main", "c2", &[("src/new.rs", "x"), ("src/b.rs", "y")]);
        host.set_diff(
            "c1",
            "c2",
            CommitDiff {
                head_commit_sha: "c2".to_string(),
                entries: vec![
                    DiffEntry {
                        path: "src/new.rs".to_string(),
                        sha: Some(fingerprint("x")),
                        size: None,
                        kind: ChangeKind::Renamed {
                            previous_path: "src/old.rs".to_string(),
                        },
                    },
                    DiffEntry {
                        path: "src/b.rs".to_string(),
                        sha: Some(fingerprint("y")),
                        size: None,
                        kind: ChangeKind::Modified,
                    },
                    DiffEntry {
                        path: "src/gone.rs".to_string(),
                        sha: None,
                        size: None,
                        kind: ChangeKind::Removed,
                    },
                ],
            },
        );
        let (_tmp, resolver) = resolver(host.clone()).await;

        let changes = resolver.resolve(&repo(Some("c1")), false).await.unwrap();
        let ChangeSet::Incremental(plan) = changes else {
            panic!("expected incremental plan");
        };
        assert_eq!(plan.head_commit_sha, "c2");
        assert_eq!(plan.removals, vec!["src/old.rs", "src/gone.rs"]);
        let upserts: Vec<&str> = plan.upserts.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(upserts, vec!["src/new.rs", "src/b.rs"]);
        assert_eq!(host.tree_calls(), 0);
    }

    #[tokio::test]
    async fn unresolvable_base_falls_back_to_full_listing() {
        let host = Arc::new(InMemoryHost::new());
        host.publish("main", "c9", &[("src/lib.rs", "x")]);
        let (_tmp, resolver) = resolver(host.clone()).await;

        let changes = resolver
            .resolve(&repo(Some("rewritten")), false)
            .await
            .unwrap();
        assert!(matches!(changes, ChangeSet::Full(_)));
        assert_eq!(host.diff_calls(), 1);
        assert_eq!(host.tree_calls(), 1);
    }

    #[tokio::test]
    async fn force_full_skips_diff() {
        let host = Arc::new(InMemoryHost::new());
        host.publish("main", "c2", &[("src/lib.rs", "x")]);
        let (_tmp, resolver) = resolver(host.clone()).await;

        let changes = resolver.resolve(&repo(Some("c1")), true).await.unwrap();
        assert!(matches!(changes, ChangeSet::Full(_)));
        assert_eq!(host.diff_calls(), 0);
    }

    #[tokio::test]
    async fn head_equal_to_base_is_empty_plan() {
        let host = Arc::new(InMemoryHost::new());
        host.publish("main", "c1", &[("src/lib.rs", "x")]);
        let (_tmp, resolver) = resolver(host.clone()).await;

        let changes = resolver.resolve(&repo(Some("c1")), false).await.unwrap();
        assert!(changes.files().is_empty());
        assert_eq!(host.diff_calls(), 0);
        assert_eq!(host.tree_calls(), 0);
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let host = Arc::new(InMemoryHost::new());
        host.publish("main", "c1", &[("src/lib.rs", "x")]);
        host.fail_listing(true);
        let (_tmp, resolver) = resolver(host).await;
        assert!(resolver.resolve(&repo(None), false).await.is_err());
    }

    #[tokio::test]
    async fn replies_record_quota() {
        let host = Arc::new(InMemoryHost::new());
        host.publish("main", "c1", &[("src/lib.rs", "x")]);
        let quota = crate::rate::RateSnapshot {
            remaining: 4321,
            limit: 5000,
            reset_at: chrono::Utc::now().timestamp() + 600,
        };
        host.set_quota(Some(quota));
        let (tmp, pool) = test_pool().await;
        let rate = Arc::new(RateTracker::new(pool, &RateLimitConfig::default()));
        let policy = Arc::new(FilePolicy::from_config(&SyncConfig::default()).unwrap());
        let resolver = TreeResolver::new(host, rate.clone(), policy);

        resolver.resolve(&repo(None), false).await.unwrap();
        assert_eq!(rate.snapshot("default").await, Some(quota));
        drop(tmp);
    }
}
