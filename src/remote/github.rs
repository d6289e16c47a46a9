//! GitHub REST implementation of [`RemoteHost`].
//!
//! Endpoints used:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | resolve branch | `GET /repos/{owner}/{repo}/branches/{branch}` |
//! | list tree | `GET /repos/{owner}/{repo}/git/trees/{sha}?recursive=1` |
//! | diff | `GET /repos/{owner}/{repo}/compare/{base}...{head}` |
//! | fetch content | `GET /repos/{owner}/{repo}/contents/{path}?ref={sha}` |
//!
//! Tokens are looked up per credential id: `default` reads
//! `remote.token_env`, other ids read the env var named in
//! `[remote.credentials]`. The `default` credential may run unauthenticated.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

use super::{
    BranchHead, ChangeKind, CommitDiff, DiffEntry, EntryKind, FileContent, HostReply, RemoteHost,
    TreeEntry, TreeListing,
};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::models::Repository;
use crate::rate::{extract_from_headers, RateSnapshot};

/// The compare endpoint stops listing files past this count.
const COMPARE_FILE_CAP: usize = 300;

pub struct GitHubHost {
    client: Client,
    api_url: String,
    config: RemoteConfig,
}

impl GitHubHost {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("repo-indexer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            config: config.clone(),
        })
    }

    fn token_for(&self, credential_id: &str) -> Result<Option<String>, RemoteError> {
        let var = match self.config.credentials.get(credential_id) {
            Some(var) => var.as_str(),
            None if credential_id == "default" => self.config.token_env.as_str(),
            None => return Err(RemoteError::Unauthorized(credential_id.to_string())),
        };
        match std::env::var(var) {
            Ok(token) if !token.is_empty() => Ok(Some(token)),
            _ if credential_id == "default" => Ok(None),
            _ => Err(RemoteError::Unauthorized(credential_id.to_string())),
        }
    }

    fn endpoint(&self, repo: &Repository, tail: &[&str]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| RemoteError::Decode(format!("bad api_url '{}': {}", self.api_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Decode(format!("api_url '{}' cannot be a base", self.api_url)))?
            .extend(["repos", repo.owner.as_str(), repo.name.as_str()])
            .extend(tail.iter().copied());
        Ok(url)
    }

    /// Send a GET and split the response into quota + status-checked body.
    async fn get(
        &self,
        repo: &Repository,
        url: Url,
    ) -> (Option<RateSnapshot>, Result<Response, RemoteError>) {
        let token = match self.token_for(&repo.credential_id) {
            Ok(t) => t,
            Err(e) => return (None, Err(e)),
        };

        let mut request = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => (extract_from_headers(response.headers()), Ok(response)),
            Err(e) => (None, Err(e.into())),
        }
    }
}

async fn status_error(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RemoteError::Status { status, body }
}

async fn parse_json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, RemoteError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
}

#[derive(Deserialize)]
struct BranchBody {
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct BranchCommit {
    sha: String,
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    tree: ShaRef,
}

#[derive(Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Deserialize)]
struct TreeBody {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Deserialize)]
struct CompareBody {
    #[serde(default)]
    commits: Vec<ShaRef>,
    #[serde(default)]
    files: Vec<CompareFile>,
}

#[derive(Deserialize)]
struct CompareFile {
    filename: String,
    status: String,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    previous_filename: Option<String>,
}

#[derive(Deserialize)]
struct ContentBody {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
    #[serde(default)]
    size: u64,
}

fn entry_kind(kind: &str) -> Option<EntryKind> {
    match kind {
        "blob" => Some(EntryKind::Blob),
        "tree" => Some(EntryKind::Tree),
        "commit" => Some(EntryKind::Commit),
        _ => None,
    }
}

fn change_kind(file: &CompareFile) -> Option<ChangeKind> {
    match file.status.as_str() {
        "added" | "copied" => Some(ChangeKind::Added),
        "modified" | "changed" => Some(ChangeKind::Modified),
        "removed" => Some(ChangeKind::Removed),
        "renamed" => Some(match &file.previous_filename {
            Some(prev) => ChangeKind::Renamed {
                previous_path: prev.clone(),
            },
            None => ChangeKind::Added,
        }),
        _ => None,
    }
}

fn to_diff(body: CompareBody, base: &str, head: &str) -> Result<CommitDiff, RemoteError> {
    if body.files.len() >= COMPARE_FILE_CAP {
        // The listing would be incomplete; a full listing is the only safe answer.
        return Err(RemoteError::BaseUnresolvable(format!(
            "{} (diff lists {} or more files)",
            base, COMPARE_FILE_CAP
        )));
    }

    let head_commit_sha = body
        .commits
        .last()
        .map(|c| c.sha.clone())
        .unwrap_or_else(|| head.to_string());

    let entries = body
        .files
        .into_iter()
        .filter_map(|f| {
            let kind = change_kind(&f)?;
            Some(DiffEntry {
                path: f.filename,
                sha: f.sha,
                size: None,
                kind,
            })
        })
        .collect();

    Ok(CommitDiff {
        entries,
        head_commit_sha,
    })
}

async fn read_branch(
    response: Response,
    repo: &Repository,
    branch: &str,
) -> Result<BranchHead, RemoteError> {
    match response.status() {
        s if s.is_success() => {
            let body: BranchBody = parse_json(response).await?;
            Ok(BranchHead {
                commit_sha: body.commit.sha,
                tree_sha: body.commit.commit.tree.sha,
            })
        }
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound(format!(
            "{} branch {}",
            repo.full_name(),
            branch
        ))),
        _ => Err(status_error(response).await),
    }
}

async fn read_tree(response: Response) -> Result<TreeListing, RemoteError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    let body: TreeBody = parse_json(response).await?;
    let entries = body
        .tree
        .into_iter()
        .filter_map(|item| {
            Some(TreeEntry {
                kind: entry_kind(&item.kind)?,
                path: item.path,
                sha: item.sha,
                size: item.size,
            })
        })
        .collect();
    Ok(TreeListing {
        entries,
        truncated: body.truncated,
    })
}

async fn read_compare(response: Response, base: &str, head: &str) -> Result<CommitDiff, RemoteError> {
    match response.status() {
        s if s.is_success() => {
            let body: CompareBody = parse_json(response).await?;
            to_diff(body, base, head)
        }
        StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            Err(RemoteError::BaseUnresolvable(base.to_string()))
        }
        _ => Err(status_error(response).await),
    }
}

async fn read_content(response: Response, path: &str) -> Result<FileContent, RemoteError> {
    match response.status() {
        s if s.is_success() => {
            let body: ContentBody = parse_json(response).await?;
            // Files over the API's inline limit come back without content.
            if body.encoding == "none" {
                return Err(RemoteError::TooLarge(path.to_string()));
            }
            Ok(FileContent {
                content: body.content,
                encoding: body.encoding,
                size: body.size,
            })
        }
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound(path.to_string())),
        StatusCode::FORBIDDEN => match status_error(response).await {
            RemoteError::Status { body, .. } if body.contains("too_large") => {
                Err(RemoteError::TooLarge(path.to_string()))
            }
            other => Err(other),
        },
        _ => Err(status_error(response).await),
    }
}

#[async_trait]
impl RemoteHost for GitHubHost {
    async fn resolve_branch(&self, repo: &Repository, branch: &str) -> HostReply<BranchHead> {
        let url = match self.endpoint(repo, &["branches", branch]) {
            Ok(u) => u,
            Err(e) => return HostReply::new(None, Err(e)),
        };
        let (quota, response) = self.get(repo, url).await;
        let result = match response {
            Ok(r) => read_branch(r, repo, branch).await,
            Err(e) => Err(e),
        };
        HostReply::new(quota, result)
    }

    async fn list_tree(&self, repo: &Repository, tree_sha: &str) -> HostReply<TreeListing> {
        let mut url = match self.endpoint(repo, &["git", "trees", tree_sha]) {
            Ok(u) => u,
            Err(e) => return HostReply::new(None, Err(e)),
        };
        url.query_pairs_mut().append_pair("recursive", "1");

        let (quota, response) = self.get(repo, url).await;
        let result = match response {
            Ok(r) => read_tree(r).await,
            Err(e) => Err(e),
        };
        HostReply::new(quota, result)
    }

    async fn diff(&self, repo: &Repository, base: &str, head: &str) -> HostReply<CommitDiff> {
        let range = format!("{}...{}", base, head);
        let url = match self.endpoint(repo, &["compare", &range]) {
            Ok(u) => u,
            Err(e) => return HostReply::new(None, Err(e)),
        };

        let (quota, response) = self.get(repo, url).await;
        let result = match response {
            Ok(r) => read_compare(r, base, head).await,
            Err(e) => Err(e),
        };
        HostReply::new(quota, result)
    }

    async fn fetch_content(
        &self,
        repo: &Repository,
        path: &str,
        reference: &str,
    ) -> HostReply<FileContent> {
        let segments: Vec<&str> = std::iter::once("contents")
            .chain(path.split('/').filter(|s| !s.is_empty()))
            .collect();
        let mut url = match self.endpoint(repo, &segments) {
            Ok(u) => u,
            Err(e) => return HostReply::new(None, Err(e)),
        };
        url.query_pairs_mut().append_pair("ref", reference);

        let (quota, response) = self.get(repo, url).await;
        let result = match response {
            Ok(r) => read_content(r, path).await,
            Err(e) => Err(e),
        };
        HostReply::new(quota, result)
    }
}
