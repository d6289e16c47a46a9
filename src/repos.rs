//! Tracked repositories.
//!
//! A repository row names the remote (`owner/name`), the branch to mirror,
//! the credential used for its requests, and the head commit of the last
//! successful sync, which drives incremental diffs.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::Repository;

/// Split `owner/name`.
pub fn parse_full_name(full_name: &str) -> Result<(String, String)> {
    match full_name.trim().split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner.to_string(), name.trim_end_matches(".git").to_string()))
        }
        _ => bail!("expected repository as 'owner/name', got '{}'", full_name),
    }
}

fn row_to_repository(row: &SqliteRow) -> Repository {
    Repository {
        id: row.get("id"),
        owner: row.get("owner"),
        name: row.get("name"),
        default_branch: row.get("default_branch"),
        credential_id: row.get("credential_id"),
        last_commit_sha: row.get("last_commit_sha"),
        last_synced_at: row.get("last_synced_at"),
        created_at: row.get("created_at"),
    }
}

/// Insert a repository, or update branch and credential of an existing one.
pub async fn add_repository(
    pool: &SqlitePool,
    owner: &str,
    name: &str,
    branch: &str,
    credential_id: &str,
) -> Result<Repository> {
    sqlx::query(
        r#"
        INSERT INTO repositories (id, owner, name, default_branch, credential_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(owner, name) DO UPDATE SET
            default_branch = excluded.default_branch,
            credential_id = excluded.credential_id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(owner)
    .bind(name)
    .bind(branch)
    .bind(credential_id)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    match find_repository(pool, owner, name).await? {
        Some(repo) => Ok(repo),
        None => bail!("repository {}/{} vanished after insert", owner, name),
    }
}

pub async fn get_repository(pool: &SqlitePool, id: &str) -> Result<Option<Repository>> {
    let row = sqlx::query("SELECT * FROM repositories WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_repository))
}

pub async fn find_repository(
    pool: &SqlitePool,
    owner: &str,
    name: &str,
) -> Result<Option<Repository>> {
    let row = sqlx::query("SELECT * FROM repositories WHERE owner = ? AND name = ?")
        .bind(owner)
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_repository))
}

pub async fn list_repositories(pool: &SqlitePool) -> Result<Vec<Repository>> {
    let rows = sqlx::query("SELECT * FROM repositories ORDER BY owner, name")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_repository).collect())
}

/// Record the head commit a sync brought the mirror up to.
pub async fn mark_synced(pool: &SqlitePool, id: &str, commit_sha: &str) -> Result<()> {
    sqlx::query("UPDATE repositories SET last_commit_sha = ?, last_synced_at = ? WHERE id = ?")
        .bind(commit_sha)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn full_names() {
        assert_eq!(
            parse_full_name("acme/widgets").unwrap(),
            ("acme".to_string(), "widgets".to_string())
        );
        assert_eq!(parse_full_name("acme/widgets.git").unwrap().1, "widgets");
        assert!(parse_full_name("widgets").is_err());
        assert!(parse_full_name("a/b/c").is_err());
        assert!(parse_full_name("/b").is_err());
    }

    #[tokio::test]
    async fn add_is_upsert() {
        let (_tmp, pool) = test_pool().await;
        let first = add_repository(&pool, "acme", "widgets", "main", "default")
            .await
            .unwrap();
        let second = add_repository(&pool, "acme", "widgets", "develop", "acme")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.default_branch, "develop");
        assert_eq!(second.credential_id, "acme");
        assert_eq!(list_repositories(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_synced_records_commit() {
        let (_tmp, pool) = test_pool().await;
        let repo = add_repository(&pool, "acme", "widgets", "main", "default")
            .await
            .unwrap();
        assert!(repo.last_commit_sha.is_none());
        mark_synced(&pool, &repo.id, "c1").await.unwrap();
        let repo = get_repository(&pool, &repo.id).await.unwrap().unwrap();
        assert_eq!(repo.last_commit_sha.as_deref(), Some("c1"));
        assert!(repo.last_synced_at.is_some());
    }
}
