use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file (if needed) and every table. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Create repositories table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            default_branch TEXT NOT NULL,
            credential_id TEXT NOT NULL DEFAULT 'default',
            last_commit_sha TEXT,
            last_synced_at INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(owner, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create sync_jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_jobs (
            id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            total_files INTEGER NOT NULL DEFAULT 0,
            processed_files INTEGER NOT NULL DEFAULT 0,
            skipped_files INTEGER NOT NULL DEFAULT 0,
            failed_files INTEGER NOT NULL DEFAULT 0,
            current_file TEXT,
            max_files INTEGER,
            skip_content INTEGER,
            full_sync INTEGER,
            worker_id TEXT,
            heartbeat_at INTEGER,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            error TEXT,
            FOREIGN KEY (repository_id) REFERENCES repositories(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create embed_jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embed_jobs (
            id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            files_processed INTEGER NOT NULL DEFAULT 0,
            chunks_created INTEGER NOT NULL DEFAULT 0,
            embeddings_generated INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            worker_id TEXT,
            heartbeat_at INTEGER,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            error TEXT,
            FOREIGN KEY (repository_id) REFERENCES repositories(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create files table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL,
            path TEXT NOT NULL,
            content TEXT,
            sha TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            encoding TEXT NOT NULL DEFAULT 'utf-8',
            skip_reason TEXT,
            language TEXT,
            line_count INTEGER,
            last_chunked_sha TEXT,
            updated_at INTEGER NOT NULL,
            UNIQUE(repository_id, path),
            FOREIGN KEY (repository_id) REFERENCES repositories(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create segments table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            start_char INTEGER NOT NULL,
            end_char INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB,
            embedding_model TEXT,
            embedding_dims INTEGER,
            embedded_at INTEGER,
            UNIQUE(file_id, chunk_index),
            FOREIGN KEY (file_id) REFERENCES files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create rate_limits table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rate_limits (
            credential_id TEXT PRIMARY KEY,
            remaining INTEGER NOT NULL,
            quota INTEGER NOT NULL,
            reset_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Columns added after the first schema version
    for (table, column, decl) in [
        ("sync_jobs", "worker_id", "TEXT"),
        ("sync_jobs", "heartbeat_at", "INTEGER"),
        ("embed_jobs", "worker_id", "TEXT"),
        ("embed_jobs", "heartbeat_at", "INTEGER"),
        ("segments", "embedding_model", "TEXT"),
        ("segments", "embedding_dims", "INTEGER"),
    ] {
        add_column_if_missing(pool, table, column, decl).await?;
    }

    // At most one non-terminal job per repository, enforced across processes
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_active
        ON sync_jobs(repository_id) WHERE status NOT IN ('COMPLETED', 'FAILED')
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_embed_jobs_active
        ON embed_jobs(repository_id) WHERE status NOT IN ('COMPLETED', 'FAILED')
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON sync_jobs(status, created_at)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embed_jobs_status ON embed_jobs(status, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_file_id ON segments(file_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_segments_unembedded ON segments(file_id) WHERE embedding IS NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let present: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = ?",
        table
    ))
    .bind(column)
    .fetch_one(pool)
    .await?;

    if present == 0 {
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
            .execute(pool)
            .await?;
    }
    Ok(())
}
