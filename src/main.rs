//! # Repo Indexer CLI (`rix`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rix init` | Create the SQLite database and schema |
//! | `rix repo add <owner/name>` | Track a repository |
//! | `rix repo list` | List tracked repositories |
//! | `rix sync <owner/name>` | Enqueue a sync job (idempotent) |
//! | `rix sync --all` | Enqueue a sync job for every repository |
//! | `rix embed <owner/name>` | Enqueue an embed job (idempotent) |
//! | `rix status <owner/name>` | Latest sync and embed job |
//! | `rix recover` | Fail jobs whose worker lease has expired |
//! | `rix worker` | Run the job polling loop |
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG` to override the
//! `--log-level` default.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use repo_indexer::config::{self, Config};
use repo_indexer::embedding::{create_provider, DisabledProvider, EmbeddingProvider};
use repo_indexer::models::{Repository, SyncOptions};
use repo_indexer::progress::{LogObserver, Observers, ProgressMode, WebhookObserver};
use repo_indexer::remote::github::GitHubHost;
use repo_indexer::worker::Worker;
use repo_indexer::{db, jobs, migrate, repos};

/// Repo Indexer: mirror remote repositories, segment and embed their files.
#[derive(Parser)]
#[command(name = "rix", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/indexer.toml")]
    config: PathBuf,

    /// Default log level when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage tracked repositories.
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Enqueue a sync job.
    ///
    /// Prints the job id. If the repository already has an active sync job
    /// its id is printed instead.
    Sync {
        /// Repository as `owner/name`.
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        repo: Option<String>,

        /// Enqueue for every tracked repository.
        #[arg(long)]
        all: bool,

        /// Process at most this many files.
        #[arg(long)]
        max_files: Option<u32>,

        /// Track files as metadata only, without fetching content.
        #[arg(long)]
        skip_content: bool,

        /// List the whole tree instead of diffing against the last sync.
        #[arg(long)]
        full: bool,
    },

    /// Enqueue an embed job.
    Embed {
        /// Repository as `owner/name`.
        repo: String,
    },

    /// Show the latest sync and embed job of a repository.
    Status {
        /// Repository as `owner/name`.
        repo: String,
    },

    /// Fail jobs left active by a worker that did not shut down cleanly.
    Recover,

    /// Run the worker loop.
    Worker {
        /// Run until both queues are empty, then exit.
        #[arg(long)]
        once: bool,

        /// Progress on stderr: off, human, or json. Defaults to human on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },
}

#[derive(Subcommand)]
enum RepoAction {
    /// Track a repository (updates branch and credential if already tracked).
    Add {
        /// Repository as `owner/name`.
        repo: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Credential id from `[remote.credentials]`.
        #[arg(long, default_value = "default")]
        credential: String,
    },
    /// List tracked repositories.
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("repo_indexer={log_level},rix={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn open(cfg: &Config) -> Result<SqlitePool> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(pool)
}

async fn lookup(pool: &SqlitePool, full_name: &str) -> Result<Repository> {
    let (owner, name) = repos::parse_full_name(full_name)?;
    match repos::find_repository(pool, &owner, &name).await? {
        Some(repo) => Ok(repo),
        None => bail!(
            "repository {}/{} is not tracked; add it with `rix repo add`",
            owner,
            name
        ),
    }
}

/// Longest wait for webhook posts before the process exits.
const WEBHOOK_FLUSH: Duration = Duration::from_secs(10);

/// A worker wired to the configured observers. The webhook is returned as
/// well so its posts can be flushed before exit.
fn build_worker(
    pool: SqlitePool,
    cfg: &Config,
    mode: ProgressMode,
    provider: Arc<dyn EmbeddingProvider>,
) -> Result<(Worker, Option<Arc<WebhookObserver>>)> {
    let mut observers = Observers::new()
        .with(Arc::new(LogObserver))
        .with(mode.observer());
    let webhook = match &cfg.notify.webhook_url {
        Some(url) => Some(Arc::new(WebhookObserver::new(url.clone())?)),
        None => None,
    };
    if let Some(hook) = &webhook {
        observers = observers.with(hook.clone());
    }

    let worker = Worker::new(
        pool,
        cfg,
        Arc::new(GitHubHost::new(&cfg.remote)?),
        provider,
        Arc::new(observers),
    )?;
    Ok((worker, webhook))
}

async fn flush_webhook(webhook: Option<Arc<WebhookObserver>>) {
    if let Some(hook) = webhook {
        hook.flush(WEBHOOK_FLUSH).await;
    }
}

fn format_time(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Repo { action } => {
            let pool = open(&cfg).await?;
            match action {
                RepoAction::Add {
                    repo,
                    branch,
                    credential,
                } => {
                    let (owner, name) = repos::parse_full_name(&repo)?;
                    let repo = repos::add_repository(&pool, &owner, &name, &branch, &credential)
                        .await?;
                    println!("{}  {}  branch={}", repo.id, repo.full_name(), repo.default_branch);
                }
                RepoAction::List => {
                    let all = repos::list_repositories(&pool).await?;
                    if all.is_empty() {
                        println!("No repositories tracked.");
                    }
                    for repo in all {
                        println!(
                            "{:<40} {:<12} {:<12} {}",
                            repo.full_name(),
                            repo.default_branch,
                            repo.credential_id,
                            repo.last_commit_sha.as_deref().unwrap_or("never synced")
                        );
                    }
                }
            }
        }
        Commands::Sync {
            repo,
            all,
            max_files,
            skip_content,
            full,
        } => {
            let pool = open(&cfg).await?;
            let options = SyncOptions {
                max_files,
                skip_content: skip_content.then_some(true),
                full_sync: full.then_some(true),
            };
            let targets = if all {
                repos::list_repositories(&pool).await?
            } else {
                match repo {
                    Some(full_name) => vec![lookup(&pool, &full_name).await?],
                    None => bail!("either a repository or --all is required"),
                }
            };
            for repo in targets {
                let id = jobs::create_sync_job(&pool, &repo.id, &options).await?;
                println!("{}  {}", id, repo.full_name());
            }
        }
        Commands::Embed { repo } => {
            let pool = open(&cfg).await?;
            let repo = lookup(&pool, &repo).await?;
            let id = jobs::create_embed_job(&pool, &repo.id).await?;
            println!("{}  {}", id, repo.full_name());
        }
        Commands::Status { repo } => {
            let pool = open(&cfg).await?;
            let repo = lookup(&pool, &repo).await?;
            println!(
                "{}  last commit: {}  synced: {}",
                repo.full_name(),
                repo.last_commit_sha.as_deref().unwrap_or("-"),
                format_time(repo.last_synced_at)
            );

            match jobs::latest_sync_job(&pool, &repo.id).await? {
                None => println!("sync:  no job ever run"),
                Some(job) => {
                    println!(
                        "sync:  {}  {}  files {}/{}  skipped {}  failed {}  started {}  finished {}",
                        job.id,
                        job.status,
                        job.processed_files,
                        job.total_files,
                        job.skipped_files,
                        job.failed_files,
                        format_time(job.started_at),
                        format_time(job.completed_at)
                    );
                    if let Some(err) = job.error {
                        println!("       error: {}", err);
                    }
                }
            }
            match jobs::latest_embed_job(&pool, &repo.id).await? {
                None => println!("embed: no job ever run"),
                Some(job) => {
                    println!(
                        "embed: {}  {}  files {}  chunks {}  embeddings {}  failed {}  started {}  finished {}",
                        job.id,
                        job.status,
                        job.files_processed,
                        job.chunks_created,
                        job.embeddings_generated,
                        job.failed_count,
                        format_time(job.started_at),
                        format_time(job.completed_at)
                    );
                    if let Some(err) = job.error {
                        println!("       error: {}", err);
                    }
                }
            }
        }
        Commands::Recover => {
            let pool = open(&cfg).await?;
            // Recovery never embeds, so no provider credentials are needed.
            let (worker, webhook) =
                build_worker(pool, &cfg, ProgressMode::Off, Arc::new(DisabledProvider))?;
            let recovery = worker.recover_stale().await?;
            println!(
                "Recovered {} sync job(s) and {} embed job(s).",
                recovery.sync_jobs.len(),
                recovery.embed_jobs.len()
            );
            flush_webhook(webhook).await;
        }
        Commands::Worker { once, progress } => {
            let pool = open(&cfg).await?;
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);

            let (worker, webhook) =
                build_worker(pool, &cfg, mode, create_provider(&cfg.embedding)?)?;

            if once {
                worker.recover().await?;
                let ran = worker.drain().await;
                flush_webhook(webhook).await;
                info!(jobs = ran?, "queue drained");
                return Ok(());
            }

            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested, finishing the current job");
                    let _ = stop_tx.send(true);
                }
            });
            let result = worker.run(stop_rx).await;
            flush_webhook(webhook).await;
            result?;
        }
    }

    Ok(())
}
