//! Job progress reporting.
//!
//! The worker emits [`JobEvent`]s at file granularity during sync and at
//! batch granularity during embedding, plus one terminal event per job.
//! Observers are best-effort: [`JobObserver::notify`] cannot fail, and a
//! delivery problem never reaches the job. The webhook posts in background
//! tasks; call [`WebhookObserver::flush`] before the runtime shuts down.
//!
//! Terminal output goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::JobKind;

/// Counts and position of a running job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobProgress {
    pub job_id: String,
    pub kind: JobKind,
    /// `owner/name`.
    pub repository: String,
    pub status: String,
    pub processed: u64,
    pub total: u64,
    pub current: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    Progress(JobProgress),
    Completed {
        job_id: String,
        kind: JobKind,
        repository: String,
        summary: String,
    },
    Failed {
        job_id: String,
        kind: JobKind,
        repository: String,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Progress(p) => &p.job_id,
            JobEvent::Completed { job_id, .. } | JobEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress(_))
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            JobEvent::Progress(p) => serde_json::json!({
                "event": "progress",
                "job_id": p.job_id,
                "kind": p.kind.as_str(),
                "repository": p.repository,
                "status": p.status,
                "processed": p.processed,
                "total": p.total,
                "current": p.current,
                "error": p.error,
            }),
            JobEvent::Completed {
                job_id,
                kind,
                repository,
                summary,
            } => serde_json::json!({
                "event": "completed",
                "job_id": job_id,
                "kind": kind.as_str(),
                "repository": repository,
                "summary": summary,
            }),
            JobEvent::Failed {
                job_id,
                kind,
                repository,
                error,
            } => serde_json::json!({
                "event": "failed",
                "job_id": job_id,
                "kind": kind.as_str(),
                "repository": repository,
                "error": error,
            }),
        }
    }
}

/// Receives job events. Implementations must not block for long and must
/// swallow their own delivery errors.
pub trait JobObserver: Send + Sync {
    fn notify(&self, event: &JobEvent);
}

/// Terminal events to the tracing log.
pub struct LogObserver;

impl JobObserver for LogObserver {
    fn notify(&self, event: &JobEvent) {
        match event {
            JobEvent::Progress(_) => {}
            JobEvent::Completed {
                job_id,
                kind,
                repository,
                summary,
            } => info!(%job_id, %kind, %repository, "job completed: {}", summary),
            JobEvent::Failed {
                job_id,
                kind,
                repository,
                error,
            } => warn!(%job_id, %kind, %repository, %error, "job failed"),
        }
    }
}

/// Human-friendly progress on stderr:
/// `sync acme/widgets  PROCESSING_FILES  1,234 / 5,000  src/lib.rs`.
pub struct StderrProgress;

impl JobObserver for StderrProgress {
    fn notify(&self, event: &JobEvent) {
        let line = match event {
            JobEvent::Progress(p) => format!(
                "{} {}  {}  {} / {}{}\n",
                p.kind,
                p.repository,
                p.status,
                format_number(p.processed),
                format_number(p.total),
                p.current
                    .as_deref()
                    .map(|c| format!("  {}", c))
                    .unwrap_or_default()
            ),
            JobEvent::Completed {
                kind,
                repository,
                summary,
                ..
            } => format!("{} {}  done  {}\n", kind, repository, summary),
            JobEvent::Failed {
                kind,
                repository,
                error,
                ..
            } => format!("{} {}  FAILED  {}\n", kind, repository, error),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JobObserver for JsonProgress {
    fn notify(&self, event: &JobEvent) {
        if let Ok(line) = serde_json::to_string(&event.to_json()) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl JobObserver for NoProgress {
    fn notify(&self, _event: &JobEvent) {}
}

/// Posts terminal events to a chat-style webhook in a background task.
pub struct WebhookObserver {
    url: String,
    client: reqwest::Client,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl WebhookObserver {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Wait up to `timeout` for posts still in flight. Returns `false` if
    /// some were abandoned.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let handles = std::mem::take(&mut *self.lock_pending());
        if handles.is_empty() {
            return true;
        }
        let count = handles.len();
        let wait = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => {
                debug!(count, "webhook posts delivered");
                true
            }
            Err(_) => {
                warn!(
                    count,
                    timeout_ms = timeout.as_millis() as u64,
                    "webhook posts still pending, giving up"
                );
                false
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobObserver for WebhookObserver {
    fn notify(&self, event: &JobEvent) {
        if !event.is_terminal() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let request = self.client.post(&self.url).json(&event.to_json());
        let job_id = event.job_id().to_string();
        let task = handle.spawn(async move {
            match request.send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(%job_id, status = %resp.status(), "webhook rejected job event")
                }
                Err(e) => warn!(%job_id, error = %e, "webhook delivery failed"),
                Ok(_) => {}
            }
        });
        let mut pending = self.lock_pending();
        pending.retain(|h| !h.is_finished());
        pending.push(task);
    }
}

/// Fans one event out to several observers.
#[derive(Default, Clone)]
pub struct Observers {
    inner: Vec<Arc<dyn JobObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.inner.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl JobObserver for Observers {
    fn notify(&self, event: &JobEvent) {
        for observer in &self.inner {
            observer.notify(event);
        }
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn observer(&self) -> Arc<dyn JobObserver> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
