//! Retrying job execution with diagnostics and guaranteed cleanup.
//!
//! For each job [`JobExecutor`]:
//!
//! 1. downloads the source object into the work directory,
//! 2. runs the workflow under [`retry`], re-acquiring (and so re-probing)
//!    the pooled session before every attempt,
//! 3. uploads the result to the job's destination,
//! 4. when the workflow or session fails terminally, captures a screenshot
//!    and page snapshot from the session and uploads them side by side,
//! 5. always deletes every local file it created,
//! 6. fires a notification without waiting for it.
//!
//! Notifications still in flight are awaited, up to
//! [`NOTIFICATION_DRAIN_TIMEOUT`], by [`JobRunner::shutdown`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keymaster_cloud::{BlobStore, StorageError};
use keymaster_core::config::DiagnosticsConfig;
use keymaster_core::retry::{retry, RetryPolicy, Sleeper, TokioSleeper};
use keymaster_core::types::{Job, JobResult, ObjectRef};
use keymaster_events::Notifier;
use keymaster_session::{AutomationSession, SessionError, SessionFactory, SessionPool};
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::workflow::{Workflow, WorkflowError, WorkflowRun};

/// Upper bound on waiting for pending notifications at shutdown. Covers a
/// webhook send with its full retry schedule.
pub const NOTIFICATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Terminal failure of a job.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The source object could not be downloaded.
    #[error("Failed to fetch input: {0}")]
    Fetch(#[source] StorageError),

    /// The result could not be uploaded to its destination.
    #[error("Failed to upload output: {0}")]
    Upload(#[source] StorageError),

    /// The session could not be acquired on the last attempt.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The workflow failed on the last attempt.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// Preparing the work directory failed.
    #[error("Local I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// ArtifactBundle
// ---------------------------------------------------------------------------

/// Every local file a job creates. Owned by the executor for the job's
/// lifetime and removed by [`ArtifactBundle::cleanup`].
#[derive(Debug, Default)]
pub struct ArtifactBundle {
    pub input: PathBuf,
    /// One output path per attempt, whether or not it was written.
    pub outputs: Vec<PathBuf>,
    pub diagnostics: Vec<PathBuf>,
}

impl ArtifactBundle {
    pub fn new(input: PathBuf) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.input.as_path())
            .chain(self.outputs.iter().map(PathBuf::as_path))
            .chain(self.diagnostics.iter().map(PathBuf::as_path))
    }

    /// Remove every file. Missing files are fine; other failures are logged.
    pub async fn cleanup(&self) {
        for path in self.paths() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed temporary file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove temporary file",
                ),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// What the dispatcher needs from an executor.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` to completion. Never fails: errors become a failed result.
    async fn execute(&self, job: &Job) -> JobResult;

    /// Flush pending notifications, then release long-lived resources
    /// (the pooled session).
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// JobExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub work_dir: PathBuf,
    pub retry: RetryPolicy,
    pub diagnostics: DiagnosticsConfig,
    /// Notification channel; `None` disables notifications.
    pub notify_destination: Option<String>,
}

pub struct JobExecutor<F, W>
where
    F: SessionFactory,
    W: Workflow<Session = F::Session>,
{
    pool: Arc<SessionPool<F>>,
    workflow: W,
    store: Arc<dyn BlobStore>,
    notifier: Arc<dyn Notifier>,
    sleeper: Arc<dyn Sleeper>,
    notifications: TaskTracker,
    config: ExecutorConfig,
}

impl<F, W> JobExecutor<F, W>
where
    F: SessionFactory,
    W: Workflow<Session = F::Session>,
{
    pub fn new(
        pool: Arc<SessionPool<F>>,
        workflow: W,
        store: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            workflow,
            store,
            notifier,
            sleeper: Arc::new(TokioSleeper),
            notifications: TaskTracker::new(),
            config,
        }
    }

    /// Replace the sleeper used between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn pool(&self) -> &Arc<SessionPool<F>> {
        &self.pool
    }

    pub fn workflow(&self) -> &W {
        &self.workflow
    }

    /// Run one job end to end and return where its output was written.
    pub async fn run_job(&self, job: &Job) -> Result<ObjectRef, ExecutionError> {
        let input = self
            .config
            .work_dir
            .join(format!("input_{}.zip", Uuid::new_v4().simple()));
        let mut bundle = ArtifactBundle::new(input);

        let result = self.run_stages(job, &mut bundle).await;

        // Only a session or workflow failure leaves this job's page behind.
        let from_session = matches!(
            result,
            Err(ExecutionError::Session(_) | ExecutionError::Workflow(_))
        );
        if from_session && self.config.diagnostics.enabled {
            self.capture_diagnostics(job, &mut bundle).await;
        }
        bundle.cleanup().await;

        result
    }

    async fn run_stages(&self, job: &Job, bundle: &mut ArtifactBundle) -> Result<ObjectRef, ExecutionError> {
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(|source| ExecutionError::Io {
                path: self.config.work_dir.clone(),
                source,
            })?;

        self.store
            .get(&job.source, &bundle.input)
            .await
            .map_err(ExecutionError::Fetch)?;
        tracing::debug!(path = %bundle.input.display(), "Input downloaded");

        let input_path = bundle.input.clone();
        let outputs = &mut bundle.outputs;
        let outcome = retry(&self.config.retry, self.sleeper.as_ref(), |attempt| {
            let run = WorkflowRun {
                job: job.clone(),
                attempt,
                run_id: short_run_id(),
                input_path: input_path.clone(),
                output_path: self
                    .config
                    .work_dir
                    .join(format!("output_{}_{}.zip", job.id.simple(), attempt)),
            };
            outputs.push(run.output_path.clone());
            async move { self.attempt(run).await }
        })
        .await;

        let output = match outcome.result {
            Ok(path) => {
                tracing::debug!(attempts = outcome.attempts.len(), "Workflow succeeded");
                path
            }
            Err(e) => {
                tracing::warn!(
                    attempts = outcome.attempts.len(),
                    error = %e,
                    "Workflow failed on every attempt",
                );
                return Err(e);
            }
        };

        self.store
            .put(&output, &job.destination)
            .await
            .map_err(ExecutionError::Upload)?;

        Ok(job.destination.clone())
    }

    /// One attempt: lease the session, run the workflow, check the output.
    async fn attempt(&self, run: WorkflowRun) -> Result<PathBuf, ExecutionError> {
        let mut lease = self.pool.acquire().await?;
        tracing::info!(
            attempt = run.attempt,
            run_id = %run.run_id,
            session_uses = lease.request_count(),
            "Running workflow",
        );

        self.workflow.run(&mut lease, &run).await?;
        drop(lease);

        match tokio::fs::try_exists(&run.output_path).await {
            Ok(true) => Ok(run.output_path),
            _ => Err(WorkflowError::Transient(format!(
                "workflow finished without writing {}",
                run.output_path.display()
            ))
            .into()),
        }
    }

    /// Best-effort screenshot and page snapshot from whatever state the
    /// last attempt left the session in. Never fails.
    async fn capture_diagnostics(&self, job: &Job, bundle: &mut ArtifactBundle) {
        let Some(lease) = self.pool.inspect().await else {
            tracing::debug!("No live session, skipping failure diagnostics");
            return;
        };
        let screenshot = lease.session().screenshot().await;
        let snapshot = lease.session().page_snapshot().await;
        drop(lease);

        let bucket = self
            .config
            .diagnostics
            .bucket
            .clone()
            .unwrap_or_else(|| job.destination.bucket.clone());
        let base_key = format!("{}{}", self.config.diagnostics.prefix, job.debug_tag);

        match screenshot {
            Ok(bytes) => {
                let path = self.config.work_dir.join(format!("{}.png", job.debug_tag));
                bundle.diagnostics.push(path.clone());
                let target = ObjectRef::new(&bucket, format!("{base_key}/screenshot.png"));
                self.upload_diagnostic(&path, &bytes, &target).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to capture screenshot"),
        }

        match snapshot {
            Ok(html) => {
                let path = self.config.work_dir.join(format!("{}.html", job.debug_tag));
                bundle.diagnostics.push(path.clone());
                let target = ObjectRef::new(&bucket, format!("{base_key}/page.html"));
                self.upload_diagnostic(&path, html.as_bytes(), &target).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to capture page snapshot"),
        }
    }

    async fn upload_diagnostic(&self, path: &Path, bytes: &[u8], target: &ObjectRef) {
        if let Err(e) = tokio::fs::write(path, bytes).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write diagnostic file");
            return;
        }
        match self.store.put(path, target).await {
            Ok(()) => tracing::info!(object = %target, "Uploaded failure diagnostic"),
            Err(e) => tracing::warn!(object = %target, error = %e, "Failed to upload failure diagnostic"),
        }
    }

    /// Send `text` in the background; failures are only logged.
    fn notify(&self, text: String) {
        let Some(destination) = self.config.notify_destination.clone() else {
            return;
        };
        let notifier = Arc::clone(&self.notifier);
        self.notifications.spawn(
            async move {
                if let Err(e) = notifier.send(&destination, &text).await {
                    tracing::warn!(error = %e, "Notification failed");
                }
            }
            .in_current_span(),
        );
    }
}

#[async_trait::async_trait]
impl<F, W> JobRunner for JobExecutor<F, W>
where
    F: SessionFactory,
    W: Workflow<Session = F::Session>,
{
    async fn execute(&self, job: &Job) -> JobResult {
        let span = tracing::info_span!("job", job_id = %job.id, source = %job.source);
        async {
            tracing::info!(destination = %job.destination, "Job started");
            match self.run_job(job).await {
                Ok(destination) => {
                    tracing::info!(destination = %destination, "Job completed");
                    self.notify(format!("Processed {} -> {}", job.source, destination));
                    JobResult::succeeded(&job.source, &destination)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Job failed");
                    self.notify(format!("Failed {}: {}", job.source, e));
                    JobResult::failed(job.source.to_string(), e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn shutdown(&self) {
        self.notifications.close();
        if tokio::time::timeout(NOTIFICATION_DRAIN_TIMEOUT, self.notifications.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = self.notifications.len(),
                "Gave up waiting for pending notifications",
            );
        }
        self.pool.close().await;
    }
}

fn short_run_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
