//! `keymaster-worker` -- escrows uploaded asset archives through the
//! creator portal.
//!
//! Watches a queue of storage notifications (or dispatches one event file),
//! drives a WebDriver browser through the portal's upload flow for each new
//! archive and writes the processed archive back to object storage.
//!
//! See `keymaster_core::config` for the full environment variable table.
//! Logging honours `RUST_LOG`; set `LOG_FORMAT=json` for JSON lines.

use std::sync::Arc;

use keymaster_cloud::{BlobStore, S3BlobStore, SqsQueue};
use keymaster_core::config::{WorkerConfig, WorkerMode};
use keymaster_events::{NoopNotifier, Notifier, WebhookNotifier};
use keymaster_pipeline::{ConcurrencyGate, Dispatcher, ExecutorConfig, JobExecutor};
use keymaster_session::{PoolConfig, SessionPool, WebDriverSessionFactory};
use keymaster_worker::worker_loop::worst_case_job_duration;
use keymaster_worker::{dispatch_payload, shutdown, PortalUploadWorkflow, WorkerLoop, WorkerSettings};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "keymaster_worker=info,keymaster_pipeline=info,keymaster_session=info".into()
            }),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let config = WorkerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    tracing::info!(
        mode = ?config.mode,
        webdriver_url = %config.browser.webdriver_url,
        portal = %config.portal.base_url,
        input_prefix = %config.routing.input_prefix,
        output_prefix = %config.routing.output_prefix,
        max_concurrent_jobs = config.max_concurrent_jobs,
        max_attempts = config.retry.max_attempts(),
        "Starting keymaster-worker",
    );

    if config.max_concurrent_jobs > 1 {
        tracing::warn!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            "Jobs share a single browser session; extra concurrency only overlaps storage transfers",
        );
    }

    // --- Collaborators ---
    let aws = keymaster_cloud::load_aws_config().await;
    let store: Arc<dyn BlobStore> = Arc::new(S3BlobStore::from_config(&aws));
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(_) => Arc::new(WebhookNotifier::new()),
        None => Arc::new(NoopNotifier),
    };

    let pool = Arc::new(SessionPool::new(
        WebDriverSessionFactory::from_config(&config.browser),
        PoolConfig {
            restart_threshold: config.restart_threshold,
            probe_timeout: config.probe_timeout,
            ..PoolConfig::default()
        },
    ));
    let workflow = PortalUploadWorkflow::new(config.portal.clone());
    let per_attempt = workflow.timeouts().worst_case();

    let executor = JobExecutor::new(
        pool,
        workflow,
        store,
        notifier,
        ExecutorConfig {
            work_dir: config.work_dir.clone(),
            retry: config.retry.clone(),
            diagnostics: config.diagnostics.clone(),
            notify_destination: config.notify_webhook_url.clone(),
        },
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(executor),
        ConcurrencyGate::new(config.max_concurrent_jobs),
        config.routing.clone(),
    ));

    match config.mode {
        WorkerMode::Queue => {
            let Some(queue_config) = config.queue.as_ref() else {
                tracing::error!("QUEUE_URL must be set in queue mode");
                std::process::exit(1);
            };

            let worst_case = worst_case_job_duration(&config.retry, per_attempt);
            if queue_config.visibility_timeout < worst_case {
                tracing::warn!(
                    visibility_timeout_secs = queue_config.visibility_timeout.as_secs(),
                    worst_case_secs = worst_case.as_secs(),
                    "Visibility timeout is below the worst-case job duration; \
                     slow jobs may be redelivered and processed twice",
                );
            }

            let queue = Arc::new(SqsQueue::from_config(&aws, &queue_config.queue_url));
            let worker = WorkerLoop::new(queue, dispatcher, WorkerSettings::from(queue_config));

            let cancel = CancellationToken::new();
            let signal_handle = shutdown::cancel_on_signal(cancel.clone());

            let stats = worker.run(cancel.clone()).await;
            cancel.cancel();
            let _ = signal_handle.await;

            tracing::info!(
                batches = stats.batches,
                deleted = stats.deleted,
                failed = stats.failed,
                "Graceful shutdown complete",
            );
        }
        WorkerMode::Once => {
            let Some(path) = config.event_file.as_ref() else {
                tracing::error!("EVENT_FILE must be set in once mode");
                std::process::exit(1);
            };
            let body = tokio::fs::read_to_string(path).await.unwrap_or_else(|e| {
                tracing::error!(path = %path.display(), error = %e, "Failed to read event file");
                std::process::exit(1);
            });

            let outcome = dispatch_payload(&dispatcher, &path.display().to_string(), &body).await;
            dispatcher.shutdown().await;

            println!("{}", outcome.to_response());
            if !outcome.is_success() {
                std::process::exit(2);
            }
        }
    }
}
