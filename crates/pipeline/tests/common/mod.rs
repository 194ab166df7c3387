//! Shared fakes for pipeline integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keymaster_cloud::{BlobStore, LocalBlobStore, StorageError};
use keymaster_core::config::DiagnosticsConfig;
use keymaster_core::retry::{RetryPolicy, Sleeper};
use keymaster_core::types::ObjectRef;
use keymaster_events::{Notifier, NotifyError};
use keymaster_pipeline::{ExecutorConfig, JobExecutor, Workflow, WorkflowError, WorkflowRun};
use keymaster_session::{
    AutomationSession, PoolConfig, SessionError, SessionFactory, SessionHealth, SessionLease,
    SessionPool,
};

pub const BUCKET: &str = "assets";

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SessionStats {
    pub created: AtomicU64,
    pub closed: AtomicU64,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub fail_screenshot: AtomicBool,
}

pub struct FakeSession {
    stats: Arc<SessionStats>,
}

#[async_trait::async_trait]
impl AutomationSession for FakeSession {
    async fn probe(&self) -> Result<SessionHealth, SessionError> {
        Ok(SessionHealth::Healthy)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, SessionError> {
        if self.stats.fail_screenshot.load(Ordering::SeqCst) {
            return Err(SessionError::Remote("screenshot failed".into()));
        }
        Ok(b"\x89PNG".to_vec())
    }

    async fn page_snapshot(&self) -> Result<String, SessionError> {
        Ok("<html>failed</html>".into())
    }

    async fn close(self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeFactory {
    pub stats: Arc<SessionStats>,
}

#[async_trait::async_trait]
impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    async fn create(&self) -> Result<FakeSession, SessionError> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            stats: Arc::clone(&self.stats),
        })
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Fails the first `fail_first` attempts of every job, then writes
/// `processed:<input>` to the output path.
pub struct ScriptedWorkflow {
    pub fail_first: u32,
    pub calls: AtomicU32,
    pub hold: Duration,
    pub stats: Arc<SessionStats>,
    pub run_ids: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Workflow for ScriptedWorkflow {
    type Session = FakeSession;

    async fn run(
        &self,
        lease: &mut SessionLease<'_, FakeSession>,
        run: &WorkflowRun,
    ) -> Result<(), WorkflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.run_ids.lock().unwrap().push(run.run_id.clone());

        let now = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.stats.active.fetch_sub(1, Ordering::SeqCst);

        if !lease.is_authenticated() {
            lease.mark_authenticated();
        }

        if run.attempt <= self.fail_first {
            return Err(WorkflowError::Transient(format!(
                "asset row not visible (attempt {})",
                run.attempt
            )));
        }

        let input = tokio::fs::read(&run.input_path)
            .await
            .map_err(|source| WorkflowError::Io {
                path: run.input_path.clone(),
                source,
            })?;
        let mut output = b"processed:".to_vec();
        output.extend_from_slice(&input);
        tokio::fs::write(&run.output_path, output)
            .await
            .map_err(|source| WorkflowError::Io {
                path: run.output_path.clone(),
                source,
            })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Local store that can be told to reject uploads under a key prefix.
pub struct TestStore {
    pub inner: LocalBlobStore,
    pub reject_puts_under: Mutex<Option<String>>,
    pub puts: Mutex<Vec<ObjectRef>>,
}

impl TestStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalBlobStore::new(root),
            reject_puts_under: Mutex::new(None),
            puts: Mutex::new(Vec::new()),
        }
    }

    pub fn puts_under(&self, prefix: &str) -> Vec<ObjectRef> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl BlobStore for TestStore {
    async fn get(&self, object: &ObjectRef, local_path: &Path) -> Result<(), StorageError> {
        self.inner.get(object, local_path).await
    }

    async fn put(&self, local_path: &Path, object: &ObjectRef) -> Result<(), StorageError> {
        self.puts.lock().unwrap().push(object.clone());
        let reject = self.reject_puts_under.lock().unwrap().clone();
        if let Some(prefix) = reject {
            if object.key.starts_with(&prefix) {
                return Err(StorageError::Remote {
                    object: object.to_string(),
                    message: "AccessDenied".into(),
                });
            }
        }
        self.inner.put(local_path, object).await
    }
}

// ---------------------------------------------------------------------------
// Notifier and sleeper
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<String>>,
    /// Simulated delivery latency.
    pub delay: Mutex<Duration>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, _destination: &str, text: &str) -> Result<(), NotifyError> {
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.sent.lock().unwrap().push(text.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::HttpStatus(500));
        }
        Ok(())
    }
}

impl RecordingNotifier {
    /// Wait for `count` messages; notifications are sent from spawned tasks.
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let sent = self.sent.lock().unwrap().clone();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    pub slept: Mutex<Vec<Duration>>,
}

#[async_trait::async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub type TestExecutor = JobExecutor<FakeFactory, ScriptedWorkflow>;

pub struct Harness {
    pub executor: Arc<TestExecutor>,
    pub stats: Arc<SessionStats>,
    pub store: Arc<TestStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub sleeper: Arc<RecordingSleeper>,
    pub store_root: tempfile::TempDir,
    pub work_dir: tempfile::TempDir,
}

pub struct HarnessOptions {
    pub fail_first: u32,
    pub hold: Duration,
    pub diagnostics: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            fail_first: 0,
            hold: Duration::ZERO,
            diagnostics: true,
        }
    }
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let store_root = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(SessionStats::default());
        let store = Arc::new(TestStore::new(store_root.path()));
        let notifier = Arc::new(RecordingNotifier::default());
        let sleeper = Arc::new(RecordingSleeper::default());

        let pool = Arc::new(SessionPool::new(
            FakeFactory {
                stats: Arc::clone(&stats),
            },
            PoolConfig {
                restart_threshold: 25,
                probe_timeout: Duration::from_secs(1),
                close_timeout: Duration::from_secs(1),
            },
        ));
        let workflow = ScriptedWorkflow {
            fail_first: options.fail_first,
            calls: AtomicU32::new(0),
            hold: options.hold,
            stats: Arc::clone(&stats),
            run_ids: Mutex::new(Vec::new()),
        };
        let config = ExecutorConfig {
            work_dir: work_dir.path().to_path_buf(),
            retry: RetryPolicy::from_secs(&[0, 1, 2, 4]),
            diagnostics: DiagnosticsConfig {
                enabled: options.diagnostics,
                bucket: None,
                prefix: "debug/".into(),
            },
            notify_destination: Some("https://hooks.example/ops".into()),
        };

        let executor = JobExecutor::new(
            pool,
            workflow,
            Arc::clone(&store) as Arc<dyn BlobStore>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            config,
        )
        .with_sleeper(Arc::clone(&sleeper) as Arc<dyn Sleeper>);

        Self {
            executor: Arc::new(executor),
            stats,
            store,
            notifier,
            sleeper,
            store_root,
            work_dir,
        }
    }

    /// Place an input object in the store.
    pub async fn seed(&self, key: &str, content: &[u8]) -> ObjectRef {
        let object = ObjectRef::new(BUCKET, key);
        let path = self.store.inner.path_for(&object);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, content).await.unwrap();
        object
    }

    pub fn stored_path(&self, object: &ObjectRef) -> PathBuf {
        self.store.inner.path_for(object)
    }

    /// Files left in the work directory.
    pub fn leftover_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.work_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    pub fn workflow_calls(&self) -> u32 {
        self.executor_workflow().calls.load(Ordering::SeqCst)
    }

    fn executor_workflow(&self) -> &ScriptedWorkflow {
        self.executor.workflow()
    }
}
