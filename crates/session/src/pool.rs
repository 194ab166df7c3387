//! Singleton session pool with health checks and a restart policy.
//!
//! All state lives behind one [`tokio::sync::Mutex`]. [`SessionPool::acquire`]
//! takes the lock, makes sure a healthy session exists and returns a
//! [`SessionLease`] that keeps holding the lock until it is dropped. Two
//! jobs therefore never drive the session at the same time, whatever the
//! dispatcher's concurrency.

use std::time::Duration;

use chrono::{DateTime, Utc};
use keymaster_core::config::{DEFAULT_PROBE_TIMEOUT_SECS, DEFAULT_RESTART_THRESHOLD};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

/// Default budget for releasing a session before it is abandoned.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Result of a liveness probe that reached the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHealth {
    Healthy,
    /// The session answered but is parked on an error indicator.
    ErrorPage(String),
}

/// A live external automation session.
#[async_trait::async_trait]
pub trait AutomationSession: Send + Sync + 'static {
    /// Cheap check that the session is still usable.
    async fn probe(&self) -> Result<SessionHealth, SessionError>;

    /// PNG screenshot of the current view.
    async fn screenshot(&self) -> Result<Vec<u8>, SessionError>;

    /// Full markup of the current page.
    async fn page_snapshot(&self) -> Result<String, SessionError>;

    /// Release every sub-resource. Individual release failures are logged
    /// and swallowed by the implementation.
    async fn close(self);
}

/// Creates new sessions for the pool.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: AutomationSession;

    async fn create(&self) -> Result<Self::Session, SessionError>;
}

/// Errors surfaced by the pool and by session implementations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A new session could not be created.
    #[error("Failed to create session: {0}")]
    Create(String),

    /// The session answered but reported an unusable state.
    #[error("Session unhealthy: {0}")]
    Unhealthy(String),

    /// The liveness probe itself failed or timed out.
    #[error("Session probe failed: {0}")]
    Probe(String),

    /// A command sent to the live session failed.
    #[error("Session command failed: {0}")]
    Remote(String),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Point-in-time view of the pool, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub live: bool,
    pub authenticated: bool,
    pub request_count: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Number of sessions created over the pool's lifetime.
    pub generation: u64,
}

struct PoolState<S> {
    session: Option<S>,
    authenticated: bool,
    request_count: u64,
    last_health_check: Option<DateTime<Utc>>,
    generation: u64,
}

impl<S> PoolState<S> {
    fn snapshot(&self) -> SessionState {
        SessionState {
            live: self.session.is_some(),
            authenticated: self.authenticated,
            request_count: self.request_count,
            last_health_check: self.last_health_check,
            generation: self.generation,
        }
    }
}

/// Tunables for [`SessionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Recycle the session once it has been handed out this many times.
    /// Zero disables recycling.
    pub restart_threshold: u64,
    pub probe_timeout: Duration,
    /// How long to wait for a session to release its resources. On expiry
    /// the session is dropped and the pool moves on.
    pub close_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            restart_threshold: DEFAULT_RESTART_THRESHOLD,
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionPool
// ---------------------------------------------------------------------------

/// Owner of the process-wide automation session.
///
/// Construct once at startup and share by reference (or `Arc`).
pub struct SessionPool<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Session>>,
}

impl<F: SessionFactory> SessionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                session: None,
                authenticated: false,
                request_count: 0,
                last_health_check: None,
                generation: 0,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Hand out the session, creating, probing or recycling it as needed.
    ///
    /// Creation failures are returned to the caller as-is; the pool does
    /// not retry them.
    pub async fn acquire(&self) -> Result<SessionLease<'_, F::Session>, SessionError> {
        let mut state = self.state.lock().await;

        if self.config.restart_threshold > 0
            && state.request_count >= self.config.restart_threshold
        {
            tracing::info!(
                request_count = state.request_count,
                threshold = self.config.restart_threshold,
                "Session reached restart threshold, recycling",
            );
            self.close_locked(&mut state).await;
        }

        if let Some(session) = state.session.as_ref() {
            let probe = tokio::time::timeout(self.config.probe_timeout, session.probe()).await;
            state.last_health_check = Some(Utc::now());

            let problem = match probe {
                Ok(Ok(SessionHealth::Healthy)) => None,
                Ok(Ok(SessionHealth::ErrorPage(indicator))) => {
                    Some(SessionError::Unhealthy(format!("error indicator: {indicator}")))
                }
                Ok(Err(e)) => Some(e),
                Err(_) => Some(SessionError::Probe(format!(
                    "timed out after {}ms",
                    self.config.probe_timeout.as_millis()
                ))),
            };

            if let Some(e) = problem {
                tracing::warn!(
                    generation = state.generation,
                    error = %e,
                    "Session failed health check, recreating",
                );
                self.close_locked(&mut state).await;
            }
        }

        if state.session.is_none() {
            let session = self.factory.create().await.map_err(|e| {
                tracing::error!(error = %e, "Session creation failed");
                e
            })?;
            state.session = Some(session);
            state.generation += 1;
            state.last_health_check = Some(Utc::now());
            tracing::info!(generation = state.generation, "Created automation session");
        }

        state.request_count += 1;
        Ok(SessionLease { guard: state })
    }

    /// Lease the current session without probing or counting a use.
    ///
    /// Returns `None` when no session is live. Used to capture failure
    /// diagnostics from whatever state the last attempt left behind.
    pub async fn inspect(&self) -> Option<SessionLease<'_, F::Session>> {
        let state = self.state.lock().await;
        if state.session.is_some() {
            Some(SessionLease { guard: state })
        } else {
            None
        }
    }

    /// Close the session and reset all state. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state).await;
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.snapshot()
    }

    async fn close_locked(&self, state: &mut PoolState<F::Session>) {
        if let Some(session) = state.session.take() {
            tracing::info!(
                generation = state.generation,
                request_count = state.request_count,
                "Closing automation session",
            );
            if tokio::time::timeout(self.config.close_timeout, session.close())
                .await
                .is_err()
            {
                tracing::warn!(
                    generation = state.generation,
                    timeout_ms = self.config.close_timeout.as_millis() as u64,
                    "Session close timed out, abandoning it",
                );
            }
        }
        state.authenticated = false;
        state.request_count = 0;
        state.last_health_check = None;
    }
}

// ---------------------------------------------------------------------------
// SessionLease
// ---------------------------------------------------------------------------

/// Exclusive access to the live session. Holds the pool lock until dropped.
pub struct SessionLease<'a, S> {
    guard: MutexGuard<'a, PoolState<S>>,
}

impl<S> std::fmt::Debug for SessionLease<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").finish_non_exhaustive()
    }
}

impl<S> SessionLease<'_, S> {
    pub fn session(&self) -> &S {
        self.guard
            .session
            .as_ref()
            .expect("a lease is only created over a live session")
    }

    pub fn is_authenticated(&self) -> bool {
        self.guard.authenticated
    }

    /// Record that the session has logged in. Cleared on restart.
    pub fn mark_authenticated(&mut self) {
        self.guard.authenticated = true;
    }

    pub fn request_count(&self) -> u64 {
        self.guard.request_count
    }

    pub fn generation(&self) -> u64 {
        self.guard.generation
    }
}
