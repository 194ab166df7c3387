//! The remote workflow seam.
//!
//! A [`Workflow`] drives the leased session through one complete pass:
//! upload the input, wait for the remote side to finish, download the
//! result to [`WorkflowRun::output_path`]. The executor re-runs the whole
//! pass on failure, so implementations must be safe to repeat wholesale.

use std::path::PathBuf;

use keymaster_core::types::Job;
use keymaster_session::webdriver::WebDriverError;
use keymaster_session::{AutomationSession, SessionError, SessionLease};

/// Inputs for a single workflow attempt.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub job: Job,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Fresh per attempt. Workflows fold it into any remote name they
    /// create so a retry never collides with a half-finished earlier try.
    pub run_id: String,
    pub input_path: PathBuf,
    /// Where the workflow must leave its result.
    pub output_path: PathBuf,
}

/// Errors from a workflow attempt.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// A remote step timed out or was not ready. Worth another attempt.
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// The session is unusable. The next acquire will recreate it.
    #[error("Session health error: {0}")]
    SessionHealth(String),

    /// The remote side rejected the credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Reading the input or writing the output failed locally.
    #[error("Local I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<WebDriverError> for WorkflowError {
    fn from(e: WebDriverError) -> Self {
        match e {
            WebDriverError::Request(_) => WorkflowError::SessionHealth(e.to_string()),
            _ => WorkflowError::Transient(e.to_string()),
        }
    }
}

impl From<SessionError> for WorkflowError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Remote(_) => WorkflowError::Transient(e.to_string()),
            _ => WorkflowError::SessionHealth(e.to_string()),
        }
    }
}

/// One pass of the remote processing flow over a leased session.
#[async_trait::async_trait]
pub trait Workflow: Send + Sync {
    type Session: AutomationSession;

    async fn run(
        &self,
        lease: &mut SessionLease<'_, Self::Session>,
        run: &WorkflowRun,
    ) -> Result<(), WorkflowError>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn driver_timeouts_are_transient() {
        let err = WorkflowError::from(WebDriverError::Timeout {
            what: "upload".into(),
            timeout: Duration::from_secs(90),
        });
        assert_matches!(err, WorkflowError::Transient(msg) if msg.contains("upload"));
    }

    #[test]
    fn dead_session_is_a_health_error() {
        assert_matches!(
            WorkflowError::from(SessionError::Probe("gone".into())),
            WorkflowError::SessionHealth(_)
        );
        assert_matches!(
            WorkflowError::from(SessionError::Remote("click failed".into())),
            WorkflowError::Transient(_)
        );
    }
}
