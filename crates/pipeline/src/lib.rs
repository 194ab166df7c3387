//! Job orchestration: inbound events become jobs, jobs run through the
//! concurrency gate and the retrying executor, results are aggregated per
//! batch with per-job failure isolation.

pub mod dispatcher;
pub mod event;
pub mod executor;
pub mod gate;
pub mod workflow;

pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, SkippedObject};
pub use event::InboundEvent;
pub use executor::{ArtifactBundle, ExecutionError, ExecutorConfig, JobExecutor, JobRunner};
pub use gate::ConcurrencyGate;
pub use workflow::{Workflow, WorkflowError, WorkflowRun};
