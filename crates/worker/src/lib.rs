//! Queue-driven worker: decodes queue messages, dispatches them through
//! the pipeline and acknowledges only what succeeded.

pub mod payload;
pub mod portal;
pub mod shutdown;
pub mod worker_loop;

pub use payload::{dispatch_payload, DecodedPayload};
pub use portal::{PortalTimeouts, PortalUploadWorkflow};
pub use worker_loop::{WorkerLoop, WorkerSettings, WorkerState, WorkerStats};
