//! Operator notifications.
//!
//! The pipeline reports every job outcome through a [`Notifier`]. Delivery
//! is best-effort: callers log a failed send and move on.

pub mod notifier;
pub mod webhook;

pub use notifier::{NoopNotifier, Notifier, NotifyError};
pub use webhook::WebhookNotifier;
