//! Bounded admission for concurrently dispatched jobs.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Semaphore of fixed width. At most `width` futures passed to
/// [`ConcurrencyGate::run`] execute at once; the rest wait in FIFO order.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    width: usize,
}

impl ConcurrencyGate {
    /// A width of zero is treated as one.
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a permit, run `fut`, release the permit.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("gate semaphore is never closed");
        fut.await
    }
}
