use async_trait::async_trait;
use eyre::Result;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Shared shutdown flag handed to every long-running task.
///
/// `stop()` is sticky: once set, the flag never clears for the life of the
/// process. Loops must consult it at every turn and exit promptly.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `total`, waking early if `stop()` is called.
    ///
    /// Polls in 250ms slices so shutdown latency stays bounded even for
    /// long sync periods.
    pub async fn sleep(&self, total: Duration) {
        const SLICE: Duration = Duration::from_millis(250);
        let mut remaining = total;
        while !self.is_stopped() && !remaining.is_zero() {
            let step = remaining.min(SLICE);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
}

/// Start / run-forever / stop / cleanup lifecycle shared by the listener,
/// the processor and the store sweeper.
///
/// `run_forever` implementations loop until the `Shutdown` handle they were
/// constructed with reports stopped, then return. `cleanup` runs after the
/// loop exits, before process teardown.
#[async_trait]
pub trait AsyncTask: Send + Sync {
    /// One-time initialization before the run loop starts.
    async fn setup(&self) -> Result<()>;

    /// The task's main loop. Returns when shut down or on unrecoverable error.
    async fn run_forever(&self) -> Result<()>;

    /// Final teardown after the run loop has exited.
    async fn cleanup(&self) -> Result<()>;
}
