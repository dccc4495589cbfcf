//! Two-tier cancellation shared by the scheduler, workers and monitor.
//!
//! *Stop* asks workers to finish their queues and exit. *Kill* asks everyone
//! to abandon queued work immediately and takes precedence over stop.

use tokio_util::sync::CancellationToken;

/// Cloneable handle to the stop and kill signals
#[derive(Clone, Debug, Default)]
pub struct CancellationController {
    stop: CancellationToken,
    kill: CancellationToken,
}

impl CancellationController {
    /// Create a controller with neither signal set
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful drain
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Request immediate termination
    pub fn kill(&self) {
        if !self.kill.is_cancelled() {
            tracing::warn!("Kill requested, abandoning queued work");
        }
        self.kill.cancel();
    }

    /// Whether a graceful drain was requested
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Whether immediate termination was requested
    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Resolves once kill is set
    pub async fn killed(&self) {
        self.kill.cancelled().await
    }

    /// Resolves once stop or kill is set
    pub async fn stopped_or_killed(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.kill.cancelled() => {}
        }
    }

    /// Token that fires with kill, for components that only honour kill
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Child token that fires on kill or when cancelled on its own
    pub fn child_of_kill(&self) -> CancellationToken {
        self.kill.child_token()
    }

    /// Controller for one run: shares kill, owns a fresh stop
    ///
    /// A run ends by setting stop, so each run needs its own. Kill set on
    /// `self` (for example by an interrupt handler) still reaches the run.
    pub fn for_run(&self) -> Self {
        Self {
            stop: CancellationToken::new(),
            kill: self.kill.clone(),
        }
    }
}
