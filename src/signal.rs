//! Ctrl-C handling for evaluation runs.
//!
//! - First Ctrl-C: interrupt. No new queries start; scoring of submitted
//!   queries continues.
//! - Second Ctrl-C: abort. Draining stops and the scorer is shut down.
//! - Third Ctrl-C: exit with code 130.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const EXIT_INTERRUPTED: i32 = 130;

/// Cancellation handed to the evaluation controller. `abort` implies
/// `interrupt`.
#[derive(Clone, Debug)]
pub struct Shutdown {
    abort: CancellationToken,
    interrupt: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        let abort = CancellationToken::new();
        let interrupt = abort.child_token();
        Self { abort, interrupt }
    }

    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    #[cfg(test)]
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate Ctrl-C presses into `shutdown` transitions.
pub fn listen_for_interrupts(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to install Ctrl-C handler");
            return;
        }
        warn!("Interrupt received: finishing scoring for submitted queries (Ctrl-C again to abort)");
        shutdown.interrupt();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Second interrupt: aborting evaluation");
        shutdown.abort();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(EXIT_INTERRUPTED);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_does_not_abort() {
        let shutdown = Shutdown::new();
        shutdown.interrupt();
        assert!(shutdown.is_interrupted());
        assert!(!shutdown.is_aborted());
    }

    #[test]
    fn test_abort_implies_interrupt() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        clone.abort();
        assert!(shutdown.is_aborted());
        assert!(shutdown.is_interrupted());
    }

    #[test]
    fn test_repeated_interrupt_is_harmless() {
        let shutdown = Shutdown::new();
        shutdown.interrupt();
        shutdown.interrupt();
        assert!(shutdown.is_interrupted());
    }
}
